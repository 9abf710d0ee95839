//! Flow state: per-direction value blocks and the biflow record they join.

use serde::Serialize;

use crate::dynamics::ack::AckTracker;
use crate::dynamics::rtt::BiflowRtt;
use crate::dynamics::rwin::RwinTracker;
use crate::dynamics::tsopt::TsTracker;
use crate::dynamics::{DynConfig, TcpDynamics};
use crate::flowtable::flow_key::FlowKey;
use crate::packet::{PacketInfo, ACK, FIN, MAC_ADDR_LENGTH, RST, SYN, TCP_PROTOCOL};

// Flow close-state bits.
pub(crate) const STATE_RST: u32 = 0x0000_0001;
pub(crate) const STATE_FFIN: u32 = 0x0000_0010;
pub(crate) const STATE_RFIN: u32 = 0x0000_0020;
pub(crate) const STATE_FFINACK: u32 = 0x0000_0040;
pub(crate) const STATE_RFINACK: u32 = 0x0000_0080;
pub(crate) const STATE_FIN: u32 = 0x0000_00F0;

/// Why a flow left the table. The low 7 bits of the exported reason code
/// carry this; the high bit marks a continuation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEndReason {
    /// Idle timeout.
    Idle,
    /// Active timeout.
    Active,
    /// FIN handshake completed or RST observed.
    Closed,
    /// Forced flush at shutdown or rotation.
    Forced,
    /// Evicted at the flow-table size bound.
    Resource,
    /// UDP uniflow forcing.
    UdpForce,
}

impl FlowEndReason {
    /// Wire code, per the IPFIX flowEndReason registry extended with the
    /// UDP forcing value.
    pub fn code(&self) -> u8 {
        match self {
            FlowEndReason::Idle => 1,
            FlowEndReason::Active => 2,
            FlowEndReason::Closed => 3,
            FlowEndReason::Forced => 4,
            FlowEndReason::Resource => 5,
            FlowEndReason::UdpForce => 0x1F,
        }
    }
}

/// One direction of a biflow.
#[derive(Debug, Clone)]
pub struct FlowVal {
    /// IP-layer octet count.
    pub oct: u64,
    /// Application-layer octet count.
    pub appoct: u64,
    /// Packet count.
    pub pkt: u64,
    /// Non-empty packet count.
    pub apppkt: u64,
    /// TCP flags of the first packet.
    pub iflags: u8,
    /// Union of TCP flags of subsequent packets.
    pub uflags: u8,
    /// Minimum observed TTL.
    pub minttl: u8,
    /// Maximum observed TTL.
    pub maxttl: u8,
    /// Interface the direction was observed on.
    pub netif: u8,
    /// TCP dynamics.
    pub tcp: TcpDynamics,
    /// Acknowledgment tracking.
    pub tcpack: AckTracker,
    /// Receiver window tracking.
    pub tcprwin: RwinTracker,
    /// Timestamp option tracking.
    pub tcpts: TsTracker,
}

impl FlowVal {
    fn new(dyncfg: DynConfig) -> Self {
        FlowVal {
            oct: 0,
            appoct: 0,
            pkt: 0,
            apppkt: 0,
            iflags: 0,
            uflags: 0,
            minttl: 0,
            maxttl: 0,
            netif: 0,
            tcp: TcpDynamics::new(dyncfg),
            tcpack: AckTracker::default(),
            tcprwin: RwinTracker::default(),
            tcpts: TsTracker::default(),
        }
    }

    /// Union of all TCP flags seen in this direction.
    #[inline]
    pub fn all_flags(&self) -> u8 {
        self.iflags | self.uflags
    }
}

/// A biflow under measurement or awaiting export.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Flow identifier, unique and strictly increasing within a run.
    pub fid: u64,
    /// Start time, epoch ms.
    pub stime: u64,
    /// End (last packet) time, epoch ms.
    pub etime: u64,
    /// Milliseconds from the first forward packet to the first reverse
    /// packet; `0` if no reverse packet was seen.
    pub rdtime: u32,
    /// Termination reason, set at close.
    pub reason: Option<FlowEndReason>,
    /// Marks the second-or-later segment of a connection broken up by
    /// active-timeout closure.
    pub continued: bool,
    /// Source MAC address of the first forward packet.
    pub smac: [u8; MAC_ADDR_LENGTH],
    /// Destination MAC address of the first forward packet.
    pub dmac: [u8; MAC_ADDR_LENGTH],
    /// Forward direction.
    pub val: FlowVal,
    /// Reverse direction.
    pub rval: FlowVal,
    /// Biflow RTT estimation.
    pub rtt: BiflowRtt,
    /// Flow key, forward orientation.
    pub key: FlowKey,
    pub(crate) state: u32,
}

impl Flow {
    pub(crate) fn new(fid: u64, key: FlowKey, stime: u64, dyncfg: DynConfig) -> Self {
        Flow {
            fid,
            stime,
            etime: stime,
            rdtime: 0,
            reason: None,
            continued: false,
            smac: [0; MAC_ADDR_LENGTH],
            dmac: [0; MAC_ADDR_LENGTH],
            val: FlowVal::new(dyncfg),
            rval: FlowVal::new(dyncfg),
            rtt: BiflowRtt::default(),
            key,
            state: 0,
        }
    }

    /// Applies a packet to this flow. `reverse` selects the direction;
    /// `mac_mode` captures MAC addresses from the first forward packet.
    pub(crate) fn update(&mut self, pkt: &PacketInfo, reverse: bool, mac_mode: bool) {
        // reverse-delta time on the first reverse packet
        if reverse && self.rval.pkt == 0 {
            self.rdtime = pkt.ptime.saturating_sub(self.stime) as u32;
        }

        if !reverse && self.val.pkt == 0 && mac_mode {
            self.smac = pkt.smac;
            self.dmac = pkt.dmac;
        }

        if self.key.proto == TCP_PROTOCOL {
            self.update_tcp(pkt, reverse);
        }

        let val = if reverse { &mut self.rval } else { &mut self.val };

        // TTL extrema
        if val.minttl == 0 || pkt.ipinfo.ttl < val.minttl {
            val.minttl = pkt.ipinfo.ttl;
        }
        if pkt.ipinfo.ttl > val.maxttl {
            val.maxttl = pkt.ipinfo.ttl;
        }
        val.netif = pkt.key.netif;

        val.oct += pkt.iplen as u64;
        val.appoct += pkt.datalen as u64;
        val.pkt += 1;
        if pkt.datalen > 0 {
            val.apppkt += 1;
        }

        if pkt.ptime > self.etime {
            self.etime = pkt.ptime;
        }
    }

    fn update_tcp(&mut self, pkt: &PacketInfo, reverse: bool) {
        let tcp = &pkt.tcpinfo;
        let ms = pkt.ptime;

        let (val, rval) = if reverse {
            (&mut self.rval, &mut self.val)
        } else {
            (&mut self.val, &mut self.rval)
        };

        if val.pkt == 0 {
            val.iflags = tcp.flags;
        } else {
            val.uflags |= tcp.flags;
        }

        // sequence space: the SYN consumes one number, as does a FIN
        if !val.tcp.syn_seen() {
            val.tcp.on_syn(tcp.seq, ms);
        }
        let data_seq = if tcp.flags & SYN != 0 {
            tcp.seq.wrapping_add(1)
        } else {
            tcp.seq
        };
        let mut seq_oct = pkt.datalen;
        if tcp.flags & FIN != 0 {
            seq_oct += 1;
        }
        if seq_oct > 0 {
            val.tcp.on_data(data_seq, seq_oct, ms);
        }

        if tcp.flags & ACK != 0 {
            // the acknowledgment covers the other direction's data
            rval.tcp.on_ack(tcp.ack, ms);
            val.tcpack.on_ack(tcp.ack, tcp.sack, pkt.datalen, ms);
        }

        if tcp.flags & SYN != 0 && tcp.ws != 0 {
            val.tcprwin.set_scale(tcp.ws);
        }
        val.tcprwin.on_segment(tcp.rwin);

        val.tcp
            .on_options(pkt.ipinfo.ecn, tcp.tsval != 0, tcp.ws != 0, tcp.sack != 0, tcp.mss);

        if tcp.tsval != 0 {
            val.tcpts.on_segment(tcp.tsval, ms);
        }

        self.rtt.on_segment(
            tcp.seq, tcp.ack, tcp.tsval, tcp.tsecr, tcp.flags, ms, reverse,
        );

        // FIN handshake and RST state
        if !reverse {
            if tcp.flags & FIN != 0 {
                self.state |= STATE_FFIN;
            }
            if self.state & STATE_RFIN != 0 && tcp.flags & ACK != 0 {
                self.state |= STATE_FFINACK;
            }
        } else {
            if tcp.flags & FIN != 0 {
                self.state |= STATE_RFIN;
            }
            if self.state & STATE_FFIN != 0 && tcp.flags & ACK != 0 {
                self.state |= STATE_RFINACK;
            }
        }
        if tcp.flags & RST != 0 {
            self.state |= STATE_RST;
        }
    }

    /// Both FIN transitions acknowledged, or any RST seen.
    #[inline]
    pub(crate) fn closed_by_state(&self) -> bool {
        self.state & STATE_FIN == STATE_FIN || self.state & STATE_RST != 0
    }

    /// Finalizes per-direction accounting and records the close reason.
    pub(crate) fn close(&mut self, reason: FlowEndReason) {
        self.val.tcp.close();
        self.rval.tcp.close();
        self.reason = Some(reason);
    }

    /// Exported reason code with the continuation bit.
    pub fn reason_code(&self) -> u8 {
        let code = self.reason.map_or(0, |r| r.code());
        if self.continued {
            code | 0x80
        } else {
            code
        }
    }
}
