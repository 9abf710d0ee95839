//! Exported flow records.

use std::net::IpAddr;

use serde::Serialize;

use crate::flowtable::flow::FlowEndReason;
use crate::ifmap::NetDirection;
use crate::utils::streamstat::StreamStats;

/// Min/max/mean summary of a statistics stream.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatSummary {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
}

impl StatSummary {
    /// Summarizes a stream, or `None` if it never saw an observation.
    pub fn of(stats: &StreamStats) -> Option<StatSummary> {
        if stats.count() == 0 {
            return None;
        }
        Some(StatSummary {
            min: stats.min(),
            max: stats.max(),
            mean: stats.mean(),
        })
    }
}

/// One direction of an exported biflow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSide {
    /// TCP flags of the first packet.
    pub iflags: u8,
    /// Union of TCP flags of subsequent packets.
    pub uflags: u8,
    /// IP octet count.
    pub oct: u64,
    /// Application octet count.
    pub appoct: u64,
    /// Packet count.
    pub pkt: u64,
    /// Non-empty packet count.
    pub apppkt: u64,
    /// Minimum observed TTL.
    pub minttl: u8,
    /// Maximum observed TTL.
    pub maxttl: u8,
    /// Initial TCP sequence number.
    pub isn: u32,
    /// Sequence numbers consumed, excluding SYN and FIN.
    pub seq_count: u64,
    /// Sequence space wraparounds.
    pub wrap_count: u32,
    /// Retransmitted segments detected.
    pub rtx_count: u64,
    /// Reordered segments detected.
    pub reorder_count: u64,
    /// Maximum observed reordering, octets.
    pub reorder_max: u32,
    /// Octets shifted out of the observation window unseen.
    pub loss_count: u64,
    /// Maximum observed octets in flight.
    pub inflight_max: u32,
    /// Observed maximum segment size.
    pub mss: u16,
    /// MSS declared in the TCP options.
    pub mss_declared: u16,
    /// RTT summary; absent below the configured sample minimum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<StatSummary>,
    /// Scaled receive window summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rwin: Option<StatSummary>,
    /// Receive-window stall transitions.
    pub rwin_stall_count: u64,
    /// Duplicate acknowledgments.
    pub dup_ack_count: u64,
    /// Selective acknowledgments.
    pub sack_count: u64,
    /// Estimated timestamp clock frequency, Hz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_hz: Option<StatSummary>,
    /// ECN and TCP option presence flags.
    pub opt_flags: u32,
    /// Non-empty segment interarrival summary, with extended statistics
    /// enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat_ms: Option<StatSummary>,
    /// Interface the direction was observed on.
    pub netif: u8,
}

/// An exported biflow (or a split uniflow, when `rev` is absent).
#[derive(Debug, Clone, Serialize)]
pub struct BiflowRecord {
    /// Flow identifier.
    pub fid: u64,
    /// Start time, epoch ms.
    pub stime: u64,
    /// End time, epoch ms.
    pub etime: u64,
    /// Milliseconds to the first reverse packet; `0` when none was seen.
    pub rdtime: u32,
    /// Source address.
    pub sip: IpAddr,
    /// Destination address.
    pub dip: IpAddr,
    /// Source port.
    pub sp: u16,
    /// Destination port.
    pub dp: u16,
    /// IP protocol.
    pub proto: u8,
    /// VLAN identifier.
    pub vlan: u16,
    /// Termination reason.
    pub reason: FlowEndReason,
    /// Reason code with the continuation bit.
    pub reason_code: u8,
    /// Source MAC address, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smac: Option<[u8; 6]>,
    /// Destination MAC address, when captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dmac: Option<[u8; 6]>,
    /// Ingress interface from the interface map.
    pub ingress: u8,
    /// Egress interface from the interface map.
    pub egress: u8,
    /// Direction relative to the configured source networks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<NetDirection>,
    /// Forward direction counters.
    pub fwd: FlowSide,
    /// Reverse direction counters; absent in a split uniflow record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<FlowSide>,
    /// Smoothed biflow RTT, ms; absent before the first fused sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<StatSummary>,
}
