//! Decoded packet context consumed by the engine.
//!
//! The engine does not parse link-layer frames; an upstream decoder (live
//! capture or trace reader, with any fragment reassembly already applied)
//! supplies one [`PacketInfo`] per fully reassembled packet.

use anyhow::Result;

use crate::flowtable::flow_key::FlowKey;

/// IP protocol number for ICMP.
pub const ICMP_PROTOCOL: u8 = 1;
/// IP protocol number for TCP.
pub const TCP_PROTOCOL: u8 = 6;
/// IP protocol number for UDP.
pub const UDP_PROTOCOL: u8 = 17;
/// IP protocol number for ICMPv6.
pub const ICMP6_PROTOCOL: u8 = 58;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// Length of an Ethernet MAC address.
pub const MAC_ADDR_LENGTH: usize = 6;

/// IP-layer fields the flow meter observes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpInfo {
    /// Time to live (hop limit for IPv6).
    pub ttl: u8,
    /// ECN codepoint from the traffic class byte, low two bits.
    pub ecn: u8,
}

/// TCP header and option fields the flow meter observes.
///
/// Option fields use `0` to mean "not present"; a window scale of zero or a
/// bare SACK-permitted option are represented by their tracker sentinels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpInfo {
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number.
    pub ack: u32,
    /// Flag byte.
    pub flags: u8,
    /// Unscaled receive window.
    pub rwin: u16,
    /// Timestamp option value, `0` when absent.
    pub tsval: u32,
    /// Timestamp option echo reply, `0` when absent.
    pub tsecr: u32,
    /// MSS option value, `0` when absent.
    pub mss: u16,
    /// Window scale option value, `0` when absent.
    pub ws: u8,
    /// Right edge of the first SACK block;
    /// [`SACK_OK`](crate::dynamics::ack::SACK_OK) for a bare
    /// SACK-permitted option, `0` when absent.
    pub sack: u32,
}

/// A fully decoded and reassembled packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    /// Observation timestamp, epoch milliseconds.
    pub ptime: u64,
    /// Flow key fields (addresses, ports, protocol, VLAN, interface).
    pub key: FlowKey,
    /// IP-layer length in octets.
    pub iplen: u32,
    /// Application payload length in octets.
    pub datalen: u32,
    /// IP-layer fields.
    pub ipinfo: IpInfo,
    /// TCP fields; zeroed for non-TCP packets.
    pub tcpinfo: TcpInfo,
    /// Source MAC address.
    pub smac: [u8; MAC_ADDR_LENGTH],
    /// Destination MAC address.
    pub dmac: [u8; MAC_ADDR_LENGTH],
}

/// Abstract packet supply the engine pulls from.
///
/// Implementations block until a packet is available and return `Ok(None)`
/// at end of stream. The engine never touches flow state while waiting.
pub trait PacketSource {
    fn next_packet(&mut self) -> Result<Option<PacketInfo>>;
}

/// A packet source over any iterator of packets, used for replay in tests.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = PacketInfo>,
{
    pub fn new<T: IntoIterator<IntoIter = I, Item = PacketInfo>>(iter: T) -> Self {
        IterSource {
            inner: iter.into_iter(),
        }
    }
}

impl<I> PacketSource for IterSource<I>
where
    I: Iterator<Item = PacketInfo>,
{
    fn next_packet(&mut self) -> Result<Option<PacketInfo>> {
        Ok(self.inner.next())
    }
}
