//! Biflow key.
//!
//! A flow is identified by its five-tuple plus VLAN and (optionally) the
//! physical interface it was observed on. The reverse direction of a biflow
//! is found by probing the table with the reversed key.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::packet::{ICMP6_PROTOCOL, ICMP_PROTOCOL};

/// Address pair, tagged by IP version.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub enum AddrPair {
    V4 { sip: [u8; 4], dip: [u8; 4] },
    V6 { sip: [u8; 16], dip: [u8; 16] },
}

impl AddrPair {
    fn reverse(&self) -> AddrPair {
        match *self {
            AddrPair::V4 { sip, dip } => AddrPair::V4 { sip: dip, dip: sip },
            AddrPair::V6 { sip, dip } => AddrPair::V6 { sip: dip, dip: sip },
        }
    }
}

/// A flow key.
///
/// Two keys are equal iff every field is equal; the VLAN identifier is
/// masked to its low 12 bits at construction so priority and CFI bits do
/// not split flows.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub struct FlowKey {
    /// Source transport port; type and code for ICMP.
    pub sp: u16,
    /// Destination transport port.
    pub dp: u16,
    /// IP protocol.
    pub proto: u8,
    /// VLAN identifier, low 12 bits.
    pub vlan: u16,
    /// Physical interface number, `0` when not distinguished.
    pub netif: u8,
    /// Source and destination addresses.
    pub addr: AddrPair,
}

impl FlowKey {
    pub fn new(
        addr: AddrPair,
        sp: u16,
        dp: u16,
        proto: u8,
        vlan: u16,
        netif: u8,
    ) -> Self {
        FlowKey {
            sp,
            dp,
            proto,
            vlan: vlan & 0x0FFF,
            netif,
            addr,
        }
    }

    /// Convenience constructor for an IPv4 TCP/UDP key.
    pub fn v4(sip: [u8; 4], dip: [u8; 4], sp: u16, dp: u16, proto: u8) -> Self {
        FlowKey::new(AddrPair::V4 { sip, dip }, sp, dp, proto, 0, 0)
    }

    /// IP version tag.
    #[inline]
    pub fn version(&self) -> u8 {
        match self.addr {
            AddrPair::V4 { .. } => 4,
            AddrPair::V6 { .. } => 6,
        }
    }

    /// Returns the key of the reverse direction.
    ///
    /// Ports are not swapped for ICMP, where they carry type and code.
    pub fn reverse(&self) -> FlowKey {
        let (sp, dp) = if self.proto == ICMP_PROTOCOL || self.proto == ICMP6_PROTOCOL {
            (self.sp, self.dp)
        } else {
            (self.dp, self.sp)
        };
        FlowKey {
            sp,
            dp,
            proto: self.proto,
            vlan: self.vlan,
            netif: self.netif,
            addr: self.addr.reverse(),
        }
    }

    /// Source address as a std [`IpAddr`].
    pub fn src_addr(&self) -> IpAddr {
        match self.addr {
            AddrPair::V4 { sip, .. } => IpAddr::V4(Ipv4Addr::from(sip)),
            AddrPair::V6 { sip, .. } => IpAddr::V6(Ipv6Addr::from(sip)),
        }
    }

    /// Destination address as a std [`IpAddr`].
    pub fn dst_addr(&self) -> IpAddr {
        match self.addr {
            AddrPair::V4 { dip, .. } => IpAddr::V4(Ipv4Addr::from(dip)),
            AddrPair::V6 { dip, .. } => IpAddr::V6(Ipv6Addr::from(dip)),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} protocol {}",
            self.src_addr(),
            self.sp,
            self.dst_addr(),
            self.dp,
            self.proto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TCP_PROTOCOL;

    #[test]
    fn core_key_reverse_involution() {
        let key = FlowKey::v4([10, 0, 0, 1], [10, 0, 0, 2], 443, 51000, TCP_PROTOCOL);
        assert_eq!(key.reverse().reverse(), key);
        assert_ne!(key.reverse(), key);
    }

    #[test]
    fn core_key_icmp_ports_not_swapped() {
        let key = FlowKey::v4([10, 0, 0, 1], [10, 0, 0, 2], 0x0800, 0, ICMP_PROTOCOL);
        let rev = key.reverse();
        assert_eq!(rev.sp, key.sp);
        assert_eq!(rev.dp, key.dp);
        assert_ne!(rev.addr, key.addr);
    }

    #[test]
    fn core_key_vlan_masked() {
        let a = FlowKey::new(
            AddrPair::V4 {
                sip: [1, 1, 1, 1],
                dip: [2, 2, 2, 2],
            },
            1,
            2,
            TCP_PROTOCOL,
            0xF064,
            0,
        );
        let b = FlowKey::new(
            AddrPair::V4 {
                sip: [1, 1, 1, 1],
                dip: [2, 2, 2, 2],
            },
            1,
            2,
            TCP_PROTOCOL,
            0x0064,
            0,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn core_key_v6_reverse() {
        let mut sip = [0u8; 16];
        sip[15] = 1;
        let mut dip = [0u8; 16];
        dip[15] = 2;
        let key = FlowKey::new(AddrPair::V6 { sip, dip }, 80, 5000, TCP_PROTOCOL, 0, 0);
        let rev = key.reverse();
        assert_eq!(rev.sp, 5000);
        assert_eq!(rev.dp, 80);
        assert_eq!(rev.reverse(), key);
        assert_eq!(key.version(), 6);
    }
}
