//! Address-to-interface and direction classification maps.
//!
//! Each map is a pair of sorted range arrays, one per IP version, searched
//! by binary search. Ranges are inclusive `[low, high]` pairs expanded from
//! CIDR prefixes at insertion. Overlap between configured prefixes is not
//! rejected; the first range the search converges on wins.

use ipnet::{Ipv4Net, Ipv6Net};

use crate::flowtable::flow_key::{AddrPair, FlowKey};
use crate::packet::MAC_ADDR_LENGTH;

/// Sorted inclusive-range map from addresses to a small value.
#[derive(Debug, Clone, Default)]
struct RangeMap<A: Ord + Copy> {
    entries: Vec<(A, A, u8)>,
}

impl<A: Ord + Copy> RangeMap<A> {
    /// Inserts `[lo, hi] -> value`, keeping entries sorted by range start.
    fn insert(&mut self, lo: A, hi: A, value: u8) {
        let at = self
            .entries
            .partition_point(|&(start, _, _)| start < lo);
        self.entries.insert(at, (lo, hi, value));
    }

    /// Binary search for the range containing `addr`; `0` when none does.
    fn lookup(&self, addr: A) -> u8 {
        let mut x = 0isize;
        let mut y = self.entries.len() as isize - 1;
        while x <= y {
            let i = ((x + y) / 2) as usize;
            let (lo, hi, value) = self.entries[i];
            if addr >= lo && addr <= hi {
                return value;
            } else if hi < addr {
                x = i as isize + 1;
            } else {
                y = i as isize - 1;
            }
        }
        0
    }
}

fn v4_bounds(net: Ipv4Net) -> (u32, u32) {
    (net.network().into(), net.broadcast().into())
}

fn v6_bounds(net: Ipv6Net) -> (u128, u128) {
    (net.network().into(), net.broadcast().into())
}

fn key_addrs(key: &FlowKey) -> (u128, u128, bool) {
    match key.addr {
        AddrPair::V4 { sip, dip } => (
            u32::from_be_bytes(sip) as u128,
            u32::from_be_bytes(dip) as u128,
            true,
        ),
        AddrPair::V6 { sip, dip } => (
            u128::from_be_bytes(sip),
            u128::from_be_bytes(dip),
            false,
        ),
    }
}

/// Maps flow keys to (ingress, egress) logical interface numbers.
///
/// The source address selects the ingress interface, the destination
/// address the egress interface; `0` means unmapped.
#[derive(Debug, Clone, Default)]
pub struct IfMap {
    src4: RangeMap<u32>,
    dst4: RangeMap<u32>,
    src6: RangeMap<u128>,
    dst6: RangeMap<u128>,
}

impl IfMap {
    pub fn add_v4(&mut self, net: Ipv4Net, ingress: u8, egress: u8) {
        let (lo, hi) = v4_bounds(net);
        if ingress != 0 {
            self.src4.insert(lo, hi, ingress);
        }
        if egress != 0 {
            self.dst4.insert(lo, hi, egress);
        }
    }

    pub fn add_v6(&mut self, net: Ipv6Net, ingress: u8, egress: u8) {
        let (lo, hi) = v6_bounds(net);
        if ingress != 0 {
            self.src6.insert(lo, hi, ingress);
        }
        if egress != 0 {
            self.dst6.insert(lo, hi, egress);
        }
    }

    /// Looks up the interface pair for a flow key.
    pub fn addresses(&self, key: &FlowKey) -> (u8, u8) {
        match key.addr {
            AddrPair::V4 { sip, dip } => (
                self.src4.lookup(u32::from_be_bytes(sip)),
                self.dst4.lookup(u32::from_be_bytes(dip)),
            ),
            AddrPair::V6 { sip, dip } => (
                self.src6.lookup(u128::from_be_bytes(sip)),
                self.dst6.lookup(u128::from_be_bytes(dip)),
            ),
        }
    }
}

/// Flow direction relative to the configured source networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetDirection {
    /// Source inside, destination outside.
    In,
    /// Source outside, destination inside.
    Out,
    /// Both endpoints outside.
    External,
    /// Both endpoints inside.
    Internal,
}

/// Membership list of "internal" networks for direction classification.
#[derive(Debug, Clone, Default)]
pub struct NetList {
    v4: RangeMap<u32>,
    v6: RangeMap<u128>,
}

impl NetList {
    pub fn add_v4(&mut self, net: Ipv4Net) {
        let (lo, hi) = v4_bounds(net);
        self.v4.insert(lo, hi, 1);
    }

    pub fn add_v6(&mut self, net: Ipv6Net) {
        let (lo, hi) = v6_bounds(net);
        self.v6.insert(lo, hi, 1);
    }

    /// Classifies a flow by source/destination membership.
    pub fn direction(&self, key: &FlowKey) -> NetDirection {
        let (src, dst, is_v4) = key_addrs(key);
        let (ss, ds) = if is_v4 {
            (self.v4.lookup(src as u32), self.v4.lookup(dst as u32))
        } else {
            (self.v6.lookup(src), self.v6.lookup(dst))
        };
        match (ss != 0, ds != 0) {
            (true, true) => NetDirection::Internal,
            (true, false) => NetDirection::In,
            (false, true) => NetDirection::Out,
            (false, false) => NetDirection::External,
        }
    }
}

/// Sorted list of MAC addresses marking source-side interfaces.
#[derive(Debug, Clone, Default)]
pub struct MacList {
    macs: Vec<[u8; MAC_ADDR_LENGTH]>,
}

impl MacList {
    pub fn add(&mut self, mac: [u8; MAC_ADDR_LENGTH]) {
        let at = self.macs.partition_point(|m| m < &mac);
        self.macs.insert(at, mac);
    }

    pub fn contains(&self, mac: &[u8; MAC_ADDR_LENGTH]) -> bool {
        self.macs.binary_search(mac).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TCP_PROTOCOL;

    fn key(sip: [u8; 4], dip: [u8; 4]) -> FlowKey {
        FlowKey::v4(sip, dip, 1, 2, TCP_PROTOCOL)
    }

    #[test]
    fn core_ifmap_v4_lookup() {
        let mut map = IfMap::default();
        map.add_v4("10.0.0.0/8".parse().unwrap(), 1, 2);
        map.add_v4("192.168.1.0/24".parse().unwrap(), 3, 4);

        let k = key([10, 1, 2, 3], [192, 168, 1, 77]);
        assert_eq!(map.addresses(&k), (1, 4));

        let unmapped = key([172, 16, 0, 1], [8, 8, 8, 8]);
        assert_eq!(map.addresses(&unmapped), (0, 0));
    }

    #[test]
    fn core_ifmap_range_boundaries() {
        let mut map = IfMap::default();
        map.add_v4("10.0.0.0/24".parse().unwrap(), 7, 7);
        assert_eq!(map.addresses(&key([10, 0, 0, 0], [10, 0, 0, 255])), (7, 7));
        assert_eq!(map.addresses(&key([10, 0, 1, 0], [9, 255, 255, 255])), (0, 0));
    }

    #[test]
    fn core_ifmap_v6_lookup() {
        let mut map = IfMap::default();
        map.add_v6("2001:db8::/32".parse().unwrap(), 5, 6);
        let mut sip = [0u8; 16];
        sip[0] = 0x20;
        sip[1] = 0x01;
        sip[2] = 0x0d;
        sip[3] = 0xb8;
        sip[15] = 1;
        let dip = [0xfeu8; 16];
        let k = FlowKey::new(AddrPair::V6 { sip, dip }, 1, 2, TCP_PROTOCOL, 0, 0);
        assert_eq!(map.addresses(&k), (5, 0));
    }

    #[test]
    fn core_netlist_direction() {
        let mut nets = NetList::default();
        nets.add_v4("10.0.0.0/8".parse().unwrap());

        assert_eq!(
            nets.direction(&key([10, 0, 0, 1], [8, 8, 8, 8])),
            NetDirection::In
        );
        assert_eq!(
            nets.direction(&key([8, 8, 8, 8], [10, 0, 0, 1])),
            NetDirection::Out
        );
        assert_eq!(
            nets.direction(&key([10, 0, 0, 1], [10, 9, 9, 9])),
            NetDirection::Internal
        );
        assert_eq!(
            nets.direction(&key([8, 8, 8, 8], [9, 9, 9, 9])),
            NetDirection::External
        );
    }

    #[test]
    fn core_maclist_membership() {
        let mut macs = MacList::default();
        macs.add([0xaa, 0xbb, 0xcc, 0, 0, 1]);
        macs.add([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert!(macs.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 1]));
        assert!(!macs.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 2]));
    }

    #[test]
    fn core_ifmap_first_match_wins_on_overlap() {
        let mut map = IfMap::default();
        map.add_v4("10.0.0.0/8".parse().unwrap(), 1, 1);
        map.add_v4("10.0.0.0/16".parse().unwrap(), 2, 2);
        // overlap detection is advisory; lookup returns whichever range
        // the search converges on first
        let got = map.addresses(&key([10, 0, 0, 1], [10, 0, 0, 1]));
        assert!(got.0 == 1 || got.0 == 2);
    }
}
