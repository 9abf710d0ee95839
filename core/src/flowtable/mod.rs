//! Flow table: biflow state management.
//!
//! Maps flow keys to in-progress biflows. A packet probes the table with
//! its forward key, then the reversed key; a reverse match means the packet
//! belongs to the reverse direction of an existing biflow. The table keeps
//! flows in least-recently-touched order so timeout eviction only examines
//! the cold end, and parks closed flows on a close queue until the exporter
//! drains them.
//!
//! All time in this module comes from packet timestamps; the table clock
//! advances only when a packet with a newer timestamp is admitted.

pub mod flow;
pub mod flow_key;

use anyhow::Result;
use hashlink::linked_hash_map::RawEntryMut;
use hashlink::LinkedHashMap;

use self::flow::{Flow, FlowEndReason};
use self::flow_key::FlowKey;
use crate::config::FlowTableConfig;
use crate::dynamics::DynConfig;
use crate::packet::{PacketInfo, UDP_PROTOCOL};

use std::collections::VecDeque;

/// Minimum interval between flush passes, ms.
const FLUSH_DELAY_MS: u64 = 5000;

/// Close-queue depth that overrides the flush rate limit.
const MAX_CLOSE_QUEUE: usize = 2500;

/// Configurable options for a `FlowTable`.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Idle timeout: maximum inter-packet gap, ms.
    pub idle_ms: u64,
    /// Active timeout: maximum flow lifetime, ms.
    pub active_ms: u64,
    /// Maximum number of flows in the table; `0` means unbounded.
    pub max_flows: usize,
    /// Emit each biflow as two uniflow records.
    pub uniflow: bool,
    /// Clamp exported counters to 32 bits and roll flows over before an
    /// octet counter overflows.
    pub silk: bool,
    /// Capture MAC addresses from the first forward packet.
    pub mac: bool,
    /// Export extended per-direction statistics.
    pub stats: bool,
    /// Admit out-of-sequence packets without advancing the table clock
    /// instead of dropping them.
    pub force_read_all: bool,
    /// Close UDP flows on this port immediately after their first packet;
    /// `1` matches every port, `0` disables.
    pub udp_uniflow_port: u16,
    /// Per-direction TCP tracking buffers.
    pub dyncfg: DynConfig,
}

impl From<&FlowTableConfig> for TableConfig {
    fn from(config: &FlowTableConfig) -> Self {
        TableConfig {
            idle_ms: config.idle_timeout_ms,
            active_ms: config.active_timeout_ms,
            max_flows: config.max_flows,
            uniflow: config.uniflow,
            silk: config.silk,
            mac: config.mac,
            stats: config.stats,
            force_read_all: config.force_read_all,
            udp_uniflow_port: config.udp_uniflow_port,
            dyncfg: DynConfig {
                bitmap_capacity: config.rtx_span,
                bitmap_scale: config.rtx_scale,
                ring_capacity: config.rtt_ring_capacity,
            },
        }
    }
}

/// Running totals the table maintains for the process statistics record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    /// Packets admitted.
    pub packets: u64,
    /// IP octets admitted.
    pub octets: u64,
    /// Out-of-sequence packets observed.
    pub seqrej: u64,
    /// Biflows handed to the exporter.
    pub flows: u64,
    /// Drained biflows with no reverse packets.
    pub uniflows: u64,
    /// Peak table size.
    pub peak: usize,
    /// Flush passes run.
    pub flush_events: u64,
}

/// Manages state for all flows in the measurement.
pub struct FlowTable {
    config: TableConfig,
    next_fid: u64,
    /// Table clock: the newest packet timestamp admitted, epoch ms.
    ctime: u64,
    /// Time of the last flush pass, epoch ms.
    flushtime: u64,
    /// Key index in least-recently-touched order (coldest flow first).
    table: LinkedHashMap<FlowKey, Flow>,
    /// Closed flows awaiting export.
    cq: VecDeque<Flow>,
    stats: TableStats,
}

impl FlowTable {
    pub fn new(config: TableConfig) -> Self {
        let table = LinkedHashMap::with_capacity(config.max_flows);
        FlowTable {
            config,
            next_fid: 1,
            ctime: 0,
            flushtime: 0,
            table,
            cq: VecDeque::new(),
            stats: TableStats::default(),
        }
    }

    /// Returns the number of active flows.
    #[inline]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Returns the table clock, epoch ms.
    #[inline]
    pub fn current_time(&self) -> u64 {
        self.ctime
    }

    #[inline]
    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    /// Number of closed flows awaiting export.
    #[inline]
    pub fn close_queue_len(&self) -> usize {
        self.cq.len()
    }

    /// Admits a single packet.
    ///
    /// Per-packet anomalies are absorbed and counted, never surfaced.
    pub fn admit(&mut self, pkt: &PacketInfo) {
        let oos = pkt.ptime < self.ctime;
        if oos {
            self.stats.seqrej += 1;
            if !self.config.force_read_all {
                return;
            }
            log::debug!("admitting out-of-sequence packet at {}", pkt.ptime);
        } else {
            self.ctime = pkt.ptime;
        }

        self.stats.packets += 1;
        self.stats.octets += pkt.iplen as u64;

        let (mut key, mut reverse, mut exists) = self.locate(&pkt.key);

        // timeout rollover happens on the touched flow before dispatch; the
        // rolled-over packet becomes the forward direction of the fresh flow
        let mut continued = false;
        if exists && !oos {
            let (stime, etime, dir_oct) = {
                let flow = self.table.get(&key).expect("located flow in table");
                let oct = if reverse { flow.rval.oct } else { flow.val.oct };
                (flow.stime, flow.etime, oct)
            };
            let overflow =
                self.config.silk && dir_oct + pkt.iplen as u64 > u32::MAX as u64;
            let rollover = if pkt.ptime - stime > self.config.active_ms || overflow {
                self.close_flow(&key, FlowEndReason::Active);
                continued = true;
                true
            } else if pkt.ptime - etime > self.config.idle_ms {
                self.close_flow(&key, FlowEndReason::Idle);
                true
            } else {
                false
            };
            if rollover {
                exists = false;
                key = pkt.key;
                reverse = false;
            }
        }

        if !exists {
            // force-close the coldest flow rather than exceed the bound
            if self.config.max_flows > 0 && self.table.len() >= self.config.max_flows {
                self.evict_front(FlowEndReason::Resource);
            }
            let mut flow = Flow::new(self.next_fid, key, pkt.ptime, self.config.dyncfg);
            self.next_fid += 1;
            flow.continued = continued;
            self.table.insert(key, flow);
            if self.table.len() > self.stats.peak {
                self.stats.peak = self.table.len();
            }
        }

        let mac_mode = self.config.mac;
        let mut closed = false;
        match self.table.raw_entry_mut().from_key(&key) {
            RawEntryMut::Occupied(mut occupied) => {
                let flow = occupied.get_mut();
                flow.update(pkt, reverse, mac_mode);
                if flow.closed_by_state() {
                    closed = true;
                } else {
                    occupied.to_back();
                }
            }
            RawEntryMut::Vacant(_) => {
                unreachable!("flow table index out of sync with admission")
            }
        }

        if pkt.key.proto == UDP_PROTOCOL && self.udp_force_match(&pkt.key) {
            self.close_flow(&key, FlowEndReason::UdpForce);
        } else if closed {
            self.close_flow(&key, FlowEndReason::Closed);
        }
    }

    /// Probes for the flow a key belongs to.
    ///
    /// Returns the table key, whether the packet is in the reverse
    /// direction, and whether the flow exists.
    fn locate(&self, key: &FlowKey) -> (FlowKey, bool, bool) {
        if self.table.contains_key(key) {
            return (*key, false, true);
        }
        let rkey = key.reverse();
        if self.table.contains_key(&rkey) {
            return (rkey, true, true);
        }
        (*key, false, false)
    }

    fn udp_force_match(&self, key: &FlowKey) -> bool {
        match self.config.udp_uniflow_port {
            0 => false,
            1 => true,
            port => key.sp == port || key.dp == port,
        }
    }

    /// Unlinks a flow from the index and appends it to the close queue.
    fn close_flow(&mut self, key: &FlowKey, reason: FlowEndReason) {
        if let Some(mut flow) = self.table.remove(key) {
            flow.close(reason);
            log::debug!("closing flow {} reason {:?}", flow.fid, reason);
            self.cq.push_back(flow);
        }
    }

    fn evict_front(&mut self, reason: FlowEndReason) {
        if let Some((_, mut flow)) = self.table.pop_front() {
            flow.close(reason);
            log::debug!("evicting flow {} reason {:?}", flow.fid, reason);
            self.cq.push_back(flow);
        }
    }

    /// Runs an eviction pass and drains the close queue through `write`.
    ///
    /// Rate limited: unless `force` is set, a pass only runs when the
    /// flush interval has elapsed or the close queue has grown past its
    /// watermark. A `write` failure stops the drain and propagates; flows
    /// already handed over are not re-sent.
    pub fn flush<F>(&mut self, force: bool, write: &mut F) -> Result<()>
    where
        F: FnMut(Flow) -> Result<()>,
    {
        if !force
            && self.flushtime > 0
            && self.ctime < self.flushtime + FLUSH_DELAY_MS
            && self.cq.len() < MAX_CLOSE_QUEUE
        {
            return Ok(());
        }

        self.flushtime = self.ctime;
        self.stats.flush_events += 1;

        loop {
            let cold_etime = match self.table.front() {
                Some((_, flow)) => flow.etime,
                None => break,
            };
            if self.ctime.saturating_sub(cold_etime) > self.config.idle_ms {
                self.evict_front(FlowEndReason::Idle);
            } else {
                break;
            }
        }

        while self.config.max_flows > 0 && self.table.len() >= self.config.max_flows {
            self.evict_front(FlowEndReason::Resource);
        }

        if force {
            while !self.table.is_empty() {
                self.evict_front(FlowEndReason::Forced);
            }
        }

        while let Some(flow) = self.cq.pop_front() {
            if flow.rval.pkt == 0 {
                self.stats.uniflows += 1;
            }
            self.stats.flows += 1;
            write(flow)?;
        }

        Ok(())
    }
}
