//! Process statistics.
//!
//! A running tally of everything the engine has seen, emitted periodically
//! and at shutdown alongside the flow records.

use serde::Serialize;

use crate::flowtable::TableStats;

/// Process statistics record.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsRecord {
    /// Engine start, epoch ms (wall clock).
    pub system_init_time_ms: u64,
    /// Biflows handed to the exporter.
    pub exported_flow_total_count: u64,
    /// Packets admitted to the flow table.
    pub packet_total_count: u64,
    /// Packets dropped upstream of the engine.
    pub dropped_packet_total_count: u64,
    /// Packets ignored as out-of-sequence.
    pub ignored_packet_total_count: u64,
    /// Packets admitted but not represented in any exported record.
    pub not_sent_packet_total_count: u64,
    /// Fragments expired before reassembly, reported by the decoder.
    pub expired_fragment_count: u32,
    /// Fragments reassembled by the decoder.
    pub assembled_fragment_count: u32,
    /// Flow table flush passes.
    pub flow_table_flush_events: u64,
    /// Peak flow table size.
    pub flow_table_peak_count: usize,
    /// Mean exported-flow rate over the run, flows per second.
    pub mean_flow_rate: u32,
    /// Mean packet rate over the run, packets per second.
    pub mean_packet_rate: u32,
}

impl StatsRecord {
    /// Builds a snapshot from the table counters and engine context.
    pub fn snapshot(
        init_time_ms: u64,
        now_ms: u64,
        table: &TableStats,
        dropped: u64,
        expired_fragments: u32,
        assembled_fragments: u32,
    ) -> Self {
        let elapsed_s = (now_ms.saturating_sub(init_time_ms) as f64 / 1000.0).max(f64::MIN_POSITIVE);
        StatsRecord {
            system_init_time_ms: init_time_ms,
            exported_flow_total_count: table.flows,
            packet_total_count: table.packets,
            dropped_packet_total_count: dropped,
            ignored_packet_total_count: table.seqrej,
            not_sent_packet_total_count: 0,
            expired_fragment_count: expired_fragments,
            assembled_fragment_count: assembled_fragments,
            flow_table_flush_events: table.flush_events,
            flow_table_peak_count: table.peak,
            mean_flow_rate: (table.flows as f64 / elapsed_s) as u32,
            mean_packet_rate: (table.packets as f64 / elapsed_s) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_stats_snapshot_rates() {
        let table = TableStats {
            packets: 2000,
            octets: 0,
            seqrej: 3,
            flows: 100,
            uniflows: 5,
            peak: 42,
            flush_events: 7,
        };
        let rec = StatsRecord::snapshot(1000, 11_000, &table, 1, 0, 0);
        assert_eq!(rec.mean_packet_rate, 200);
        assert_eq!(rec.mean_flow_rate, 10);
        assert_eq!(rec.ignored_packet_total_count, 3);
        assert_eq!(rec.flow_table_peak_count, 42);
    }
}
