//! The measurement engine.
//!
//! A cooperative, single-threaded loop: pull one packet from the source,
//! admit it to the flow table, run the (rate-limited) flush pass, and hand
//! closed flows to the exporter. Packet timestamps drive every flow-state
//! time comparison; the wall clock appears only in rotation file naming
//! and the process statistics record.
//!
//! The packet source may run on a second thread feeding a bounded channel
//! (see [`spawn_source`]); the engine itself never shares flow state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};

use crate::config::{ExportConfig, RuntimeConfig};
use crate::export::{Exporter, RecordAssembler};
use crate::flowtable::{FlowTable, TableConfig};
use crate::packet::{PacketInfo, PacketSource};
use crate::stats::StatsRecord;

/// The flow measurement engine.
pub struct Engine<E: Exporter> {
    table: FlowTable,
    assembler: RecordAssembler,
    exporter: E,
    export_cfg: ExportConfig,
    is_running: Arc<AtomicBool>,
    /// Engine construction time, epoch ms (wall clock).
    init_time_ms: u64,
    /// Next rotation boundary, packet time; `0` until the first packet.
    next_rotate: u64,
    /// Next statistics record boundary, packet time.
    next_stats: u64,
    /// Upstream drop and fragment counters, reported by the decoder.
    dropped: u64,
    expired_fragments: u32,
    assembled_fragments: u32,
}

impl<E: Exporter> Engine<E> {
    /// Builds an engine from a validated configuration.
    pub fn new(config: &RuntimeConfig, exporter: E) -> Result<Self> {
        config.validate()?;
        Ok(Engine {
            table: FlowTable::new(TableConfig::from(&config.flowtable)),
            assembler: RecordAssembler::new(config)?,
            exporter,
            export_cfg: config.export.clone(),
            is_running: Arc::new(AtomicBool::new(true)),
            init_time_ms: chrono::Utc::now().timestamp_millis() as u64,
            next_rotate: 0,
            next_stats: 0,
            dropped: 0,
            expired_fragments: 0,
            assembled_fragments: 0,
        })
    }

    /// Handle that stops the run loop when cleared.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_running)
    }

    /// Clears the running flag on SIGINT/SIGTERM.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let r = self.running_handle();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::Relaxed);
        })
        .context("installing interrupt handler")
    }

    /// Records counters maintained upstream of the engine, for the
    /// process statistics record.
    pub fn note_decoder_stats(&mut self, dropped: u64, expired: u32, assembled: u32) {
        self.dropped = dropped;
        self.expired_fragments = expired;
        self.assembled_fragments = assembled;
    }

    /// Runs the engine until the source ends or the run is interrupted.
    ///
    /// An exporter failure terminates the loop; a final flush is attempted
    /// with further failures discarded, and the error is returned.
    pub fn run<S: PacketSource>(&mut self, source: &mut S) -> Result<StatsRecord> {
        log::info!("engine starting");
        loop {
            if !self.is_running.load(Ordering::Relaxed) {
                log::info!("interrupted, finishing");
                break;
            }

            let pkt = match source.next_packet() {
                Ok(Some(pkt)) => pkt,
                Ok(None) => break,
                Err(e) => {
                    log::error!("packet source failed: {}", e);
                    let _ = self.finish();
                    return Err(e);
                }
            };
            self.table.admit(&pkt);

            if let Err(e) = self.periodic() {
                self.abort_flush();
                return Err(e);
            }
        }
        self.finish()
    }

    /// Rotation, statistics, and the rate-limited flush pass.
    fn periodic(&mut self) -> Result<()> {
        let now = self.table.current_time();

        if self.export_cfg.rotate_ms > 0 {
            if self.next_rotate == 0 {
                self.next_rotate = now + self.export_cfg.rotate_ms;
            } else if now >= self.next_rotate {
                log::info!("rotating export output at {}", now);
                self.drain(true)?;
                self.exporter.rotate()?;
                while self.next_rotate <= now {
                    self.next_rotate += self.export_cfg.rotate_ms;
                }
            }
        }

        if self.export_cfg.stats_interval_ms > 0 {
            if self.next_stats == 0 {
                self.next_stats = now + self.export_cfg.stats_interval_ms;
            } else if now >= self.next_stats {
                let rec = self.snapshot();
                self.exporter.export_stats(&rec)?;
                while self.next_stats <= now {
                    self.next_stats += self.export_cfg.stats_interval_ms;
                }
            }
        }

        self.drain(false)
    }

    /// Final forced flush, terminal statistics, and sink flush.
    fn finish(&mut self) -> Result<StatsRecord> {
        if let Err(e) = self.drain(true) {
            self.abort_flush();
            return Err(e);
        }
        let rec = self.snapshot();
        self.exporter.export_stats(&rec)?;
        self.exporter.flush()?;
        log::info!(
            "engine finished: {} packets, {} flows, peak table {}",
            rec.packet_total_count,
            rec.exported_flow_total_count,
            rec.flow_table_peak_count
        );
        Ok(rec)
    }

    /// Evicts and hands closed flows to the exporter.
    fn drain(&mut self, force: bool) -> Result<()> {
        let assembler = &self.assembler;
        let exporter = &mut self.exporter;
        let mut records = Vec::new();
        self.table.flush(force, &mut |flow| {
            records.clear();
            assembler.assemble(&flow, &mut records);
            for record in &records {
                exporter.export(record)?;
            }
            Ok(())
        })
    }

    /// Releases remaining flows after an exporter failure, discarding
    /// their records.
    fn abort_flush(&mut self) {
        let _ = self.table.flush(true, &mut |_| Ok(()));
    }

    fn snapshot(&self) -> StatsRecord {
        StatsRecord::snapshot(
            self.init_time_ms,
            chrono::Utc::now().timestamp_millis() as u64,
            self.table.stats(),
            self.dropped,
            self.expired_fragments,
            self.assembled_fragments,
        )
    }
}

/// Packet source fed by a bounded channel from a producer thread.
pub struct ChannelSource {
    rx: Receiver<PacketInfo>,
}

impl PacketSource for ChannelSource {
    fn next_packet(&mut self) -> Result<Option<PacketInfo>> {
        // a closed channel means the producer is done
        Ok(self.rx.recv().ok())
    }
}

/// Moves a packet source onto its own thread, returning a bounded-channel
/// source for the engine to consume. The channel is the only state shared
/// between the two threads.
pub fn spawn_source<S>(mut source: S, capacity: usize) -> (ChannelSource, thread::JoinHandle<Result<()>>)
where
    S: PacketSource + Send + 'static,
{
    let (tx, rx) = bounded(capacity);
    let handle = thread::spawn(move || {
        while let Some(pkt) = source.next_packet()? {
            if tx.send(pkt).is_err() {
                // consumer went away
                break;
            }
        }
        Ok(())
    });
    (ChannelSource { rx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::errors::QofError;
    use crate::export::record::BiflowRecord;
    use crate::export::VecExporter;
    use crate::flowtable::flow::FlowEndReason;
    use crate::flowtable::flow_key::FlowKey;
    use crate::packet::{IpInfo, IterSource, TcpInfo, ACK, FIN, PSH, SYN, TCP_PROTOCOL};

    fn key() -> FlowKey {
        FlowKey::v4([192, 0, 2, 1], [198, 51, 100, 7], 40000, 80, TCP_PROTOCOL)
    }

    fn tcp(
        key: FlowKey,
        ptime: u64,
        seq: u32,
        ack: u32,
        flags: u8,
        datalen: u32,
    ) -> PacketInfo {
        PacketInfo {
            ptime,
            key,
            iplen: 40 + datalen,
            datalen,
            ipinfo: IpInfo { ttl: 64, ecn: 0 },
            tcpinfo: TcpInfo {
                seq,
                ack,
                flags,
                rwin: 8192,
                ..TcpInfo::default()
            },
            smac: [1; 6],
            dmac: [2; 6],
        }
    }

    /// SYN, data, FIN/ACK both ways: the §8 single-connection stream.
    fn handshake_stream() -> Vec<PacketInfo> {
        let k = key();
        let rk = k.reverse();
        vec![
            tcp(k, 0, 1000, 0, SYN, 0),
            tcp(rk, 50, 5000, 1001, SYN | ACK, 0),
            tcp(k, 100, 1001, 5001, ACK, 0),
            tcp(k, 120, 1001, 5001, ACK | PSH, 1000),
            tcp(rk, 170, 5001, 2001, ACK, 0),
            tcp(k, 200, 2001, 5001, FIN | ACK, 0),
            tcp(rk, 220, 5001, 2002, FIN | ACK, 0),
            tcp(k, 230, 2002, 5002, ACK, 0),
        ]
    }

    fn run_stream(config: &RuntimeConfig, packets: Vec<PacketInfo>) -> Vec<BiflowRecord> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut engine = Engine::new(config, VecExporter::default()).unwrap();
        let mut source = IterSource::new(packets);
        engine.run(&mut source).unwrap();
        engine.exporter.records
    }

    #[test]
    fn core_engine_single_connection_biflow() {
        let mut config = default_config();
        config.export.rtt_min_samples = 1;
        let records = run_stream(&config, handshake_stream());

        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.reason, FlowEndReason::Closed);
        assert_eq!(rec.rdtime, 50);
        assert_eq!(rec.fwd.appoct, 1000);
        assert_eq!(rec.fwd.seq_count, 1000);
        let rev = rec.rev.as_ref().unwrap();
        assert_eq!(rev.appoct, 0);
        assert_eq!(rev.seq_count, 0);
        assert_eq!(rec.fwd.rtt_ms.unwrap().min, 50);
        // sequence count covers every acknowledged octet
        assert!(rec.fwd.seq_count >= rec.fwd.appoct);
    }

    #[test]
    fn core_engine_duplicate_acks() {
        let k = key();
        let packets: Vec<_> = (0..100u64)
            .map(|i| tcp(k, i * 10, 1, 1, ACK, 0))
            .collect();
        let records = run_stream(&default_config(), packets);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fwd.dup_ack_count, 99);
    }

    #[test]
    fn core_engine_sequence_wrap() {
        let k = key();
        let start = 0u32.wrapping_sub(200);
        let packets = vec![
            tcp(k, 0, start, 0, ACK, 200),
            tcp(k, 10, 0, 0, ACK, 300),
        ];
        let records = run_stream(&default_config(), packets);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fwd.wrap_count, 1);
        assert_eq!(records[0].fwd.seq_count, 500);
    }

    #[test]
    fn core_engine_uniflow_split_matches_biflow() {
        let mut config = default_config();
        config.export.rtt_min_samples = 1;
        let biflow = run_stream(&config, handshake_stream());
        config.flowtable.uniflow = true;
        let uniflows = run_stream(&config, handshake_stream());

        assert_eq!(biflow.len(), 1);
        assert_eq!(uniflows.len(), 2);
        let b = &biflow[0];
        assert_eq!(uniflows[0].fid, b.fid);
        assert_eq!(uniflows[1].fid, b.fid);
        assert_eq!(
            uniflows[0].fwd.pkt + uniflows[1].fwd.pkt,
            b.fwd.pkt + b.rev.as_ref().unwrap().pkt
        );
        assert_eq!(
            uniflows[0].fwd.oct + uniflows[1].fwd.oct,
            b.fwd.oct + b.rev.as_ref().unwrap().oct
        );
    }

    #[test]
    fn core_engine_idle_timeout_two_records() {
        let mut config = default_config();
        config.flowtable.idle_timeout_ms = 1000;
        let k = key();
        let packets = vec![
            tcp(k, 0, 1, 0, ACK, 500),
            tcp(k, 2000, 501, 0, ACK, 500),
        ];
        let records = run_stream(&config, packets);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reason, FlowEndReason::Idle);
        assert_ne!(records[0].fid, records[1].fid);
    }

    #[test]
    fn core_engine_active_timeout_continuation_flag() {
        let mut config = default_config();
        config.flowtable.idle_timeout_ms = 5_000;
        config.flowtable.active_timeout_ms = 10_000;
        let k = key();
        let packets: Vec<_> = (0..8u64)
            .map(|i| tcp(k, i * 2000, 1 + 100 * i as u32, 0, ACK, 100))
            .collect();
        let records = run_stream(&config, packets);
        assert!(records.len() >= 2);
        assert_eq!(records[0].reason, FlowEndReason::Active);
        assert_eq!(records[0].reason_code & 0x80, 0);
        for rec in &records[1..] {
            assert_eq!(rec.reason_code & 0x80, 0x80);
        }
    }

    #[test]
    fn core_engine_stats_record_emitted() {
        let mut engine = Engine::new(&default_config(), VecExporter::default()).unwrap();
        let mut source = IterSource::new(handshake_stream());
        let rec = engine.run(&mut source).unwrap();
        assert_eq!(rec.packet_total_count, 8);
        assert_eq!(rec.exported_flow_total_count, 1);
        assert_eq!(engine.exporter.stats.len(), 1);
    }

    #[test]
    fn core_engine_exporter_failure_terminates() {
        struct FailingExporter;
        impl Exporter for FailingExporter {
            fn export(&mut self, _: &BiflowRecord) -> Result<(), QofError> {
                Err(QofError::Export(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer closed",
                )))
            }
        }
        let mut engine = Engine::new(&default_config(), FailingExporter).unwrap();
        let mut source = IterSource::new(handshake_stream());
        assert!(engine.run(&mut source).is_err());
    }

    #[test]
    fn core_engine_rotation_boundary() {
        #[derive(Default)]
        struct RotatingExporter {
            records: usize,
            rotations: usize,
        }
        impl Exporter for RotatingExporter {
            fn export(&mut self, _: &BiflowRecord) -> Result<(), QofError> {
                self.records += 1;
                Ok(())
            }
            fn rotate(&mut self) -> Result<(), QofError> {
                self.rotations += 1;
                Ok(())
            }
        }

        let mut config = default_config();
        config.export.rotate_ms = 1000;
        let k = key();
        let packets = vec![
            tcp(k, 0, 1, 0, ACK, 100),
            tcp(k, 500, 101, 0, ACK, 100),
            tcp(k, 1500, 201, 0, ACK, 100),
            tcp(k, 1600, 301, 0, ACK, 100),
        ];
        let mut engine = Engine::new(&config, RotatingExporter::default()).unwrap();
        let mut source = IterSource::new(packets);
        engine.run(&mut source).unwrap();
        // the boundary forced one flow out and reopened the sink; the
        // continuation flow drains at shutdown
        assert_eq!(engine.exporter.rotations, 1);
        assert_eq!(engine.exporter.records, 2);
    }

    #[test]
    fn core_engine_interrupt_stops_loop() {
        let mut engine = Engine::new(&default_config(), VecExporter::default()).unwrap();
        engine.running_handle().store(false, Ordering::Relaxed);
        let mut source = IterSource::new(handshake_stream());
        let rec = engine.run(&mut source).unwrap();
        // nothing consumed, but the final flush still ran
        assert_eq!(rec.packet_total_count, 0);
    }

    #[test]
    fn core_engine_threaded_source() {
        let mut config = default_config();
        config.export.rtt_min_samples = 1;
        let (mut source, handle) = spawn_source(IterSource::new(handshake_stream()), 16);
        let mut engine = Engine::new(&config, VecExporter::default()).unwrap();
        let rec = engine.run(&mut source).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(rec.packet_total_count, 8);
        assert_eq!(engine.exporter.records.len(), 1);
    }
}
