//! Record assembly and export sinks.
//!
//! Closed flows are assembled into [`BiflowRecord`]s, annotated with the
//! interface map and direction classification, and handed to an
//! [`Exporter`]. The exporter borrows each record for the duration of one
//! emission and never retains it.

pub mod record;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::Result;

use self::record::{BiflowRecord, FlowSide, StatSummary};
use crate::config::RuntimeConfig;
use crate::errors::QofError;
use crate::flowtable::flow::{Flow, FlowEndReason, FlowVal};
use crate::flowtable::flow_key::FlowKey;
use crate::ifmap::{IfMap, MacList, NetDirection, NetList};
use crate::stats::StatsRecord;

/// Receives assembled records.
///
/// A failing sink terminates the run; the engine makes one final flush
/// attempt, discarding further failures.
pub trait Exporter {
    fn export(&mut self, record: &BiflowRecord) -> Result<(), QofError>;

    /// Emits a process statistics record.
    fn export_stats(&mut self, stats: &StatsRecord) -> Result<(), QofError> {
        let _ = stats;
        Ok(())
    }

    /// Closes the current output and opens the next one.
    fn rotate(&mut self) -> Result<(), QofError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), QofError> {
        Ok(())
    }
}

/// Record assembly options derived from the runtime configuration.
#[derive(Debug, Clone)]
struct AssembleOptions {
    rtt_min_samples: u64,
    silk: bool,
    stats: bool,
    uniflow: bool,
    mac: bool,
}

/// Assembles export records from closed flows.
pub struct RecordAssembler {
    opts: AssembleOptions,
    ifmap: IfMap,
    nets: Option<NetList>,
    macs: MacList,
}

impl RecordAssembler {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let (ifmap, nets, macs) = config.interfaces.build()?;
        Ok(RecordAssembler {
            opts: AssembleOptions {
                rtt_min_samples: config.export.rtt_min_samples,
                silk: config.flowtable.silk,
                stats: config.flowtable.stats,
                uniflow: config.flowtable.uniflow,
                mac: config.flowtable.mac,
            },
            ifmap,
            nets: if config.interfaces.source_nets.is_empty() {
                None
            } else {
                Some(nets)
            },
            macs,
        })
    }

    /// Assembles the record (or record pair, in uniflow-split mode) for a
    /// closed flow.
    pub fn assemble(&self, flow: &Flow, out: &mut Vec<BiflowRecord>) {
        let reason = flow.reason.unwrap_or(FlowEndReason::Forced);
        if self.opts.uniflow {
            let mut fwd = self.record(flow, reason, false);
            fwd.rdtime = 0;
            out.push(fwd);
            if flow.rval.pkt > 0 {
                out.push(self.record(flow, reason, true));
            }
        } else {
            let mut rec = self.record(flow, reason, false);
            if flow.rval.pkt > 0 {
                rec.rev = Some(self.side(&flow.rval));
            }
            out.push(rec);
        }
    }

    /// Builds a single-sided record; `reversed` swaps the orientation for
    /// the second record of a uniflow split.
    fn record(&self, flow: &Flow, reason: FlowEndReason, reversed: bool) -> BiflowRecord {
        let key = if reversed {
            flow.key.reverse()
        } else {
            flow.key
        };
        let val = if reversed { &flow.rval } else { &flow.val };
        let (smac, dmac) = if reversed {
            (flow.dmac, flow.smac)
        } else {
            (flow.smac, flow.dmac)
        };
        let stime = if reversed {
            flow.stime + flow.rdtime as u64
        } else {
            flow.stime
        };

        let (ingress, egress) = self.ifmap.addresses(&key);
        let direction = self.direction(&key, &smac, &dmac);

        BiflowRecord {
            fid: flow.fid,
            stime,
            etime: flow.etime,
            rdtime: if reversed { 0 } else { flow.rdtime },
            sip: key.src_addr(),
            dip: key.dst_addr(),
            sp: key.sp,
            dp: key.dp,
            proto: key.proto,
            vlan: key.vlan,
            reason,
            reason_code: flow.reason_code(),
            smac: if self.opts.mac { Some(smac) } else { None },
            dmac: if self.opts.mac { Some(dmac) } else { None },
            ingress,
            egress,
            direction,
            fwd: self.side(val),
            rev: None,
            rtt_ms: StatSummary::of(&flow.rtt.val),
        }
    }

    fn side(&self, val: &FlowVal) -> FlowSide {
        let flags = val.all_flags();
        FlowSide {
            iflags: val.iflags,
            uflags: val.uflags,
            oct: self.clamp(val.oct),
            appoct: self.clamp(val.appoct),
            pkt: self.clamp(val.pkt),
            apppkt: self.clamp(val.apppkt),
            minttl: val.minttl,
            maxttl: val.maxttl,
            isn: val.tcp.isn(),
            seq_count: self.clamp(val.tcp.sequence_count(flags)),
            wrap_count: val.tcp.wrap_count(),
            rtx_count: val.tcp.retransmit_count(),
            reorder_count: val.tcp.reorder_count(),
            reorder_max: val.tcp.reorder_max(),
            loss_count: val.tcp.loss_bytes(),
            inflight_max: val.tcp.inflight_max(),
            mss: val.tcp.mss(),
            mss_declared: val.tcp.mss_declared(),
            rtt_ms: if val.tcp.rtt_samples() >= self.opts.rtt_min_samples {
                StatSummary::of(val.tcp.rtt_stats())
            } else {
                None
            },
            rwin: StatSummary::of(&val.tcprwin.val),
            rwin_stall_count: val.tcprwin.stall_ct,
            dup_ack_count: val.tcpack.dup_ct,
            sack_count: val.tcpack.sel_ct,
            ts_hz: StatSummary::of(&val.tcpts.hz),
            opt_flags: val.tcp.option_flags(),
            iat_ms: if self.opts.stats {
                StatSummary::of(val.tcp.interarrival())
            } else {
                None
            },
            netif: val.netif,
        }
    }

    /// Classifies flow direction from the source networks, falling back
    /// to the source-side MAC hints.
    fn direction(
        &self,
        key: &FlowKey,
        smac: &[u8; 6],
        dmac: &[u8; 6],
    ) -> Option<NetDirection> {
        if let Some(nets) = &self.nets {
            return Some(nets.direction(key));
        }
        if self.opts.mac {
            if self.macs.contains(smac) {
                return Some(NetDirection::In);
            }
            if self.macs.contains(dmac) {
                return Some(NetDirection::Out);
            }
        }
        None
    }

    fn clamp(&self, x: u64) -> u64 {
        if self.opts.silk {
            x.min(u32::MAX as u64)
        } else {
            x
        }
    }
}

/// Writes records as JSON lines to an owned sink.
pub struct JsonLinesExporter<W: Write> {
    sink: W,
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(sink: W) -> Self {
        JsonLinesExporter { sink }
    }

    fn write_line<T: serde::Serialize>(&mut self, value: &T) -> Result<(), QofError> {
        serde_json::to_writer(&mut self.sink, value)
            .map_err(|e| QofError::Export(io::Error::new(io::ErrorKind::Other, e)))?;
        self.sink.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> Exporter for JsonLinesExporter<W> {
    fn export(&mut self, record: &BiflowRecord) -> Result<(), QofError> {
        self.write_line(record)
    }

    fn export_stats(&mut self, stats: &StatsRecord) -> Result<(), QofError> {
        self.write_line(stats)
    }

    fn rotate(&mut self) -> Result<(), QofError> {
        self.sink.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), QofError> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Writes JSON-lines files under a directory, starting a new
/// wall-clock-named file on each rotation.
pub struct RotatingFileExporter {
    dir: PathBuf,
    prefix: String,
    sink: BufWriter<File>,
}

impl RotatingFileExporter {
    pub fn new<P: Into<PathBuf>>(dir: P, prefix: &str) -> Result<Self, QofError> {
        let dir = dir.into();
        let sink = Self::open(&dir, prefix)?;
        Ok(RotatingFileExporter {
            dir,
            prefix: prefix.to_owned(),
            sink,
        })
    }

    fn open(dir: &PathBuf, prefix: &str) -> Result<BufWriter<File>, QofError> {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let path = dir.join(format!("{}-{}.jsonl", prefix, stamp));
        log::info!("opening export file {}", path.display());
        Ok(BufWriter::new(File::create(path)?))
    }

    fn write_line<T: serde::Serialize>(&mut self, value: &T) -> Result<(), QofError> {
        serde_json::to_writer(&mut self.sink, value)
            .map_err(|e| QofError::Export(io::Error::new(io::ErrorKind::Other, e)))?;
        self.sink.write_all(b"\n")?;
        Ok(())
    }
}

impl Exporter for RotatingFileExporter {
    fn export(&mut self, record: &BiflowRecord) -> Result<(), QofError> {
        self.write_line(record)
    }

    fn export_stats(&mut self, stats: &StatsRecord) -> Result<(), QofError> {
        self.write_line(stats)
    }

    fn rotate(&mut self) -> Result<(), QofError> {
        self.sink.flush()?;
        self.sink = Self::open(&self.dir, &self.prefix)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), QofError> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Collects records in memory, for tests.
#[derive(Default)]
pub struct VecExporter {
    pub records: Vec<BiflowRecord>,
    pub stats: Vec<StatsRecord>,
}

impl Exporter for VecExporter {
    fn export(&mut self, record: &BiflowRecord) -> Result<(), QofError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn export_stats(&mut self, stats: &StatsRecord) -> Result<(), QofError> {
        self.stats.push(*stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::dynamics::DynConfig;
    use crate::flowtable::flow_key::FlowKey;
    use crate::packet::{IpInfo, PacketInfo, TcpInfo, ACK, SYN, TCP_PROTOCOL};

    fn closed_flow() -> Flow {
        let key = FlowKey::v4([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, TCP_PROTOCOL);
        let mut flow = Flow::new(7, key, 1000, DynConfig::default());
        let fwd = PacketInfo {
            ptime: 1000,
            key,
            iplen: 40,
            datalen: 0,
            ipinfo: IpInfo { ttl: 64, ecn: 0 },
            tcpinfo: TcpInfo {
                seq: 100,
                flags: SYN,
                rwin: 8192,
                ..TcpInfo::default()
            },
            smac: [1; 6],
            dmac: [2; 6],
        };
        flow.update(&fwd, false, true);
        let mut rev = fwd;
        rev.key = key.reverse();
        rev.ptime = 1050;
        rev.tcpinfo.seq = 900;
        rev.tcpinfo.ack = 101;
        rev.tcpinfo.flags = SYN | ACK;
        flow.update(&rev, true, true);
        flow.close(FlowEndReason::Idle);
        flow
    }

    #[test]
    fn core_export_biflow_record() {
        let assembler = RecordAssembler::new(&default_config()).unwrap();
        let mut out = vec![];
        assembler.assemble(&closed_flow(), &mut out);
        assert_eq!(out.len(), 1);
        let rec = &out[0];
        assert_eq!(rec.fid, 7);
        assert_eq!(rec.reason, FlowEndReason::Idle);
        assert_eq!(rec.rdtime, 50);
        assert!(rec.rev.is_some());
        assert!(rec.rtt_ms.is_none());
        // RTT suppressed below the sample minimum
        assert!(rec.fwd.rtt_ms.is_none());
    }

    #[test]
    fn core_export_uniflow_split_sums_to_biflow() {
        let mut config = default_config();
        config.flowtable.uniflow = true;
        let assembler = RecordAssembler::new(&config).unwrap();
        let flow = closed_flow();
        let mut out = vec![];
        assembler.assemble(&flow, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].fid, out[1].fid);
        assert_eq!(
            out[0].fwd.pkt + out[1].fwd.pkt,
            flow.val.pkt + flow.rval.pkt
        );
        // the reverse record is reoriented
        assert_eq!(out[1].sp, 80);
        assert_eq!(out[1].dp, 40000);
        assert_eq!(out[1].stime, flow.stime + flow.rdtime as u64);
        assert!(out[0].rev.is_none());
        assert!(out[1].rev.is_none());
    }

    #[test]
    fn core_export_ifmap_annotation() {
        let mut config = default_config();
        config
            .interfaces
            .ifmap
            .push(crate::config::IfMapEntry {
                net: "10.0.0.0/24".parse().unwrap(),
                ingress: 3,
                egress: 4,
            });
        config.interfaces.source_nets.push("10.0.0.0/24".parse().unwrap());
        let assembler = RecordAssembler::new(&config).unwrap();
        let mut out = vec![];
        assembler.assemble(&closed_flow(), &mut out);
        let rec = &out[0];
        assert_eq!(rec.ingress, 3);
        assert_eq!(rec.egress, 4);
        assert_eq!(rec.direction, Some(NetDirection::Internal));
    }

    #[test]
    fn core_export_json_lines() {
        let mut sink = Vec::new();
        {
            let mut exporter = JsonLinesExporter::new(&mut sink);
            let assembler = RecordAssembler::new(&default_config()).unwrap();
            let mut out = vec![];
            assembler.assemble(&closed_flow(), &mut out);
            exporter.export(&out[0]).unwrap();
            exporter.flush().unwrap();
        }
        let line = String::from_utf8(sink).unwrap();
        assert!(line.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["fid"], 7);
        assert_eq!(parsed["reason"], "idle");
        assert_eq!(parsed["sip"], "10.0.0.1");
    }
}
