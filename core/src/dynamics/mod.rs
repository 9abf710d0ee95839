//! Per-direction TCP dynamics tracking.
//!
//! One [`TcpDynamics`] instance follows a single direction of a TCP biflow:
//! sequence-space accounting across 32-bit wrap, retransmission and
//! reordering detection through a sliding [`SeqBitmap`], RTT sampling
//! through a [`SeqRing`] of outbound segments matched against inbound
//! acknowledgments, and observed/declared MSS. The acknowledgment,
//! receive-window, timestamp, and biflow-RTT trackers live alongside it in
//! this module.

pub mod ack;
pub mod rtt;
pub mod rwin;
pub mod seqbitmap;
pub mod seqring;
pub mod tsopt;

use self::seqbitmap::SeqBitmap;
use self::seqring::SeqRing;
use crate::packet::{FIN, SYN};
use crate::utils::streamstat::{LinSmooth, StreamStats};
use crate::utils::{seq_geq, seq_gt};

/// 2^32, for sequence count arithmetic.
const K2E32: u64 = 0x1_0000_0000;

/// EWMA weight for the smoothed RTT estimate.
const ALPHA: u32 = 8;

/// Minimum interval between RTT samples, ms.
const SEQ_SAMPLE_PERIOD_MS: u64 = 1;

// Option and ECN presence flags, exported per direction.
pub const OPT_ECT0: u32 = 0x0000_0001;
pub const OPT_ECT1: u32 = 0x0000_0002;
pub const OPT_CE: u32 = 0x0000_0004;
pub const OPT_TS: u32 = 0x0000_0010;
pub const OPT_SACK: u32 = 0x0000_0020;
pub const OPT_WS: u32 = 0x0000_0040;

/// Mask of flag bits that appear in export records.
pub const OPT_EXPORT_MASK: u32 = 0x0FFF_FFFF;

// Internal state flags, masked out of exports.
const SYN_SEEN: u32 = 0x1000_0000;
const ACK_SEEN: u32 = 0x2000_0000;
const RTT_CORR_PENDING: u32 = 0x4000_0000;

/// Tuning for the per-direction tracking buffers.
///
/// Carried by value in the engine configuration so independent engines can
/// coexist with different tunings.
#[derive(Debug, Clone, Copy)]
pub struct DynConfig {
    /// Sequence span covered by the retransmission bitmap, bytes.
    pub bitmap_capacity: u32,
    /// Bytes of sequence space per bitmap bit.
    pub bitmap_scale: u32,
    /// RTT sample ring capacity; `0` disables RTT sampling.
    pub ring_capacity: usize,
}

impl Default for DynConfig {
    fn default() -> Self {
        DynConfig {
            bitmap_capacity: 4 * 1024 * 1024,
            bitmap_scale: 128,
            ring_capacity: 128,
        }
    }
}

/// Per-direction TCP state.
#[derive(Debug, Clone)]
pub struct TcpDynamics {
    cfg: DynConfig,
    flags: u32,
    /// Initial sequence number.
    isn: u32,
    /// Next expected sequence number (highest segment end seen).
    nsn: u32,
    /// Final acknowledgment number observed for this direction's data.
    fan: u32,
    /// Time of the last acknowledgment advance, epoch ms.
    fan_ms: u64,
    /// Sequence space wraparound count.
    wrap_ct: u32,
    /// Detected retransmitted segment count.
    rtx_ct: u64,
    /// Detected reordered segment count.
    reorder_ct: u64,
    /// Maximum observed reordering (nsn - segment end).
    reorder_max: u32,
    /// Maximum observed bytes in flight (nsn - fan).
    inflight_max: u32,
    /// Observed maximum segment size.
    mss: u16,
    /// Declared (TCP option) maximum segment size.
    mss_opt: u16,
    /// Smoothed RTT estimate, ms.
    rtt_est: LinSmooth,
    /// Corrected RTT samples, ms.
    rtt_stats: StreamStats,
    /// Reverse-path delay correction term, ms.
    rtt_corr: u32,
    /// Non-empty segment interarrival time, ms.
    iat: StreamStats,
    last_data_ms: u64,
    sr: Option<SeqRing>,
    sr_skip: u32,
    sr_period: u32,
    sb: Option<SeqBitmap>,
}

impl TcpDynamics {
    pub fn new(cfg: DynConfig) -> Self {
        TcpDynamics {
            cfg,
            flags: 0,
            isn: 0,
            nsn: 0,
            fan: 0,
            fan_ms: 0,
            wrap_ct: 0,
            rtx_ct: 0,
            reorder_ct: 0,
            reorder_max: 0,
            inflight_max: 0,
            mss: 0,
            mss_opt: 0,
            rtt_est: LinSmooth::new(ALPHA),
            rtt_stats: StreamStats::default(),
            rtt_corr: 0,
            iat: StreamStats::default(),
            last_data_ms: 0,
            sr: None,
            sr_skip: 0,
            sr_period: 0,
            sb: None,
        }
    }

    /// Handles a SYN (or the first segment standing in for one, with
    /// `seq` one before the first data byte). Duplicate SYNs are ignored.
    pub fn on_syn(&mut self, seq: u32, _ms: u64) {
        if self.flags & SYN_SEEN != 0 {
            log::debug!("duplicate SYN at seq {}", seq);
            return;
        }

        if self.cfg.ring_capacity > 0 {
            self.sr = Some(SeqRing::new(self.cfg.ring_capacity));
        }
        if self.cfg.bitmap_capacity > 0 {
            self.sb = Some(SeqBitmap::new(
                self.cfg.bitmap_capacity,
                self.cfg.bitmap_scale,
            ));
        }

        self.isn = seq;
        self.nsn = seq;
        self.flags |= SYN_SEEN;
    }

    /// Handles a data segment of `oct` octets starting at `seq`, observed
    /// at `ms`. Empty segments and segments before the SYN are ignored.
    pub fn on_data(&mut self, seq: u32, oct: u32, ms: u64) {
        if oct == 0 || self.flags & SYN_SEEN == 0 {
            return;
        }
        let end = seq.wrapping_add(oct);

        if self.last_data_ms > 0 && ms >= self.last_data_ms {
            self.iat.add((ms - self.last_data_ms) as u32);
        }
        self.last_data_ms = ms;

        if oct > self.mss as u32 {
            self.mss = oct.min(u16::MAX as u32) as u16;
        }

        // a segment beyond the in-flight high-water mark closes out the
        // pending reverse-path delay measurement
        if self.flags & RTT_CORR_PENDING != 0
            && seq_geq(end.wrapping_sub(self.inflight_max), self.fan)
        {
            self.flags &= !RTT_CORR_PENDING;
            let crtt = ms.saturating_sub(self.fan_ms) as u32;
            if crtt < self.rtt_corr {
                self.rtt_corr = crtt;
            }
        }

        let mut rexmit = false;
        if let Some(sb) = &mut self.sb {
            if sb.test_and_set(seq, end).is_rexmit() {
                self.rtx_ct += 1;
                rexmit = true;
                log::debug!("rexmit [{} - {}]", seq, end);
            }
        }

        if seq_gt(end, self.nsn) {
            if end < self.nsn {
                self.wrap_ct += 1;
            }
            self.nsn = end;

            if self.flags & ACK_SEEN != 0
                && seq_gt(self.nsn, self.fan)
                && self.inflight_max < self.nsn.wrapping_sub(self.fan)
            {
                self.inflight_max = self.nsn.wrapping_sub(self.fan);
            }

            if self.should_sample(ms) {
                if let Some(sr) = &mut self.sr {
                    sr.add(end, ms);
                }
            }
        } else {
            let reorder = self.nsn.wrapping_sub(end);
            if reorder > self.reorder_max {
                self.reorder_max = reorder;
            }
            if !rexmit {
                self.reorder_ct += 1;
            }
        }
    }

    /// Paces RTT sampling to roughly one sample per in-flight window.
    fn should_sample(&mut self, ms: u64) -> bool {
        let sr = match &self.sr {
            Some(sr) => sr,
            None => return false,
        };

        if sr.last_ms() + SEQ_SAMPLE_PERIOD_MS > ms {
            return false;
        }

        if self.sr_skip < self.sr_period {
            self.sr_skip += 1;
            return false;
        }

        self.sr_period = if self.flags & SYN_SEEN != 0 && self.flags & ACK_SEEN != 0 {
            let inflight = self.nsn.wrapping_sub(self.fan);
            let period = (inflight / self.mss.max(1) as u32) / sr.available().max(1) as u32;
            period.saturating_sub(1)
        } else {
            0
        };
        self.sr_skip = 0;
        true
    }

    /// Handles an acknowledgment of this direction's data.
    pub fn on_ack(&mut self, ack: u32, ms: u64) {
        if self.flags & ACK_SEEN == 0 {
            self.flags |= ACK_SEEN;
            self.fan = ack;
            self.fan_ms = ms;
            self.rtt_corr = u32::MAX;
        } else if seq_gt(ack, self.fan) {
            self.fan = ack;
            self.fan_ms = ms;

            if let Some(sr) = &mut self.sr {
                let irtt = sr.match_ack(ack, ms);
                if irtt > 0 {
                    self.track_rtt(irtt as u32);
                }
                self.flags |= RTT_CORR_PENDING;
            }
        }
    }

    fn track_rtt(&mut self, irtt: u32) {
        let corrected = if self.rtt_corr != u32::MAX {
            irtt.saturating_add(self.rtt_corr)
        } else {
            irtt
        };
        self.rtt_est.add(corrected);
        self.rtt_stats.add(corrected);
    }

    /// Records ECN codepoints and TCP option presence for this direction.
    pub fn on_options(
        &mut self,
        ecn: u8,
        ts_present: bool,
        ws_present: bool,
        sack_present: bool,
        mss_opt: u16,
    ) {
        if ecn & 0x01 != 0 {
            self.flags |= OPT_ECT0;
        }
        if ecn & 0x02 != 0 {
            self.flags |= OPT_ECT1;
        }
        if ecn & 0x03 == 0x03 {
            self.flags |= OPT_CE;
        }
        if ts_present {
            self.flags |= OPT_TS;
        }
        if ws_present {
            self.flags |= OPT_WS;
        }
        if sack_present {
            self.flags |= OPT_SACK;
        }
        if mss_opt != 0 {
            self.mss_opt = mss_opt;
        }
    }

    /// Finalizes loss accounting at flow close.
    pub fn close(&mut self) {
        if let Some(sb) = &mut self.sb {
            sb.finalize();
        }
    }

    /// Sequence numbers consumed by this direction, excluding SYN and FIN
    /// when they were observed (`flags` is the union of the direction's
    /// TCP flags).
    pub fn sequence_count(&self, flags: u8) -> u64 {
        let mut sc = (self.nsn as u64 + K2E32 * self.wrap_ct as u64).wrapping_sub(self.isn as u64);
        if flags & SYN != 0 && sc > 0 {
            sc -= 1;
        }
        if flags & FIN != 0 && sc > 0 {
            sc -= 1;
        }
        sc
    }

    #[inline]
    pub fn syn_seen(&self) -> bool {
        self.flags & SYN_SEEN != 0
    }

    #[inline]
    pub fn isn(&self) -> u32 {
        self.isn
    }

    #[inline]
    pub fn nsn(&self) -> u32 {
        self.nsn
    }

    #[inline]
    pub fn final_ack(&self) -> u32 {
        self.fan
    }

    #[inline]
    pub fn wrap_count(&self) -> u32 {
        self.wrap_ct
    }

    #[inline]
    pub fn retransmit_count(&self) -> u64 {
        self.rtx_ct
    }

    #[inline]
    pub fn reorder_count(&self) -> u64 {
        self.reorder_ct
    }

    #[inline]
    pub fn reorder_max(&self) -> u32 {
        self.reorder_max
    }

    #[inline]
    pub fn inflight_max(&self) -> u32 {
        self.inflight_max
    }

    #[inline]
    pub fn mss(&self) -> u16 {
        self.mss
    }

    #[inline]
    pub fn mss_declared(&self) -> u16 {
        self.mss_opt
    }

    /// Bytes shifted out of the observation window without being seen.
    pub fn loss_bytes(&self) -> u64 {
        self.sb.as_ref().map_or(0, |sb| sb.lost_bytes())
    }

    /// Smoothed RTT estimate with correction term applied, ms.
    #[inline]
    pub fn rtt_estimate(&self) -> u32 {
        self.rtt_est.value()
    }

    /// Corrected RTT sample statistics.
    #[inline]
    pub fn rtt_stats(&self) -> &StreamStats {
        &self.rtt_stats
    }

    #[inline]
    pub fn rtt_samples(&self) -> u64 {
        self.rtt_stats.count()
    }

    /// Option/ECN presence flags, masked for export.
    #[inline]
    pub fn option_flags(&self) -> u32 {
        self.flags & OPT_EXPORT_MASK
    }

    /// Interarrival statistics over non-empty segments.
    #[inline]
    pub fn interarrival(&self) -> &StreamStats {
        &self.iat
    }

    /// RTT sample-ring overruns, for diagnostics.
    pub fn ring_overruns(&self) -> u64 {
        self.sr.as_ref().map_or(0, |sr| sr.overruns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dyn_with_syn(seq: u32) -> TcpDynamics {
        let mut qd = TcpDynamics::new(DynConfig::default());
        qd.on_syn(seq, 0);
        qd
    }

    #[test]
    fn core_dyn_ignores_data_before_syn() {
        let mut qd = TcpDynamics::new(DynConfig::default());
        qd.on_data(1000, 500, 10);
        assert_eq!(qd.sequence_count(0), 0);
    }

    #[test]
    fn core_dyn_sequence_count_simple() {
        let mut qd = dyn_with_syn(1000);
        qd.on_data(1001, 1000, 120);
        // SYN consumed one sequence number
        assert_eq!(qd.sequence_count(SYN), 1000);
    }

    #[test]
    fn core_dyn_full_retransmit_counted_once() {
        let mut qd = dyn_with_syn(0);
        qd.on_data(1, 1000, 0);
        qd.on_data(1, 1000, 10);
        assert_eq!(qd.retransmit_count(), 1);
        assert_eq!(qd.reorder_count(), 0);
    }

    #[test]
    fn core_dyn_reorder_not_retransmit() {
        let mut qd = dyn_with_syn(0);
        qd.on_data(1, 500, 0);
        qd.on_data(1001, 500, 10);
        qd.on_data(501, 500, 20);
        assert_eq!(qd.retransmit_count(), 0);
        assert_eq!(qd.reorder_count(), 1);
        assert_eq!(qd.reorder_max(), 500);
    }

    #[test]
    fn core_dyn_wraparound_count() {
        let start = 0u32.wrapping_sub(200);
        let mut qd = dyn_with_syn(start);
        qd.on_data(start, 200, 0);
        qd.on_data(0, 300, 10);
        assert_eq!(qd.wrap_count(), 1);
        assert_eq!(qd.sequence_count(0), 500);
    }

    #[test]
    fn core_dyn_rtt_sampling() {
        let mut qd = dyn_with_syn(1000);
        qd.on_ack(1001, 100);
        qd.on_data(1001, 1000, 120);
        qd.on_ack(2001, 170);
        assert_eq!(qd.rtt_samples(), 1);
        assert_eq!(qd.rtt_estimate(), 50);
    }

    #[test]
    fn core_dyn_inflight_max() {
        let mut qd = dyn_with_syn(1000);
        qd.on_ack(1001, 0);
        qd.on_data(1001, 1000, 10);
        qd.on_data(2001, 1000, 20);
        assert_eq!(qd.inflight_max(), 2000);
        qd.on_ack(3001, 30);
        assert_eq!(qd.inflight_max(), 2000);
    }

    #[test]
    fn core_dyn_mss_observed() {
        let mut qd = dyn_with_syn(0);
        qd.on_data(1, 500, 0);
        qd.on_data(501, 1460, 10);
        qd.on_data(1961, 100, 20);
        assert_eq!(qd.mss(), 1460);
    }

    #[test]
    fn core_dyn_option_flags() {
        let mut qd = TcpDynamics::new(DynConfig::default());
        qd.on_options(0x01, true, false, true, 1460);
        assert_eq!(
            qd.option_flags(),
            OPT_ECT0 | OPT_TS | OPT_SACK
        );
        assert_eq!(qd.mss_declared(), 1460);
    }

    #[test]
    fn core_dyn_duplicate_syn_keeps_isn() {
        let mut qd = dyn_with_syn(5000);
        qd.on_syn(9000, 50);
        assert_eq!(qd.isn(), 5000);
    }
}
