//! Biflow round-trip-time estimation.
//!
//! Fuses half-RTT observations from the two directions of a biflow into a
//! smoothed full-RTT estimate. Each direction alternates between waiting
//! for an acknowledgment covering a sequence number it saw leave, and
//! waiting for a timestamp echo of a TSval it saw leave.

use crate::packet::ACK;
use crate::utils::seq_geq;
use crate::utils::streamstat::StreamStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Wait {
    #[default]
    Idle,
    /// Waiting for an acknowledgment at or beyond the stored sequence.
    Ack,
    /// Waiting for a TSecr equal to or beyond the stored TSval.
    Echo,
}

/// One direction's half of the estimator state.
#[derive(Debug, Clone, Copy, Default)]
struct RttDir {
    wait: Wait,
    /// Pending ack or TSval being waited for.
    pending: u32,
    /// Time the pending value was observed leaving, epoch ms.
    wait_ms: u64,
    /// Last observed half-RTT for this direction, ms; `0` until sampled.
    obs_ms: u64,
}

impl RttDir {
    fn set_ack_wait(&mut self, seq: u32, ms: u64) {
        self.wait = Wait::Ack;
        self.pending = seq;
        self.wait_ms = ms;
    }

    fn set_echo_wait(&mut self, tsval: u32, ms: u64) {
        self.wait = Wait::Echo;
        self.pending = tsval;
        self.wait_ms = ms;
    }
}

/// Per-biflow full-RTT estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiflowRtt {
    /// Smoothed, min and max full RTT over matched rounds.
    pub val: StreamStats,
    fwd: RttDir,
    rev: RttDir,
}

impl BiflowRtt {
    /// Feeds a segment to the estimator. `reverse` selects the direction
    /// the segment was observed in; `seq`/`ack`/`tsval`/`tsecr` come from
    /// the TCP header and options, zero when absent.
    #[allow(clippy::too_many_arguments)]
    pub fn on_segment(
        &mut self,
        seq: u32,
        ack: u32,
        tsval: u32,
        tsecr: u32,
        flags: u8,
        ms: u64,
        reverse: bool,
    ) {
        let (fdir, rdir) = if reverse {
            (&mut self.rev, &mut self.fwd)
        } else {
            (&mut self.fwd, &mut self.rev)
        };

        if fdir.wait == Wait::Ack && flags & ACK != 0 && seq_geq(ack, fdir.pending) {
            // the acknowledgment this direction owed has arrived
            fdir.obs_ms = ms.saturating_sub(fdir.wait_ms);
            fdir.wait = Wait::Idle;
            let sample = Self::round_sample(fdir, rdir);
            if tsval != 0 {
                rdir.set_echo_wait(tsval, ms);
            }
            if let Some(full) = sample {
                self.val.add(full);
            }
        } else if fdir.wait == Wait::Echo && seq_geq(tsecr, fdir.pending) {
            fdir.obs_ms = ms.saturating_sub(fdir.wait_ms);
            fdir.wait = Wait::Idle;
            let sample = Self::round_sample(fdir, rdir);
            rdir.set_ack_wait(seq, ms);
            if let Some(full) = sample {
                self.val.add(full);
            }
        } else if rdir.wait == Wait::Idle {
            rdir.set_ack_wait(seq, ms);
        }
    }

    /// Full-RTT sample once both directions have observed a half-RTT.
    fn round_sample(a: &RttDir, b: &RttDir) -> Option<u32> {
        if a.obs_ms > 0 && b.obs_ms > 0 {
            Some((a.obs_ms + b.obs_ms) as u32)
        } else {
            None
        }
    }

    /// Number of full-RTT samples taken.
    #[inline]
    pub fn sample_count(&self) -> u64 {
        self.val.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PSH, SYN};

    #[test]
    fn core_rtt_no_sample_without_timestamps() {
        // without timestamp options only one direction ever observes a
        // half-RTT, so no full sample can be fused
        let mut rtt = BiflowRtt::default();
        rtt.on_segment(1000, 0, 0, 0, SYN, 0, false);
        rtt.on_segment(5000, 1001, 0, 0, SYN | ACK, 50, true);
        rtt.on_segment(1001, 5001, 0, 0, ACK, 100, false);
        rtt.on_segment(5001, 2001, 0, 0, ACK, 170, true);
        assert_eq!(rtt.sample_count(), 0);
    }

    #[test]
    fn core_rtt_timestamp_echo_round() {
        let mut rtt = BiflowRtt::default();
        rtt.on_segment(1000, 0, 0, 0, SYN, 0, false);
        // rev acks and carries a TSval; fwd switches to echo wait
        rtt.on_segment(5000, 1001, 777, 0, SYN | ACK, 40, true);
        // fwd echoes the TSval
        rtt.on_segment(1001, 5001, 900, 777, ACK | PSH, 90, false);
        assert_eq!(rtt.sample_count(), 1);
        // 40 (rev half) + 50 (fwd echo half)
        assert_eq!(rtt.val.max(), 90);
    }

    #[test]
    fn core_rtt_alternating_rounds_accumulate() {
        let mut rtt = BiflowRtt::default();
        rtt.on_segment(1000, 0, 100, 0, SYN, 0, false);
        rtt.on_segment(5000, 1001, 777, 100, SYN | ACK, 40, true);
        rtt.on_segment(1001, 5001, 900, 777, ACK, 90, false);
        assert_eq!(rtt.sample_count(), 1);
        // echo-pay re-armed rev ack-wait on seq 1001; the next rev ack
        // closes another round
        rtt.on_segment(5001, 2001, 950, 900, ACK, 150, true);
        assert_eq!(rtt.sample_count(), 2);
    }
}
