//! Sliding bitmap over TCP sequence space.
//!
//! Tracks which regions of a flow's sequence space have been observed, at a
//! configurable granularity. Incoming segments test-and-set their range; a
//! partial or full intersection with previously seen space marks the segment
//! as a retransmission. Space shifted out of the window still unseen is
//! accounted as sequence loss.

use crate::utils::{seq_gt, seq_lt};

const WORD_BITS: u32 = 64;

/// Intersection of a tested range with previously seen sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intersect {
    /// No bit in the range was previously set.
    None,
    /// Some, but not all, bits in the range were previously set.
    Partial,
    /// Every bit in the range was previously set.
    Full,
}

impl Intersect {
    /// Combines per-word classifications; any disagreement is partial.
    fn combine(self, other: Intersect) -> Intersect {
        if self == other {
            self
        } else {
            Intersect::Partial
        }
    }

    /// Returns `true` if the range overlapped previously seen space.
    #[inline]
    pub fn is_rexmit(self) -> bool {
        !matches!(self, Intersect::None)
    }
}

/// A circular bitmap covering a window of sequence space.
///
/// Each bit covers `scale` bytes; the window spans `words.len() * 64 * scale`
/// bytes starting at `base_seq`. The base only moves forward (modulo wrap).
#[derive(Debug, Clone)]
pub struct SeqBitmap {
    words: Vec<u64>,
    /// Physical index of the window head word.
    base_index: usize,
    /// Sequence number covered by bit 0 of the head word.
    base_seq: u32,
    scale: u32,
    started: bool,
    lost_bytes: u64,
}

impl SeqBitmap {
    /// Creates a bitmap spanning `capacity` bytes of sequence space at
    /// `scale` bytes per bit.
    pub fn new(capacity: u32, scale: u32) -> Self {
        debug_assert!(scale > 0);
        let words = (capacity / (scale * WORD_BITS)).max(1) as usize;
        SeqBitmap {
            words: vec![0; words],
            base_index: 0,
            base_seq: 0,
            scale,
            started: false,
            lost_bytes: 0,
        }
    }

    /// Total sequence span covered by the window, in bytes.
    #[inline]
    fn span(&self) -> u32 {
        self.words.len() as u32 * WORD_BITS * self.scale
    }

    /// Cumulative bytes shifted out of the window without ever being seen.
    #[inline]
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Drops the head word, crediting its clear bits to the loss counter.
    fn shift_out(&mut self) {
        let word = self.words[self.base_index];
        self.words[self.base_index] = 0;
        self.lost_bytes += (WORD_BITS - word.count_ones()) as u64 * self.scale as u64;
        self.advance_head();
    }

    /// Rotates the head forward one word without loss accounting.
    fn advance_head(&mut self) {
        self.base_index = (self.base_index + 1) % self.words.len();
        self.base_seq = self.base_seq.wrapping_add(self.scale * WORD_BITS);
    }

    /// Tests and sets the half-open sequence range `[a, b)`.
    ///
    /// Returns how the range intersects previously seen space. A range that
    /// falls entirely behind the window counts as fully seen.
    pub fn test_and_set(&mut self, a: u32, b: u32) -> Intersect {
        if a == b {
            return Intersect::Full;
        }

        if !self.started {
            self.started = true;
            self.base_seq = a.wrapping_sub(a % self.scale);
        } else {
            // reclaim fully seen space at the head of the window
            while self.words[self.base_index] == u64::MAX {
                self.words[self.base_index] = 0;
                self.advance_head();
            }
        }

        // force the window forward to cover the end of range
        let mut max_seq = self.base_seq.wrapping_add(self.span());
        while seq_gt(b, max_seq) {
            self.shift_out();
            max_seq = self.base_seq.wrapping_add(self.span());
        }

        // entirely behind the window: already seen or rotated past
        if !seq_gt(b, self.base_seq) {
            return Intersect::Full;
        }

        // clip the overlapping bottom of the range
        let a = if seq_lt(a, self.base_seq) {
            self.base_seq
        } else {
            a
        };

        let start_bit = a.wrapping_sub(self.base_seq) / self.scale;
        let end_bit = b.wrapping_sub(1).wrapping_sub(self.base_seq) / self.scale;

        let start_word = (start_bit / WORD_BITS) as usize;
        let end_word = (end_bit / WORD_BITS) as usize;

        let mut res: Option<Intersect> = None;
        for w in start_word..=end_word {
            let lo = if w == start_word { start_bit % WORD_BITS } else { 0 };
            let hi = if w == end_word {
                end_bit % WORD_BITS
            } else {
                WORD_BITS - 1
            };
            let mask = (!0u64 << lo) & (!0u64 >> (WORD_BITS - 1 - hi));

            let idx = (self.base_index + w) % self.words.len();
            let word = self.words[idx];
            let isect = if word & mask == mask {
                Intersect::Full
            } else if word & mask == 0 {
                Intersect::None
            } else {
                Intersect::Partial
            };
            self.words[idx] |= mask;

            res = Some(match res {
                Some(prev) => prev.combine(isect),
                None => isect,
            });
        }
        res.unwrap_or(Intersect::Full)
    }

    /// Shifts the remaining window out at flow close, accumulating loss for
    /// every clear bit below the highest seen position of each word.
    pub fn finalize(&mut self) {
        while self.words[self.base_index] != 0 {
            let word = self.words[self.base_index];
            self.words[self.base_index] = 0;
            let high = WORD_BITS - word.leading_zeros();
            self.lost_bytes += (high - word.count_ones()) as u64 * self.scale as u64;
            self.advance_head();
        }
    }
}
