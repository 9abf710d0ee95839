//! Error kinds raised by the flow meter core.
//!
//! Per-packet anomalies never become errors; they are absorbed into
//! counters. Errors carry the conditions that stop a run: bad
//! configuration rejected before the engine starts, or a failing export
//! sink. Internal invariant violations (index/queue disagreement) are
//! programming errors and abort with a diagnostic instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QofError {
    /// Configuration rejected at startup; the engine never ran.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The export sink failed; the run terminates after a final flush
    /// attempt.
    #[error("export failed: {0}")]
    Export(#[from] std::io::Error),
}
