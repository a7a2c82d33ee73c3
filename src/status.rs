//! Pipeline status codes and configuration errors.
//!
//! Every read/write along the pipeline returns `Result<_, Status>`. A partial
//! frame is not an error: readers that emit zeros mark the frame `INCOMPLETE`
//! and return `Ok`. The `Err` side carries the conditions that change control
//! flow.

use thiserror::Error;

/// Non-success pipeline conditions.
///
/// `Drain` is routine (upstream has nothing right now) and is swallowed by
/// readers that can tolerate an empty upstream. `Finish` ends the session
/// cleanly; `Abort` ends it because of a protocol violation. Both are
/// propagated to the mixer, which removes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    /// Upstream is empty; no data available right now.
    #[error("upstream drained")]
    Drain,
    /// Buffer or packet allocation failed.
    #[error("allocation failed")]
    NoMem,
    /// No route for the packet (unknown flags or source).
    #[error("no route for packet")]
    NoRoute,
    /// Session ended cleanly (watchdog timeout, stream over).
    #[error("session finished")]
    Finish,
    /// Fatal protocol violation (latency bounds, SBN jump, bad repair).
    #[error("session aborted")]
    Abort,
}

/// Configuration and validation errors.
///
/// Most variants are returned by component constructors, which validate
/// their configuration in `new()` and refuse to build instead of panicking
/// later. `InvalidFecBlock` is the exception: block geometry only becomes
/// known with the first packet of a block, so the block reader produces it
/// from its runtime geometry validation and drops the offending packet.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid latency config: target={target}ns tolerance={tolerance}ns")]
    InvalidLatency { target: i64, tolerance: i64 },

    #[error("invalid frequency estimator interval: {0}ns")]
    InvalidFeInterval(i64),

    #[error("invalid sample spec: {0}")]
    InvalidSampleSpec(String),

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("sample rate mismatch: in={input} out={output}")]
    RateMismatch { input: u32, output: u32 },

    #[error("channel set mismatch: in={input} out={output}")]
    ChannelMismatch { input: usize, output: usize },

    #[error("scaling factor out of supported range: {0}")]
    BadScaling(f64),

    #[error("invalid fec block geometry: sbl={sbl} bl={bl}")]
    InvalidFecBlock { sbl: usize, bl: usize },

    #[error("io error: {0}")]
    Io(String),
}
