//! Error types for soundstage
//!
//! Defines engine-wide error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for the audio engine
#[derive(Error, Debug)]
pub enum Error {
    /// Audio output device errors (open, negotiate, write)
    #[error("Sink error: {0}")]
    Sink(String),

    /// Resampler construction or processing errors
    #[error("Resample error: {0}")]
    Resample(String),

    /// Format validation or negotiation errors
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Operation not valid in the engine's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Engine rejected the request (busy, unknown handle, out-of-range value)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Request did not complete within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Message channel to the engine thread is closed (engine shut down)
    #[error("Engine unavailable: channel closed")]
    ChannelClosed,

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
