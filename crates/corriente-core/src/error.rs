//! Error types for the corriente engine.

use thiserror::Error;

/// Errors surfaced by the engine's control-side API.
///
/// All variants are raised at control time (construction, lifecycle,
/// configuration). Failures inside a node's per-cycle computation never reach
/// this enum: the offending node's output degrades to silence for that cycle
/// and the failure is reported through `tracing`.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction-time parameters: empty list arguments, sizes of
    /// zero, unsupported mode indices, rate mismatches across a resampling
    /// boundary. The object is not created.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The audio backend could not be opened, started, stopped or closed.
    /// The server remains in its previous lifecycle state.
    #[error("audio device error: {0}")]
    Device(String),

    /// The operation is not valid in the server's current lifecycle state
    /// (e.g. building nodes before `boot`, changing the sampling rate while
    /// booted). Nothing is partially mutated.
    #[error("invalid in current state: {0}")]
    State(String),

    /// A sound-file decoder failed while filling a table.
    #[error("sound file decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a device error.
    pub fn device(message: impl Into<String>) -> Self {
        Error::Device(message.into())
    }

    /// Create a lifecycle-state error.
    pub fn state(message: impl Into<String>) -> Self {
        Error::State(message.into())
    }

    /// Create a decoder error.
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode(message.into())
    }
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_display() {
        let err = Error::config("freq list cannot be empty");
        assert_eq!(
            err.to_string(),
            "invalid configuration: freq list cannot be empty"
        );
    }

    #[test]
    fn device_display() {
        let err = Error::device("no output device");
        assert_eq!(err.to_string(), "audio device error: no output device");
    }

    #[test]
    fn state_display() {
        let err = Error::state("server is not booted");
        assert_eq!(err.to_string(), "invalid in current state: server is not booted");
    }

    #[test]
    fn factories_produce_matching_variants() {
        assert!(matches!(Error::config("x"), Error::Config(_)));
        assert!(matches!(Error::device("x"), Error::Device(_)));
        assert!(matches!(Error::state("x"), Error::State(_)));
        assert!(matches!(Error::decode("x"), Error::Decode(_)));
    }
}
