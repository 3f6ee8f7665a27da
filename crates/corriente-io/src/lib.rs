//! Audio I/O layer for the corriente engine.
//!
//! Implements the engine's external-collaborator contracts:
//!
//! - [`CpalBackend`] — realtime duplex device I/O through
//!   [cpal](https://crates.io/crates/cpal) (ALSA, CoreAudio, WASAPI),
//!   implementing [`corriente_core::AudioBackend`].
//! - [`WavSink`] — a streaming WAV file sink for offline rendering,
//!   implementing [`corriente_core::RenderSink`].
//! - [`WavDecoder`] — WAV probing/decoding for sound-file-backed tables,
//!   implementing [`corriente_core::SoundDecoder`].

mod cpal_backend;
mod wav;

pub use cpal_backend::CpalBackend;
pub use wav::{WavDecoder, WavSink};

/// Error types for audio I/O operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// WAV file read/write error.
    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),

    /// Audio stream setup or runtime error.
    #[error("audio stream error: {0}")]
    Stream(String),

    /// No audio device available on the system.
    #[error("no audio device available")]
    NoDevice,

    /// The requested audio device was not found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for audio I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for corriente_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Wav(e) => corriente_core::Error::decode(e.to_string()),
            Error::Io(e) => corriente_core::Error::decode(e.to_string()),
            other => corriente_core::Error::device(other.to_string()),
        }
    }
}
