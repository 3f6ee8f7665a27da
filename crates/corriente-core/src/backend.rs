//! External collaborator contracts: audio devices, render sinks, sound-file
//! decoders and control-event transports.
//!
//! The engine core never talks to a platform audio API, a file format or a
//! wire protocol directly. It consumes these traits; the `corriente-io` crate
//! provides the default implementations (cpal devices, WAV files).

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// Information about one audio device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Whether the device supports audio input.
    pub is_input: bool,
    /// Whether the device supports audio output.
    pub is_output: bool,
    /// Default sample rate in Hz.
    pub default_sample_rate: u32,
}

/// Stream parameters handed to [`AudioBackend::open`].
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per callback invocation.
    pub buffer_size: u32,
    /// Output channel count.
    pub output_channels: u16,
    /// Input channel count; 0 disables capture.
    pub input_channels: u16,
    /// Optional output device name filter (system default if `None`).
    pub output_device: Option<String>,
    /// Optional input device name filter (system default if `None`).
    pub input_device: Option<String>,
}

/// The per-buffer duplex callback.
///
/// Invoked on the real-time audio thread with one interleaved input block of
/// `buffer_size * input_channels` samples (empty when not capturing) and one
/// interleaved output block of `buffer_size * output_channels` samples to
/// fill. Implementations must not allocate, lock or perform I/O.
pub type DuplexCallback = Box<dyn FnMut(&[f32], &mut [f32]) + Send>;

/// Callback-based duplex audio device abstraction.
///
/// Object-safe so backends can be selected at runtime. Only the callback
/// signature is part of the engine's contract; everything else is the
/// backend's business.
pub trait AudioBackend: Send {
    /// Human-readable backend name (e.g. `"cpal"`).
    fn name(&self) -> &str;

    /// Enumerates available devices.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Binds the device(s) and installs the callback. The stream does not
    /// run until [`start`](AudioBackend::start).
    fn open(&mut self, config: &IoConfig, callback: DuplexCallback) -> Result<()>;

    /// Begins periodic callback invocation.
    fn start(&mut self) -> Result<()>;

    /// Halts callback invocation without releasing the device.
    fn stop(&mut self) -> Result<()>;

    /// Releases the device. The backend may be re-opened afterwards.
    fn close(&mut self) -> Result<()>;
}

/// Destination for offline-rendered audio.
///
/// Receives one interleaved buffer per processing cycle.
pub trait RenderSink: Send {
    /// Appends one interleaved buffer.
    fn append(&mut self, interleaved: &[f32]) -> Result<()>;

    /// Flushes and closes the sink. Called once at server shutdown.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory render sink, mainly for tests and analysis.
///
/// Cloneable access to the captured samples survives handing the sink itself
/// to the server.
pub struct MemorySink {
    data: std::sync::Arc<parking_lot::Mutex<Vec<f32>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self {
            data: std::sync::Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// A shared handle to the captured samples.
    pub fn buffer(&self) -> std::sync::Arc<parking_lot::Mutex<Vec<f32>>> {
        std::sync::Arc::clone(&self.data)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for MemorySink {
    fn append(&mut self, interleaved: &[f32]) -> Result<()> {
        self.data.lock().extend_from_slice(interleaved);
        Ok(())
    }
}

/// Metadata of a sound file, as reported by [`SoundDecoder::probe`].
#[derive(Debug, Clone)]
pub struct SoundInfo {
    /// Sample frames per channel.
    pub frames: u64,
    /// Duration in seconds.
    pub duration: f64,
    /// File sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
}

/// Sound-file decoder contract used by file-backed tables.
pub trait SoundDecoder {
    /// Reads file metadata without decoding sample data.
    fn probe(&self, path: &Path) -> Result<SoundInfo>;

    /// Decodes `[start, stop)` seconds into per-channel buffers. A `stop` of
    /// 0 means end-of-file; `channel` restricts decoding to one channel.
    fn decode(
        &self,
        path: &Path,
        start: f64,
        stop: f64,
        channel: Option<usize>,
    ) -> Result<Vec<Vec<f32>>>;
}

/// A discrete timestamped control event from an external transport.
///
/// The engine does not care about the wire format that produced it; MIDI and
/// OSC adapters reduce their messages to `(channel, value, timestamp)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlEvent {
    /// Logical channel the event addresses.
    pub channel: u32,
    /// Event payload value.
    pub value: f64,
    /// Seconds since the transport's epoch.
    pub timestamp: f64,
}

/// Last value per control-event channel, rebuilt as events drain each cycle.
#[derive(Debug, Default)]
pub struct EventMap {
    values: HashMap<u32, f32>,
}

impl EventMap {
    /// Records the latest value for a channel.
    #[inline]
    pub fn set(&mut self, channel: u32, value: f32) {
        self.values.insert(channel, value);
    }

    /// The last value seen on a channel, if any.
    #[inline]
    pub fn get(&self, channel: u32) -> Option<f32> {
        self.values.get(&channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates() {
        let mut sink = MemorySink::new();
        let shared = sink.buffer();
        sink.append(&[1.0, 2.0]).unwrap();
        sink.append(&[3.0]).unwrap();
        assert_eq!(*shared.lock(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn event_map_keeps_last_value() {
        let mut map = EventMap::default();
        assert_eq!(map.get(7), None);
        map.set(7, 0.25);
        map.set(7, 0.75);
        assert_eq!(map.get(7), Some(0.75));
    }
}
