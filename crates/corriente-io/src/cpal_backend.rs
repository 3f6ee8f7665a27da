//! cpal-based implementation of the engine's audio backend contract.
//!
//! The engine hands [`open`](corriente_core::AudioBackend::open) a duplex
//! callback expecting exactly one fixed-size block per invocation. cpal
//! delivers buffers of whatever length the platform chooses and exposes
//! input and output as separate streams, so this backend adapts both: a
//! staging buffer re-blocks the output callback, and captured input crosses
//! from the input stream to the output callback over a lock-free ring.

use cpal::Host;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use corriente_core::{AudioBackend, DeviceInfo, DuplexCallback, IoConfig};

use crate::Error;

/// Extract device name via `description()` (cpal 0.17+).
fn device_name(device: &cpal::Device) -> std::result::Result<String, cpal::DeviceNameError> {
    device.description().map(|d| d.name().to_string())
}

fn stream_err(err: impl std::fmt::Display) -> corriente_core::Error {
    corriente_core::Error::device(err.to_string())
}

/// Realtime audio backend over the platform's default cpal host.
pub struct CpalBackend {
    host: Host,
    output_stream: Option<cpal::Stream>,
    input_stream: Option<cpal::Stream>,
}

impl CpalBackend {
    /// Creates a backend on the platform's default audio host (ALSA on
    /// Linux, CoreAudio on macOS, WASAPI on Windows).
    pub fn new() -> Self {
        tracing::info!(
            host = cpal::default_host().id().name(),
            "cpal backend initialized"
        );
        Self {
            host: cpal::default_host(),
            output_stream: None,
            input_stream: None,
        }
    }

    /// Find a cpal output device by name, or return the default.
    fn find_output_device(&self, name: Option<&str>) -> corriente_core::Result<cpal::Device> {
        match name {
            Some(search) => {
                let search_lower = search.to_lowercase();
                let devices = self.host.output_devices().map_err(stream_err)?;
                for device in devices {
                    if let Ok(dev_name) = device_name(&device)
                        && dev_name.to_lowercase().contains(search_lower.as_str())
                    {
                        return Ok(device);
                    }
                }
                Err(Error::DeviceNotFound(format!("no output device matching '{search}'")).into())
            }
            None => self
                .host
                .default_output_device()
                .ok_or_else(|| Error::NoDevice.into()),
        }
    }

    /// Find a cpal input device by name, or return the default.
    fn find_input_device(&self, name: Option<&str>) -> corriente_core::Result<cpal::Device> {
        match name {
            Some(search) => {
                let search_lower = search.to_lowercase();
                let devices = self.host.input_devices().map_err(stream_err)?;
                for device in devices {
                    if let Ok(dev_name) = device_name(&device)
                        && dev_name.to_lowercase().contains(&search_lower)
                    {
                        return Ok(device);
                    }
                }
                Err(Error::DeviceNotFound(format!("no input device matching '{search}'")).into())
            }
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| Error::NoDevice.into()),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn list_devices(&self) -> corriente_core::Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();

        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                if let Ok(name) = device_name(&device) {
                    let sample_rate = device
                        .default_input_config()
                        .map(|c| c.sample_rate())
                        .unwrap_or(48000);
                    let is_output = device.default_output_config().is_ok();
                    devices.push(DeviceInfo {
                        name,
                        is_input: true,
                        is_output,
                        default_sample_rate: sample_rate,
                    });
                }
            }
        }

        if let Ok(outputs) = self.host.output_devices() {
            for device in outputs {
                if let Ok(name) = device_name(&device) {
                    if devices.iter().any(|d| d.name == name) {
                        continue;
                    }
                    let sample_rate = device
                        .default_output_config()
                        .map(|c| c.sample_rate())
                        .unwrap_or(48000);
                    devices.push(DeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        default_sample_rate: sample_rate,
                    });
                }
            }
        }

        Ok(devices)
    }

    fn open(&mut self, config: &IoConfig, mut callback: DuplexCallback) -> corriente_core::Result<()> {
        if self.output_stream.is_some() {
            return Err(corriente_core::Error::device("backend is already open"));
        }
        let frames = config.buffer_size as usize;
        let out_channels = config.output_channels as usize;
        let in_channels = config.input_channels as usize;

        // Captured input crosses from the input stream's callback to the
        // output stream's callback over a lock-free ring sized for a few
        // blocks of slack.
        let (mut capture_tx, mut capture_rx) =
            rtrb::RingBuffer::<f32>::new((frames * in_channels.max(1) * 8).max(64));

        if in_channels > 0 {
            let device = self.find_input_device(config.input_device.as_deref())?;
            let stream_config = cpal::StreamConfig {
                channels: config.input_channels,
                sample_rate: config.sample_rate,
                buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
            };
            let stream = device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            // Overrun drops samples; the render side fills
                            // shortfalls with silence.
                            let _ = capture_tx.push(sample);
                        }
                    },
                    move |err| {
                        tracing::error!(error = %err, "input stream error");
                    },
                    None,
                )
                .map_err(stream_err)?;
            self.input_stream = Some(stream);
            tracing::info!(
                channels = config.input_channels,
                sample_rate = config.sample_rate,
                "input stream opened"
            );
        }

        let device = self.find_output_device(config.output_device.as_deref())?;
        let stream_config = cpal::StreamConfig {
            channels: config.output_channels,
            sample_rate: config.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
        };

        // Re-blocking adapter: the engine produces exactly one block per
        // call; cpal asks for arbitrary lengths.
        let mut staged_in = vec![0.0f32; frames * in_channels];
        let mut staged_out = vec![0.0f32; frames * out_channels];
        let mut staged_pos = staged_out.len();

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut written = 0;
                    while written < data.len() {
                        if staged_pos == staged_out.len() {
                            for slot in staged_in.iter_mut() {
                                *slot = capture_rx.pop().unwrap_or(0.0);
                            }
                            callback(&staged_in, &mut staged_out);
                            staged_pos = 0;
                        }
                        let n = (data.len() - written).min(staged_out.len() - staged_pos);
                        data[written..written + n]
                            .copy_from_slice(&staged_out[staged_pos..staged_pos + n]);
                        staged_pos += n;
                        written += n;
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "output stream error");
                },
                None,
            )
            .map_err(stream_err)?;
        // Built streams may autostart on some hosts; hold them until start().
        stream.pause().map_err(stream_err)?;
        self.output_stream = Some(stream);
        tracing::info!(
            channels = config.output_channels,
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            "output stream opened"
        );
        Ok(())
    }

    fn start(&mut self) -> corriente_core::Result<()> {
        let stream = self
            .output_stream
            .as_ref()
            .ok_or_else(|| corriente_core::Error::device("backend is not open"))?;
        if let Some(input) = self.input_stream.as_ref() {
            input.play().map_err(stream_err)?;
        }
        stream.play().map_err(stream_err)?;
        tracing::info!("audio streams started");
        Ok(())
    }

    fn stop(&mut self) -> corriente_core::Result<()> {
        let stream = self
            .output_stream
            .as_ref()
            .ok_or_else(|| corriente_core::Error::device("backend is not open"))?;
        stream.pause().map_err(stream_err)?;
        if let Some(input) = self.input_stream.as_ref() {
            input.pause().map_err(stream_err)?;
        }
        tracing::info!("audio streams paused");
        Ok(())
    }

    fn close(&mut self) -> corriente_core::Result<()> {
        self.output_stream = None;
        self.input_stream = None;
        tracing::info!("audio streams closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name() {
        let backend = CpalBackend::new();
        assert_eq!(AudioBackend::name(&backend), "cpal");
    }

    #[test]
    fn list_devices_does_not_panic() {
        let backend = CpalBackend::new();
        // Device availability depends on the machine; only the call itself
        // is under test.
        assert!(backend.list_devices().is_ok());
    }

    #[test]
    fn start_before_open_is_device_error() {
        let mut backend = CpalBackend::new();
        assert!(matches!(
            backend.start().unwrap_err(),
            corriente_core::Error::Device(_)
        ));
    }
}
