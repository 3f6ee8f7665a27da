//! WAV render sink and sound-file decoder.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavWriter};

use corriente_core::{RenderSink, SoundDecoder, SoundInfo};

use crate::{Error, Result};

/// Streaming WAV file sink for offline rendering.
///
/// Appends one interleaved buffer per processing cycle; the header is
/// finalized when the server shuts down (or the sink is dropped).
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    bits_per_sample: u16,
}

impl WavSink {
    /// Creates a WAV file at `path`.
    ///
    /// `bits_per_sample` of 32 writes IEEE float; 16 or 24 write PCM.
    pub fn create(
        path: impl AsRef<Path>,
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    ) -> Result<Self> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample,
            sample_format: if bits_per_sample == 32 {
                SampleFormat::Float
            } else {
                SampleFormat::Int
            },
        };
        let writer = WavWriter::create(path, spec)?;
        Ok(Self {
            writer: Some(writer),
            bits_per_sample,
        })
    }
}

impl RenderSink for WavSink {
    fn append(&mut self, interleaved: &[f32]) -> corriente_core::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(corriente_core::Error::state("render sink is finalized"));
        };
        if self.bits_per_sample == 32 {
            for &sample in interleaved {
                writer
                    .write_sample(sample)
                    .map_err(|e| corriente_core::Error::from(Error::Wav(e)))?;
            }
        } else {
            let max_val = (1i32 << (self.bits_per_sample - 1)) as f32;
            for &sample in interleaved {
                let int_sample = (sample * max_val).clamp(-max_val, max_val - 1.0) as i32;
                writer
                    .write_sample(int_sample)
                    .map_err(|e| corriente_core::Error::from(Error::Wav(e)))?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> corriente_core::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| corriente_core::Error::from(Error::Wav(e)))?;
            tracing::info!("render sink finalized");
        }
        Ok(())
    }
}

/// WAV probing and decoding for sound-file-backed tables.
#[derive(Debug, Default)]
pub struct WavDecoder;

impl WavDecoder {
    /// Creates a decoder.
    pub fn new() -> Self {
        Self
    }

    fn read_all(path: &Path) -> Result<(Vec<f32>, hound::WavSpec)> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let max_val = (1i32 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_val))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok((samples, spec))
    }
}

impl SoundDecoder for WavDecoder {
    fn probe(&self, path: &Path) -> corriente_core::Result<SoundInfo> {
        let reader = WavReader::open(path).map_err(Error::Wav)?;
        let spec = reader.spec();
        let total_samples = u64::from(reader.len());
        let frames = total_samples / u64::from(spec.channels);
        Ok(SoundInfo {
            frames,
            duration: frames as f64 / f64::from(spec.sample_rate),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    fn decode(
        &self,
        path: &Path,
        start: f64,
        stop: f64,
        channel: Option<usize>,
    ) -> corriente_core::Result<Vec<Vec<f32>>> {
        let (samples, spec) = Self::read_all(path).map_err(corriente_core::Error::from)?;
        let channels = spec.channels as usize;
        let frames = samples.len() / channels;

        let first = ((start.max(0.0) * f64::from(spec.sample_rate)) as usize).min(frames);
        let last = if stop <= 0.0 {
            frames
        } else {
            ((stop * f64::from(spec.sample_rate)) as usize).clamp(first, frames)
        };
        if first >= last {
            return Err(corriente_core::Error::decode(
                "requested window is empty",
            ));
        }

        let wanted: Vec<usize> = match channel {
            Some(ch) => {
                if ch >= channels {
                    return Err(corriente_core::Error::decode(format!(
                        "channel {ch} out of range (file has {channels})"
                    )));
                }
                vec![ch]
            }
            None => (0..channels).collect(),
        };

        let mut out: Vec<Vec<f32>> = wanted
            .iter()
            .map(|_| Vec::with_capacity(last - first))
            .collect();
        for frame in first..last {
            for (k, &ch) in wanted.iter().enumerate() {
                out[k].push(samples[frame * channels + ch]);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_fixture(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 1000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for frame in 0..frames {
            for ch in 0..channels {
                writer
                    .write_sample(frame as f32 + f32::from(ch) * 1000.0)
                    .unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn sink_roundtrip_float() {
        let file = NamedTempFile::new().unwrap();
        let mut sink = WavSink::create(file.path(), 1000, 1, 32).unwrap();
        let block: Vec<f32> = (0..100).map(|i| (i as f32 / 100.0).sin()).collect();
        sink.append(&block).unwrap();
        sink.append(&block).unwrap();
        sink.finalize().unwrap();

        let decoder = WavDecoder::new();
        let info = decoder.probe(file.path()).unwrap();
        assert_eq!(info.frames, 200);
        assert_eq!(info.sample_rate, 1000);

        let chans = decoder.decode(file.path(), 0.0, 0.0, None).unwrap();
        assert_eq!(chans.len(), 1);
        for (i, &v) in chans[0].iter().take(100).enumerate() {
            assert!((v - block[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn append_after_finalize_is_state_error() {
        let file = NamedTempFile::new().unwrap();
        let mut sink = WavSink::create(file.path(), 1000, 1, 32).unwrap();
        sink.finalize().unwrap();
        assert!(matches!(
            sink.append(&[0.0]).unwrap_err(),
            corriente_core::Error::State(_)
        ));
    }

    #[test]
    fn decode_window_in_seconds() {
        let file = NamedTempFile::new().unwrap();
        write_fixture(file.path(), 1, 1000);

        let decoder = WavDecoder::new();
        // [0.25 s, 0.5 s) at 1 kHz = frames 250..500.
        let chans = decoder.decode(file.path(), 0.25, 0.5, None).unwrap();
        assert_eq!(chans[0].len(), 250);
        assert_eq!(chans[0][0], 250.0);
        assert_eq!(chans[0][249], 499.0);
    }

    #[test]
    fn decode_selects_channel() {
        let file = NamedTempFile::new().unwrap();
        write_fixture(file.path(), 2, 10);

        let decoder = WavDecoder::new();
        let chans = decoder.decode(file.path(), 0.0, 0.0, Some(1)).unwrap();
        assert_eq!(chans.len(), 1);
        assert_eq!(chans[0][3], 1003.0);

        let err = decoder.decode(file.path(), 0.0, 0.0, Some(5)).unwrap_err();
        assert!(matches!(err, corriente_core::Error::Decode(_)));
    }

    #[test]
    fn empty_window_rejected() {
        let file = NamedTempFile::new().unwrap();
        write_fixture(file.path(), 1, 100);
        let decoder = WavDecoder::new();
        let err = decoder.decode(file.path(), 0.5, 0.1, None).unwrap_err();
        assert!(matches!(err, corriente_core::Error::Decode(_)));
    }
}
