//! Offline rendering command.

use std::path::PathBuf;

use clap::Args;
use serde::Deserialize;

use corriente_core::{Driver, Server, ServerConfig};
use corriente_dsp::{Biquad, Fader, Sine};
use corriente_io::WavSink;

#[derive(Args)]
pub struct RenderArgs {
    /// Output WAV file
    #[arg(short, long, default_value = "out.wav")]
    output: PathBuf,

    /// Seconds of audio to render
    #[arg(short, long, default_value_t = 5.0)]
    duration: f64,

    /// Oscillator frequencies in Hz; each entry becomes a parallel voice
    #[arg(short, long, value_delimiter = ',', default_value = "220,277.18,329.63")]
    freq: Vec<f64>,

    /// Lowpass cutoff in Hz
    #[arg(long, default_value_t = 3000.0)]
    cutoff: f64,

    /// Bit depth of the output file (32 = float, 16/24 = PCM)
    #[arg(long, default_value_t = 32)]
    bits: u16,

    /// Optional TOML file with a [server] section
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FileSettings {
    server: ServerConfig,
}

pub fn run(args: RenderArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let settings: FileSettings = toml::from_str(&text)?;
            settings.server
        }
        None => ServerConfig::default(),
    };
    let sample_rate = config.sample_rate;
    let channels = config.channels;

    let sink = WavSink::create(&args.output, sample_rate, channels as u16, args.bits)?;
    let mut server = Server::new(config);
    server.boot(Driver::offline(sink, args.duration))?;

    // A small additive patch: enveloped sines through a lowpass, folded
    // down to the output channel count.
    let env = server.add(Fader::new().fadein(0.05).fadeout(0.5).dur(args.duration))?;
    let voices = server.add(
        Sine::new()
            .freq(args.freq.clone())
            .mul(env)
            .add(0.0),
    )?;
    let filtered = server.add(Biquad::new(voices).freq(args.cutoff).q(0.8))?;
    let mixed = filtered.mix(&mut server, channels)?;
    mixed.out(&mut server, 0, 1, 0.0, 0.0)?;

    tracing::info!(
        output = %args.output.display(),
        duration = args.duration,
        voices = voices.nstreams(),
        "rendering"
    );
    server.start()?;
    server.shutdown()?;

    println!(
        "Rendered {:.2} s ({} voices) to {}",
        args.duration,
        args.freq.len(),
        args.output.display()
    );
    Ok(())
}
