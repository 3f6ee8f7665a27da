//! Realtime playback command.

use clap::Args;

use corriente_core::{Driver, Server, ServerConfig};
use corriente_dsp::{Fader, Sine};
use corriente_io::CpalBackend;

#[derive(Args)]
pub struct PlayArgs {
    /// Seconds to play before stopping
    #[arg(short, long, default_value_t = 5.0)]
    duration: f64,

    /// Oscillator frequencies in Hz; each entry becomes a parallel voice
    #[arg(short, long, value_delimiter = ',', default_value = "220,277.18,329.63")]
    freq: Vec<f64>,

    /// Output device name filter (system default if omitted)
    #[arg(long)]
    device: Option<String>,
}

pub fn run(args: PlayArgs) -> anyhow::Result<()> {
    let config = ServerConfig {
        output_device: args.device.clone(),
        amp: 0.5,
        ..ServerConfig::default()
    };
    let channels = config.channels;

    let mut server = Server::new(config);
    server.boot(Driver::realtime(CpalBackend::new()))?;

    let env = server.add(Fader::new().fadein(0.02).fadeout(0.2))?;
    let voices = server.add(Sine::new().freq(args.freq.clone()).mul(env))?;
    let mixed = voices.mix(&mut server, channels)?;
    mixed.out(&mut server, 0, 1, 0.0, 0.0)?;

    server.start()?;
    println!("Playing {} voices for {:.1} s...", args.freq.len(), args.duration);
    std::thread::sleep(std::time::Duration::from_secs_f64(args.duration.max(0.0)));
    server.stop()?;
    server.shutdown()?;
    Ok(())
}
