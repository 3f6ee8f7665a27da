//! Corriente CLI — command-line interface for the corriente audio engine.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corriente")]
#[command(author, version, about = "Corriente audio engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a demo patch offline to a WAV file
    Render(commands::render::RenderArgs),

    /// Play a demo patch on the default audio device
    Play(commands::play::PlayArgs),

    /// List available audio devices
    Devices(commands::devices::DevicesArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Render(args) => commands::render::run(args),
        Commands::Play(args) => commands::play::run(args),
        Commands::Devices(args) => commands::devices::run(args),
    }
}
