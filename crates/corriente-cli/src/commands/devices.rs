//! Audio device listing command.

use clap::Args;
use corriente_core::AudioBackend;
use corriente_io::CpalBackend;

#[derive(Args)]
pub struct DevicesArgs {}

pub fn run(_args: DevicesArgs) -> anyhow::Result<()> {
    let backend = CpalBackend::new();
    let devices = backend.list_devices()?;

    if devices.is_empty() {
        println!("No audio devices found.");
        return Ok(());
    }

    let inputs: Vec<_> = devices.iter().filter(|d| d.is_input).collect();
    if !inputs.is_empty() {
        println!("Input Devices:");
        for (idx, device) in inputs.iter().enumerate() {
            println!(
                "  [{}] {} ({} Hz)",
                idx, device.name, device.default_sample_rate
            );
        }
        println!();
    }

    let outputs: Vec<_> = devices.iter().filter(|d| d.is_output).collect();
    if !outputs.is_empty() {
        println!("Output Devices:");
        for (idx, device) in outputs.iter().enumerate() {
            println!(
                "  [{}] {} ({} Hz)",
                idx, device.name, device.default_sample_rate
            );
        }
        println!();
    }

    println!("Total: {} input(s), {} output(s)", inputs.len(), outputs.len());
    Ok(())
}
