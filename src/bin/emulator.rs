//! Emulator binary - generates synthetic Pixie-16 spills
//!
//! Usage:
//!   cargo run --bin emulator -- -o ./data                  # Write run_<n>.ldf
//!   cargo run --bin emulator -- -s 127.0.0.1:5555          # Broadcast over UDP
//!   cargo run --bin emulator -- -o ./data -n 100 --seed 42 # Fixed run

use clap::Parser;
use pixie_scan::common::{setup_shutdown, EmulatorArgs};
use pixie_scan::config::Config;
use pixie_scan::emulator::{Emulator, UdpSink};
use pixie_scan::ldf::OutputFile;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pixie_scan=info".parse()?))
        .init();

    let args = match EmulatorArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(2);
        }
    };

    let config_path = &args.common.config_file;
    let config = Config::load_or_default(config_path)?;
    info!(config_file = %config_path, "Loaded configuration");

    let mut emulator_config = config.emulator.clone();
    if let Some(spills) = args.spills {
        emulator_config.spills = spills;
    }
    if args.seed.is_some() {
        emulator_config.seed = args.seed;
    }

    let mask = config.decoder.default_mask()?;
    let mut emulator = Emulator::new(emulator_config, mask)?;
    let (_shutdown_tx, shutdown_rx) = setup_shutdown();

    let spills = match (&args.output_dir, &args.send) {
        (Some(dir), None) => {
            let mut output = match OutputFile::open_new(
                dir,
                config.output.prefix.as_str(),
                config.output.title.as_str(),
                config.output.run_number,
                config.output.max_file_bytes(),
            ) {
                Ok(output) => output,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            let spills = emulator.run(&mut output, shutdown_rx).await?;
            println!("Wrote {} spills to {}", spills, output.path().display());
            spills
        }
        (None, Some(target)) => {
            let mut sink = UdpSink::connect(target)?;
            emulator.run(&mut sink, shutdown_rx).await?
        }
        (None, None) => {
            let target = config.socket.target.clone();
            let mut sink = UdpSink::connect(&target)?;
            emulator.run(&mut sink, shutdown_rx).await?
        }
        (Some(_), Some(_)) => {
            eprintln!("Error: --output and --send are mutually exclusive");
            std::process::exit(2);
        }
    };

    info!(spills, "Emulator finished");
    Ok(())
}
