//! Scan binary - reads Pixie-16 spills from an .ldf file or UDP port
//!
//! Usage:
//!   cargo run --bin scan -- -i run_012.ldf            # Interactive prompt
//!   cargo run --bin scan -- -i run_012.ldf --batch    # Run to completion
//!   cargo run --bin scan -- -p 5555                   # Listen for spills
//!
//! Exit codes: 0 success, 1 input could not be opened, 2 bad arguments.

use std::fs::File;
use std::io::BufWriter;

use clap::Parser;
use pixie_scan::common::{setup_shutdown, ScanArgs, HELP_TEXT};
use pixie_scan::config::Config;
use pixie_scan::correlator::{
    CorrelationReport, Correlator, DssdProcessor, JsonLinesSink, ReportSink,
};
use pixie_scan::ldf::OutputFile;
use pixie_scan::scan::{run_command_loop, Pipeline, ScanController, ScanSession};
use pixie_scan::unpacker::Unpacker;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pixie_scan=info".parse()?))
        .init();

    let args = match ScanArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(2);
        }
    };

    let config_path = &args.common.config_file;
    let config = match Config::load_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(config_file = %config_path, error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };
    info!(config_file = %config_path, "Loaded configuration");

    let mut unpacker = Unpacker::new(
        config.unpacker.clone(),
        config.decoder.default_mask()?,
        config.builder.clone(),
    );
    for module in &config.decoder.modules {
        unpacker.set_module_mask(module.module, module.mask()?);
    }

    let reports = args.reports.clone().or_else(|| config.output.reports.clone());
    let sink: Box<dyn ReportSink + Send> = match &reports {
        Some(path) => {
            let file = match File::create(path) {
                Ok(file) => file,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Cannot create report file");
                    std::process::exit(1);
                }
            };
            info!(path = %path.display(), "Writing correlation reports");
            Box::new(JsonLinesSink::new(BufWriter::new(file)))
        }
        None => Box::new(Vec::<CorrelationReport>::new()),
    };
    let correlator = Correlator::with_sink(config.correlator.clone(), sink);
    let processor = DssdProcessor::new(config.processor.clone(), correlator);

    let mut pipeline = Pipeline::new(
        unpacker,
        Box::new(processor),
        config.input.max_spill_words,
    );
    if let Some(dir) = &config.output.directory {
        match OutputFile::open_new(
            dir,
            config.output.prefix.as_str(),
            config.output.title.as_str(),
            config.output.run_number,
            config.output.max_file_bytes(),
        ) {
            Ok(output) => pipeline = pipeline.with_output(output),
            Err(e) => {
                error!(directory = %dir.display(), error = %e, "Cannot open output file");
                std::process::exit(1);
            }
        }
    }

    let controller = ScanController::new(&config.socket);
    let opened = match (args.port, args.input.as_ref().or(config.input.file.as_ref())) {
        (Some(port), _) => controller.open_socket(port),
        (None, Some(path)) => controller.open_input_file(path),
        (None, None) => Ok(()),
    };
    if let Err(e) = opened {
        error!(error = %e, "Cannot open input");
        std::process::exit(1);
    }

    let (_shutdown_tx, mut shutdown_rx) = setup_shutdown();
    let session = ScanSession::spawn(controller.clone(), pipeline);

    if args.batch {
        if !controller.has_input() {
            error!("--batch requires --input or --port");
            std::process::exit(2);
        }
        controller.start()?;
        tokio::select! {
            _ = controller.wait_until_stopped() => {}
            _ = shutdown_rx.recv() => info!("Interrupted"),
        }
        session.shutdown().await?;
    } else {
        println!("{}", HELP_TEXT);
        run_command_loop(
            session,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_rx,
        )
        .await?;
    }

    if let Some(path) = reports {
        info!(path = %path.display(), "Correlation reports written");
    }
    Ok(())
}
