//! CLI argument parsing for the scan tools
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Common arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Arguments for the scan controller
#[derive(Parser, Debug, Clone)]
#[command(name = "scan", about = "Scan Pixie-16 list-mode data from .ldf files or the network")]
pub struct ScanArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Input .ldf file (overrides [input].file)
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Receive spills on this UDP port instead of reading a file
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Run the input to completion and exit without a prompt
    #[arg(short = 'b', long = "batch")]
    pub batch: bool,

    /// Write flagged correlation chains to this JSON-lines file
    #[arg(short = 'r', long = "reports")]
    pub reports: Option<PathBuf>,
}

/// Arguments for the spill emulator
#[derive(Parser, Debug, Clone)]
#[command(name = "emulator", about = "Generate synthetic Pixie-16 spills")]
pub struct EmulatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Write spills to .ldf files in this directory
    #[arg(short = 'o', long = "output")]
    pub output_dir: Option<PathBuf>,

    /// Broadcast spills to this UDP address (e.g. 127.0.0.1:5555)
    #[arg(short = 's', long = "send")]
    pub send: Option<String>,

    /// Number of spills to generate (overrides [emulator].spills)
    #[arg(short = 'n', long = "spills")]
    pub spills: Option<u64>,

    /// Random seed (overrides [emulator].seed)
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the .ldf inspection tool
#[derive(Parser, Debug, Clone)]
#[command(name = "ldf_info", about = "Inspect .ldf files")]
pub struct LdfInfoArgs {
    #[command(subcommand)]
    pub command: LdfInfoCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum LdfInfoCommand {
    /// Show the directory and header buffers
    Info { file: PathBuf },
    /// Walk every spill and report counts
    Validate {
        file: PathBuf,
        /// Emit the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the words of the first spills
    Dump {
        file: PathBuf,
        /// Number of spills to print
        #[arg(short = 'n', long = "spills", default_value_t = 1)]
        spills: usize,
        /// Decode the spills into channel records
        #[arg(long)]
        decode: bool,
    },
}
