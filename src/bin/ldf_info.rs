//! ldf_info - inspection tool for .ldf files
//!
//! Usage:
//!   ldf_info info <file>                      - Show DIR and HEAD buffers
//!   ldf_info validate <file> [--json]         - Walk every spill and count
//!   ldf_info dump <file> [-n N] [--decode]    - Print the first spills

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use clap::Parser;
use pixie_scan::builder::{BuilderConfig, RawEvent};
use pixie_scan::common::{LdfInfoArgs, LdfInfoCommand};
use pixie_scan::config::Config;
use pixie_scan::ldf::{LdfError, LdfReader, ReaderStats, SpillRead};
use pixie_scan::unpacker::{Unpacker, UnpackerConfig};
use serde::Serialize;

/// Largest spill accepted while walking a file
const MAX_SPILL_WORDS: usize = 1 << 24;

/// Words printed per line in `dump`
const WORDS_PER_LINE: usize = 8;

fn main() {
    let args = match LdfInfoArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(2);
        }
    };

    let result = match args.command {
        LdfInfoCommand::Info { file } => show_info(&file),
        LdfInfoCommand::Validate { file, json } => validate_file(&file, json),
        LdfInfoCommand::Dump {
            file,
            spills,
            decode,
        } => dump_file(&file, spills, decode),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open(path: &Path) -> Result<LdfReader<BufReader<File>>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    Ok(LdfReader::new(BufReader::new(file)))
}

fn show_info(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = open(path)?;

    println!("File: {}", path.display());
    println!("Size: {} bytes", std::fs::metadata(path)?.len());
    println!();

    match reader.read_directory()? {
        Some(dir) => {
            println!("=== Directory ===");
            println!("  Buffers:        {}", dir.total_buffers);
            println!("  Run Number:     {}", dir.run_number);
        }
        None => println!("\x1b[33mNo DIR buffer\x1b[0m"),
    }

    println!();
    match reader.read_header()? {
        Some(head) => {
            println!("=== Header ===");
            println!("  Facility:       {}", head.facility.trim());
            println!("  Format:         {}", head.format.trim());
            println!("  Type:           {}", head.kind.trim());
            println!("  Date:           {}", head.date.trim());
            println!("  Title:          {}", head.title.trim());
            println!("  Run Number:     {}", head.run_number);
        }
        None => println!("\x1b[33mNo HEAD buffer\x1b[0m"),
    }

    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct ValidationReport {
    file: String,
    good_spills: u64,
    fragments: u64,
    corrupt_spills: u64,
    words: u64,
    largest_spill: usize,
    runs: u32,
    recovered_errors: u64,
    missing_chunks: u64,
    skipped_buffers: u64,
    /// Set when the file ended without its closing EOF buffers
    truncated: Option<String>,
}

impl ValidationReport {
    fn absorb(&mut self, stats: ReaderStats) {
        self.missing_chunks = stats.missing_chunks;
        self.skipped_buffers = stats.skipped_buffers;
    }

    fn is_valid(&self) -> bool {
        self.fragments == 0
            && self.corrupt_spills == 0
            && self.recovered_errors == 0
            && self.truncated.is_none()
    }
}

fn validate_file(path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = open(path)?;
    reader.read_directory()?;
    reader.read_header()?;

    let mut report = ValidationReport {
        file: path.display().to_string(),
        ..Default::default()
    };

    loop {
        match reader.read_spill(MAX_SPILL_WORDS) {
            Ok(SpillRead::Spill(spill)) => {
                if spill.is_good() {
                    report.good_spills += 1;
                    report.words += spill.words.len() as u64;
                    report.largest_spill = report.largest_spill.max(spill.words.len());
                } else if spill.corrupt {
                    report.corrupt_spills += 1;
                } else {
                    report.fragments += 1;
                }
            }
            Ok(SpillRead::EndOfRun) => report.runs += 1,
            Ok(SpillRead::EndOfFile) => break,
            Err(e @ (LdfError::UnexpectedEof { .. } | LdfError::Io(_))) => {
                report.truncated = Some(e.to_string());
                break;
            }
            Err(e) if e.is_recoverable() => {
                if !json {
                    println!("  \x1b[33m{}\x1b[0m", e);
                }
                report.recovered_errors += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    report.absorb(reader.stats());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Validating: {}", path.display());
    println!();
    println!("  Good spills:    {}", report.good_spills);
    println!("  Fragments:      {}", report.fragments);
    println!("  Corrupt spills: {}", report.corrupt_spills);
    println!("  Words:          {}", report.words);
    println!("  Largest spill:  {} words", report.largest_spill);
    println!("  Runs:           {}", report.runs);
    println!("  Missing chunks: {}", report.missing_chunks);
    println!("  Skipped:        {} buffers", report.skipped_buffers);

    if report.is_valid() {
        println!("\n\x1b[32m✓ File is valid\x1b[0m");
    } else if let Some(reason) = &report.truncated {
        println!("\n\x1b[33m⚠ File is truncated: {}\x1b[0m", reason);
    } else {
        println!("\n\x1b[31m✗ File has damaged spills\x1b[0m");
    }

    Ok(())
}

fn dump_file(path: &Path, spills: usize, decode: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = open(path)?;
    reader.read_directory()?;
    reader.read_header()?;

    let mut unpacker = if decode {
        let config = Config::load_or_default("config.toml")?;
        Some(Unpacker::new(
            UnpackerConfig::default(),
            config.decoder.default_mask()?,
            BuilderConfig::default(),
        ))
    } else {
        None
    };

    let mut printed = 0;
    while printed < spills {
        let spill = match reader.read_spill(MAX_SPILL_WORDS)? {
            SpillRead::Spill(spill) => spill,
            SpillRead::EndOfRun => continue,
            SpillRead::EndOfFile => break,
        };
        printed += 1;

        println!(
            "=== Spill {} ({} words, full={}, corrupt={}) ===",
            printed,
            spill.words.len(),
            spill.full,
            spill.corrupt
        );

        match unpacker.as_mut() {
            None => {
                for (line, words) in spill.words.chunks(WORDS_PER_LINE).enumerate() {
                    let hex: Vec<String> = words.iter().map(|w| format!("{:08x}", w)).collect();
                    println!("{:>8}: {}", line * WORDS_PER_LINE, hex.join(" "));
                }
            }
            Some(unpacker) => {
                let mut events: Vec<RawEvent> = Vec::new();
                match unpacker.read_spill(&spill.words, &mut events) {
                    Ok(summary) => {
                        println!(
                            "  records={} events={} missing_modules={}",
                            summary.records, summary.events, summary.missing_modules
                        );
                        if let Some(time) = summary.wall_clock {
                            println!("  wall clock {}", time);
                        }
                        for (i, event) in events.iter().enumerate() {
                            println!("  event {} at {:.0}", i, event.start_time);
                            for r in event.iter() {
                                println!(
                                    "    mod {:>2} ch {:>2} E {:>6} t {:.3}{}",
                                    r.module,
                                    r.channel,
                                    r.energy,
                                    r.time,
                                    if r.pileup { " pileup" } else { "" }
                                );
                            }
                        }
                    }
                    Err(e) => println!("  \x1b[31m{}\x1b[0m", e),
                }
            }
        }
        println!();
    }

    Ok(())
}
