//! Emulator - generates synthetic Pixie-16 spills for testing
//!
//! Each event is one front-strip hit and one back-strip hit of a
//! double-sided strip detector. Most events are low-energy decays that
//! land on a pixel which recently saw a high-energy implant, so the
//! correlator has chains to build.
//!
//! Spill layout produced:
//! ```text
//! [len, 0, records...] [len, 1, records...] ... [4, 1000, time_lo, time_hi]
//! ```
//! Modules without hits are written as empty 6-word segments.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info};

use crate::common::ShutdownReceiver;
use crate::decoder::{encode_segment, ChannelRecord, ListModeMask};
use crate::ldf::{LdfError, OutputFile};
use crate::scan::{broadcast_spill, send_control, ControlMessage, SocketError};
use crate::unpacker::{EMPTY_MODULE_WORDS, WALL_CLOCK_VSN};

/// Channels per Pixie-16 module
const CHANNELS_PER_MODULE: u32 = 16;

/// Pixels remembered as decay candidates
const RECENT_IMPLANTS: usize = 32;

fn default_spills() -> u64 {
    10
}

fn default_modules() -> u32 {
    4
}

fn default_events_per_spill() -> usize {
    500
}

fn default_front_modules() -> Vec<u32> {
    vec![0, 1]
}

fn default_back_modules() -> Vec<u32> {
    vec![2, 3]
}

fn default_implant_fraction() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

/// Emulator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmulatorConfig {
    /// Spills to generate (0 = until shutdown)
    #[serde(default = "default_spills")]
    pub spills: u64,
    /// Modules in the crate; each spill carries a segment per module
    #[serde(default = "default_modules")]
    pub modules: u32,
    #[serde(default = "default_events_per_spill")]
    pub events_per_spill: usize,
    /// Interval between spills in milliseconds (0 = maximum speed)
    #[serde(default)]
    pub spill_interval_ms: u64,
    #[serde(default = "default_front_modules")]
    pub front_modules: Vec<u32>,
    #[serde(default = "default_back_modules")]
    pub back_modules: Vec<u32>,
    /// Fraction of events that are implants
    #[serde(default = "default_implant_fraction")]
    pub implant_fraction: f64,
    /// Samples per trace (0 = no traces)
    #[serde(default)]
    pub trace_samples: usize,
    /// Append a wall-clock block to every spill
    #[serde(default = "default_true")]
    pub wall_clock: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            spills: default_spills(),
            modules: default_modules(),
            events_per_spill: default_events_per_spill(),
            spill_interval_ms: 0,
            front_modules: default_front_modules(),
            back_modules: default_back_modules(),
            implant_fraction: default_implant_fraction(),
            trace_samples: 0,
            wall_clock: true,
            seed: None,
        }
    }
}

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("File error: {0}")]
    Ldf(#[from] LdfError),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Invalid emulator configuration: {0}")]
    Config(String),
}

/// Destination for generated spills
pub trait SpillSink {
    fn send_spill(&mut self, words: &[u32]) -> Result<(), EmulatorError>;

    fn finish(&mut self) -> Result<(), EmulatorError> {
        Ok(())
    }
}

impl SpillSink for Vec<Vec<u32>> {
    fn send_spill(&mut self, words: &[u32]) -> Result<(), EmulatorError> {
        self.push(words.to_vec());
        Ok(())
    }
}

impl SpillSink for OutputFile {
    fn send_spill(&mut self, words: &[u32]) -> Result<(), EmulatorError> {
        self.write_spill(words)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EmulatorError> {
        self.close()?;
        Ok(())
    }
}

/// Broadcasts spills as datagrams
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
    opened: bool,
}

impl UdpSink {
    pub fn connect(target: &str) -> Result<Self, EmulatorError> {
        let target = target
            .to_socket_addrs()
            .map_err(SocketError::from)?
            .next()
            .ok_or_else(|| EmulatorError::Config(format!("cannot resolve {}", target)))?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(SocketError::from)?;
        info!(target = %target, "Broadcasting spills");
        Ok(Self {
            socket,
            target,
            opened: false,
        })
    }
}

impl SpillSink for UdpSink {
    fn send_spill(&mut self, words: &[u32]) -> Result<(), EmulatorError> {
        if !self.opened {
            send_control(&self.socket, self.target, ControlMessage::OpenFile)?;
            self.opened = true;
        }
        let datagrams = broadcast_spill(&self.socket, self.target, words)?;
        debug!(words = words.len(), datagrams, "Broadcast spill");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EmulatorError> {
        send_control(&self.socket, self.target, ControlMessage::CloseFile)?;
        Ok(())
    }
}

/// Synthetic spill generator
pub struct Emulator {
    config: EmulatorConfig,
    mask: ListModeMask,
    rng: StdRng,
    /// Filter clock of the last generated hit
    clock: u64,
    recent_implants: Vec<(u32, u32)>,
    spills_generated: u64,
    implant_energy: Normal<f64>,
    decay_energy: Normal<f64>,
}

impl Emulator {
    pub fn new(config: EmulatorConfig, mask: ListModeMask) -> Result<Self, EmulatorError> {
        if config.front_modules.is_empty() || config.back_modules.is_empty() {
            return Err(EmulatorError::Config(
                "front and back modules are required".into(),
            ));
        }
        if let Some(m) = config
            .front_modules
            .iter()
            .chain(&config.back_modules)
            .find(|&&m| m >= config.modules)
        {
            return Err(EmulatorError::Config(format!(
                "module {} is outside the {} configured modules",
                m, config.modules
            )));
        }
        if !(0.0..=1.0).contains(&config.implant_fraction) {
            return Err(EmulatorError::Config(
                "implant_fraction must be within [0, 1]".into(),
            ));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let implant_energy =
            Normal::new(20_000.0, 800.0).map_err(|e| EmulatorError::Config(e.to_string()))?;
        let decay_energy =
            Normal::new(1_200.0, 60.0).map_err(|e| EmulatorError::Config(e.to_string()))?;

        Ok(Self {
            config,
            mask,
            rng,
            clock: 0,
            recent_implants: Vec::new(),
            spills_generated: 0,
            implant_energy,
            decay_energy,
        })
    }

    pub fn spills_generated(&self) -> u64 {
        self.spills_generated
    }

    fn strip_hit(&mut self, modules: &[u32], strip: u32, energy: u32) -> ChannelRecord {
        let index = (strip / CHANNELS_PER_MODULE) as usize % modules.len();
        let module = modules[index];
        let trace = if self.config.trace_samples > 0 {
            self.generate_trace(energy)
        } else {
            Vec::new()
        };
        ChannelRecord {
            module,
            slot: module + 2,
            channel: strip % CHANNELS_PER_MODULE,
            event_time_low: (self.clock & 0xFFFF_FFFF) as u32,
            event_time_high: ((self.clock >> 32) & 0xFFFF) as u32,
            energy,
            pileup: self.rng.gen_ratio(1, 100),
            trace,
            ..Default::default()
        }
    }

    /// Baseline, fast rise, exponential decay
    fn generate_trace(&mut self, energy: u32) -> Vec<u16> {
        let n = self.config.trace_samples & !1;
        let baseline = 400.0 + self.rng.gen_range(-20.0..20.0);
        let amplitude = f64::from(energy) / 65535.0 * 12_000.0;
        let rise_time = 5;
        let decay_tau = 50.0;
        let pulse_start = self.rng.gen_range(n / 4..(n / 2).max(n / 4 + 1));

        (0..n)
            .map(|i| {
                let value = if i < pulse_start {
                    baseline
                } else if i < pulse_start + rise_time {
                    let frac = (i - pulse_start) as f64 / rise_time as f64;
                    baseline + amplitude * frac
                } else {
                    let t = (i - pulse_start - rise_time) as f64;
                    baseline + amplitude * (-t / decay_tau).exp()
                };
                value.clamp(0.0, 65535.0) as u16
            })
            .collect()
    }

    fn pick_pixel(&mut self, implant: bool) -> (u32, u32) {
        let front_strips = self.config.front_modules.len() as u32 * CHANNELS_PER_MODULE;
        let back_strips = self.config.back_modules.len() as u32 * CHANNELS_PER_MODULE;
        if !implant && !self.recent_implants.is_empty() && self.rng.gen_bool(0.8) {
            let i = self.rng.gen_range(0..self.recent_implants.len());
            return self.recent_implants[i];
        }
        (
            self.rng.gen_range(0..front_strips),
            self.rng.gen_range(0..back_strips),
        )
    }

    /// Generate one spill of raw words
    pub fn generate_spill(&mut self) -> Vec<u32> {
        let mut per_module: Vec<Vec<ChannelRecord>> =
            vec![Vec::new(); self.config.modules as usize];
        let front_modules = self.config.front_modules.clone();
        let back_modules = self.config.back_modules.clone();

        for _ in 0..self.config.events_per_spill {
            self.clock += self.rng.gen_range(100..10_000);
            let implant = self.rng.gen_bool(self.config.implant_fraction);
            let (front, back) = self.pick_pixel(implant);
            let energy = if implant {
                self.implant_energy.sample(&mut self.rng)
            } else {
                self.decay_energy.sample(&mut self.rng)
            }
            .clamp(0.0, 65535.0) as u32;

            if implant {
                if self.recent_implants.len() >= RECENT_IMPLANTS {
                    self.recent_implants.remove(0);
                }
                self.recent_implants.push((front, back));
            }

            let front_hit = self.strip_hit(&front_modules, front, energy);
            let back_energy = (f64::from(energy) * self.rng.gen_range(0.95..1.05)) as u32;
            let back_hit = self.strip_hit(&back_modules, back, back_energy.min(65535));
            per_module[front_hit.module as usize].push(front_hit);
            per_module[back_hit.module as usize].push(back_hit);
        }

        let mut words = Vec::new();
        for (module, records) in per_module.iter().enumerate() {
            if records.is_empty() {
                words.extend_from_slice(&[EMPTY_MODULE_WORDS, module as u32, 0, 0, 0, 0]);
            } else {
                words.extend(encode_segment(&self.mask, module as u32, records));
            }
        }
        if self.config.wall_clock {
            let seconds = Utc::now().timestamp() as u64;
            words.extend_from_slice(&[
                4,
                WALL_CLOCK_VSN,
                (seconds & 0xFFFF_FFFF) as u32,
                (seconds >> 32) as u32,
            ]);
        }

        self.spills_generated += 1;
        words
    }

    /// Generate `config.spills` spills into `sink`, or until shutdown
    pub async fn run<S: SpillSink>(
        &mut self,
        sink: &mut S,
        mut shutdown: ShutdownReceiver,
    ) -> Result<u64, EmulatorError> {
        let use_ticker = self.config.spill_interval_ms > 0;
        let mut ticker = interval(Duration::from_millis(self.config.spill_interval_ms.max(1)));

        info!(
            spills = self.config.spills,
            modules = self.config.modules,
            events_per_spill = self.config.events_per_spill,
            "Emulator started"
        );

        loop {
            if self.config.spills > 0 && self.spills_generated >= self.config.spills {
                break;
            }
            if use_ticker {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Emulator received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
            } else if shutdown.try_recv().is_ok() {
                info!("Emulator received shutdown signal");
                break;
            }

            let words = self.generate_spill();
            sink.send_spill(&words)?;
            debug!(spill = self.spills_generated, words = words.len(), "Generated spill");
            if !use_ticker {
                tokio::task::yield_now().await;
            }
        }

        sink.finish()?;
        info!(spills = self.spills_generated, "Emulator stopped");
        Ok(self.spills_generated)
    }
}
