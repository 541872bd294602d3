//! Feeds built events from a double-sided strip detector to the correlator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Condition, Correlator, CorrelatorEvent, EventKind, ReportSink};
use crate::builder::{EventProcessor, RawEvent};
use crate::decoder::ChannelRecord;

/// Channels per Pixie-16 module
const CHANNELS_PER_MODULE: u32 = 16;

fn default_front_modules() -> Vec<u32> {
    vec![0, 1]
}

fn default_back_modules() -> Vec<u32> {
    vec![2, 3]
}

fn default_implant_threshold() -> f64 {
    10_000.0
}

/// Strip mapping and classification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Modules instrumenting the front strips, in strip order
    #[serde(default = "default_front_modules")]
    pub front_modules: Vec<u32>,
    /// Modules instrumenting the back strips, in strip order
    #[serde(default = "default_back_modules")]
    pub back_modules: Vec<u32>,
    /// Front energies at or above this are implants
    #[serde(default = "default_implant_threshold")]
    pub implant_threshold: f64,
    /// Decays with energy in `[min, max)` flag their chain
    #[serde(default)]
    pub flag_energy: Option<(f64, f64)>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            front_modules: default_front_modules(),
            back_modules: default_back_modules(),
            implant_threshold: default_implant_threshold(),
            flag_energy: None,
        }
    }
}

impl ProcessorConfig {
    fn strip(modules: &[u32], record: &ChannelRecord) -> Option<u32> {
        modules
            .iter()
            .position(|&m| m == record.module)
            .map(|index| index as u32 * CHANNELS_PER_MODULE + record.channel)
    }

    pub fn front_strip(&self, record: &ChannelRecord) -> Option<u32> {
        Self::strip(&self.front_modules, record)
    }

    pub fn back_strip(&self, record: &ChannelRecord) -> Option<u32> {
        Self::strip(&self.back_modules, record)
    }
}

/// Processor statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub events: u64,
    /// Events without both a front and a back hit
    pub incomplete: u64,
    pub correlated: u64,
    pub flagged: u64,
}

/// Picks the highest-energy front and back strip of each event
pub struct DssdProcessor<S: ReportSink> {
    config: ProcessorConfig,
    correlator: Correlator<S>,
    stats: ProcessorStats,
}

impl<S: ReportSink> DssdProcessor<S> {
    pub fn new(config: ProcessorConfig, correlator: Correlator<S>) -> Self {
        Self {
            config,
            correlator,
            stats: ProcessorStats::default(),
        }
    }

    pub fn correlator(&self) -> &Correlator<S> {
        &self.correlator
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    pub fn into_correlator(self) -> Correlator<S> {
        self.correlator
    }

    fn classify(&self, event: &RawEvent) -> Option<(CorrelatorEvent, u32, u32)> {
        let front = event
            .iter()
            .filter_map(|r| self.config.front_strip(r).map(|s| (s, r)))
            .max_by_key(|(_, r)| r.energy)?;
        let back = event
            .iter()
            .filter_map(|r| self.config.back_strip(r).map(|s| (s, r)))
            .max_by_key(|(_, r)| r.energy)?;

        let energy = f64::from(front.1.energy);
        let kind = if energy >= self.config.implant_threshold {
            EventKind::Implant
        } else {
            EventKind::Decay
        };
        let correlator_event = CorrelatorEvent {
            kind,
            time: front.1.time,
            energy,
        };
        Some((correlator_event, front.0, back.0))
    }
}

impl<S: ReportSink> EventProcessor for DssdProcessor<S> {
    fn process(&mut self, event: RawEvent) {
        self.stats.events += 1;
        let Some((correlator_event, front, back)) = self.classify(&event) else {
            self.stats.incomplete += 1;
            return;
        };

        let condition = self.correlator.correlate(correlator_event, front, back);
        trace!(front, back, %condition, time = correlator_event.time, "Correlated");
        if matches!(
            condition,
            Condition::ValidImplant | Condition::ValidDecay | Condition::BackToBackImplant
        ) {
            self.stats.correlated += 1;
        }

        if condition == Condition::ValidDecay {
            if let Some((min, max)) = self.config.flag_energy {
                if (min..max).contains(&correlator_event.energy)
                    && self.correlator.flag_last_entry(front, back)
                {
                    self.correlator.flag(front, back);
                    self.stats.flagged += 1;
                }
            }
        }
    }

    fn wall_clock(&mut self, time: DateTime<Utc>) {
        self.correlator.set_wall_clock(time);
    }

    fn finish(&mut self) {
        self.correlator.flush_all();
    }
}
