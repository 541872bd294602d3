//! Implant/decay correlation per detector pixel
//!
//! ```text
//!              Implant                Decay (dt <= window)
//!   Empty ───────────────► Implant ─────────────────────► Implant + Decays
//!     ▲                      │  ▲                              │
//!     │   Decay too late     │  └──────── Implant ─────────────┘
//!     └──────────────────────┘
//! ```
//!
//! Chains are keyed by `(front, back)` strip. A new implant always replaces
//! the chain at its location. Flagged chains are handed to a [`ReportSink`]
//! before they are cleared, exactly once.
//!
//! Times are in the same units as [`crate::builder::RawEvent`] times
//! (filter clock ticks).

pub mod processor;
pub mod report;

pub use processor::{DssdProcessor, ProcessorConfig};
pub use report::{CorrelationReport, JsonLinesSink, ReportEntry, ReportSink};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

fn default_correlation_window() -> f64 {
    // 3300 s of 10 ns ticks
    3.3e11
}

fn default_min_implant_separation() -> f64 {
    // 5 ms
    5.0e5
}

fn default_clock_reset_jump() -> f64 {
    // 100 s
    1.0e10
}

fn default_clock_reset_time() -> f64 {
    // 10 s
    1.0e9
}

fn default_max_strip() -> u32 {
    40
}

/// Correlator thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Longest accepted implant-to-decay time
    #[serde(default = "default_correlation_window")]
    pub correlation_window: f64,
    /// Implants closer than this are back-to-back
    #[serde(default = "default_min_implant_separation")]
    pub min_implant_separation: f64,
    /// Backwards jump that counts as a clock reset
    #[serde(default = "default_clock_reset_jump")]
    pub clock_reset_jump: f64,
    /// Event times below this may follow a clock reset
    #[serde(default = "default_clock_reset_time")]
    pub clock_reset_time: f64,
    /// Strips per side; locations at or above are invalid
    #[serde(default = "default_max_strip")]
    pub max_strip: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            correlation_window: default_correlation_window(),
            min_implant_separation: default_min_implant_separation(),
            clock_reset_jump: default_clock_reset_jump(),
            clock_reset_time: default_clock_reset_time(),
            max_strip: default_max_strip(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Implant,
    Decay,
}

/// Event handed to the correlator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelatorEvent {
    pub kind: EventKind,
    pub time: f64,
    pub energy: f64,
}

impl CorrelatorEvent {
    pub fn implant(time: f64, energy: f64) -> Self {
        Self {
            kind: EventKind::Implant,
            time,
            energy,
        }
    }

    pub fn decay(time: f64, energy: f64) -> Self {
        Self {
            kind: EventKind::Decay,
            time,
            energy,
        }
    }
}

/// Outcome of [`Correlator::correlate`]
///
/// Discriminants match the condition codes written by older scan code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Condition {
    InvalidLocation = 4,
    ValidImplant = 12,
    ValidDecay = 16,
    BackToBackImplant = 32,
    DecayTooLate = 48,
    ImplantTooSoon = 52,
    NegativeTime = 60,
    ClockReset = 64,
}

impl Condition {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Condition::InvalidLocation => "InvalidLocation",
            Condition::ValidImplant => "ValidImplant",
            Condition::ValidDecay => "ValidDecay",
            Condition::BackToBackImplant => "BackToBackImplant",
            Condition::DecayTooLate => "DecayTooLate",
            Condition::ImplantTooSoon => "ImplantTooSoon",
            Condition::NegativeTime => "NegativeTime",
            Condition::ClockReset => "ClockReset",
        };
        write!(f, "{}", name)
    }
}

/// One entry of a chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntry {
    pub kind: EventKind,
    pub time: f64,
    /// Time since the implant; for the implant, time since the previous one
    pub dtime: Option<f64>,
    pub energy: f64,
    pub generation: u32,
    pub flagged: bool,
}

/// Implant followed by its accepted decays
#[derive(Debug, Clone, Default)]
pub struct CorrelationChain {
    entries: Vec<ChainEntry>,
    flagged: bool,
    /// Time of the most recent implant, kept across clears
    last_implant: Option<f64>,
    implant_wall_clock: Option<DateTime<Utc>>,
}

impl CorrelationChain {
    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Chain flag or any entry flag
    pub fn is_flagged(&self) -> bool {
        self.flagged || self.entries.iter().any(|e| e.flagged)
    }

    pub fn implant_time(&self) -> Option<f64> {
        self.entries.first().map(|e| e.time)
    }

    /// Time of the latest decay, relative to the implant
    pub fn decay_time(&self) -> Option<f64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::Decay)
            .and_then(|e| e.dtime)
    }

    fn implant_separation(&self) -> Option<f64> {
        self.entries.first().and_then(|e| e.dtime)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.flagged = false;
        self.implant_wall_clock = None;
    }
}

/// Correlator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub implants: u64,
    pub decays: u64,
    pub invalid_location: u64,
    pub back_to_back: u64,
    pub too_late: u64,
    pub too_soon: u64,
    pub negative_time: u64,
    pub clock_resets: u64,
    pub reports: u64,
    pub sink_errors: u64,
}

impl CorrelatorStats {
    fn count(&mut self, condition: Condition) {
        match condition {
            Condition::ValidImplant => self.implants += 1,
            Condition::BackToBackImplant => {
                self.implants += 1;
                self.back_to_back += 1;
            }
            Condition::ValidDecay => self.decays += 1,
            Condition::InvalidLocation => self.invalid_location += 1,
            Condition::DecayTooLate => self.too_late += 1,
            Condition::ImplantTooSoon => self.too_soon += 1,
            Condition::NegativeTime => self.negative_time += 1,
            Condition::ClockReset => self.clock_resets += 1,
        }
    }
}

/// Per-location chain table
///
/// Owned by the ingestion loop; not shared between threads.
pub struct Correlator<S: ReportSink = Vec<CorrelationReport>> {
    config: CorrelatorConfig,
    chains: HashMap<(u32, u32), CorrelationChain>,
    sink: S,
    wall_clock: Option<DateTime<Utc>>,
    stats: CorrelatorStats,
}

impl Correlator<Vec<CorrelationReport>> {
    /// Correlator collecting reports in memory
    pub fn new(config: CorrelatorConfig) -> Self {
        Self::with_sink(config, Vec::new())
    }
}

impl<S: ReportSink> Correlator<S> {
    pub fn with_sink(config: CorrelatorConfig, sink: S) -> Self {
        Self {
            config,
            chains: HashMap::new(),
            sink,
            wall_clock: None,
            stats: CorrelatorStats::default(),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &CorrelatorStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Latest wall-clock time; stamped on implants that follow
    pub fn set_wall_clock(&mut self, time: DateTime<Utc>) {
        self.wall_clock = Some(time);
    }

    fn valid_location(&self, front: u32, back: u32) -> bool {
        front < self.config.max_strip && back < self.config.max_strip
    }

    /// Place an event at `(front, back)`
    pub fn correlate(&mut self, event: CorrelatorEvent, front: u32, back: u32) -> Condition {
        let condition = if !self.valid_location(front, back) {
            debug!(front, back, "Event outside the detector");
            Condition::InvalidLocation
        } else {
            match event.kind {
                EventKind::Implant => self.add_implant(event, front, back),
                EventKind::Decay => self.add_decay(event, front, back),
            }
        };
        self.stats.count(condition);
        condition
    }

    fn add_implant(&mut self, event: CorrelatorEvent, front: u32, back: u32) -> Condition {
        let min_separation = self.config.min_implant_separation;
        let wall_clock = self.wall_clock;

        self.flush_location(front, back);
        let chain = self.chains.entry((front, back)).or_default();

        let separation = chain.last_implant.map(|t| event.time - t);
        let condition = match separation {
            Some(dt) if (0.0..min_separation).contains(&dt) => Condition::BackToBackImplant,
            _ => Condition::ValidImplant,
        };

        chain.entries.push(ChainEntry {
            kind: EventKind::Implant,
            time: event.time,
            dtime: separation,
            energy: event.energy,
            generation: 0,
            flagged: false,
        });
        chain.last_implant = Some(event.time);
        chain.implant_wall_clock = wall_clock;
        condition
    }

    fn add_decay(&mut self, event: CorrelatorEvent, front: u32, back: u32) -> Condition {
        let (implant_time, separation, generation) = match self.chains.get(&(front, back)) {
            Some(chain) if !chain.is_empty() => (
                chain.implant_time().unwrap_or_default(),
                chain.implant_separation(),
                chain.entries.last().map_or(0, |e| e.generation),
            ),
            _ => return Condition::InvalidLocation,
        };

        let dt = event.time - implant_time;
        if dt < 0.0 {
            if -dt > self.config.clock_reset_jump && event.time < self.config.clock_reset_time {
                warn!(
                    front,
                    back,
                    time = event.time,
                    implant_time,
                    "Clock reset detected, flushing all chains"
                );
                self.flush_all();
                return Condition::ClockReset;
            }
            warn!(
                front,
                back,
                time = event.time,
                implant_time,
                "Decay earlier than its implant, dropped"
            );
            return Condition::NegativeTime;
        }

        if separation.is_some_and(|s| (0.0..self.config.min_implant_separation).contains(&s)) {
            return Condition::ImplantTooSoon;
        }

        if dt > self.config.correlation_window {
            self.flush_location(front, back);
            return Condition::DecayTooLate;
        }

        if let Some(chain) = self.chains.get_mut(&(front, back)) {
            chain.entries.push(ChainEntry {
                kind: EventKind::Decay,
                time: event.time,
                dtime: Some(dt),
                energy: event.energy,
                generation: generation + 1,
                flagged: false,
            });
        }
        Condition::ValidDecay
    }

    /// Report the chain if flagged, then clear it
    fn flush_location(&mut self, front: u32, back: u32) {
        let Some(chain) = self.chains.get_mut(&(front, back)) else {
            return;
        };
        if chain.is_flagged() && !chain.is_empty() {
            let report = CorrelationReport::from_chain(front, back, chain);
            chain.clear();
            self.emit(report);
        } else {
            chain.clear();
        }
    }

    fn emit(&mut self, report: CorrelationReport) {
        self.stats.reports += 1;
        if let Err(e) = self.sink.report(report) {
            self.stats.sink_errors += 1;
            warn!(error = %e, "Failed to write correlation report");
        }
    }

    /// Flag the whole chain at a location
    pub fn flag(&mut self, front: u32, back: u32) -> bool {
        match self.chains.get_mut(&(front, back)) {
            Some(chain) if !chain.is_empty() => {
                chain.flagged = true;
                true
            }
            _ => false,
        }
    }

    /// Flag the most recent entry at a location
    pub fn flag_last_entry(&mut self, front: u32, back: u32) -> bool {
        match self
            .chains
            .get_mut(&(front, back))
            .and_then(|c| c.entries.last_mut())
        {
            Some(entry) => {
                entry.flagged = true;
                true
            }
            None => false,
        }
    }

    pub fn is_flagged(&self, front: u32, back: u32) -> bool {
        self.chains
            .get(&(front, back))
            .is_some_and(CorrelationChain::is_flagged)
    }

    /// Chain at a location, if it has an implant
    pub fn chain(&self, front: u32, back: u32) -> Option<&CorrelationChain> {
        self.chains.get(&(front, back)).filter(|c| !c.is_empty())
    }

    pub fn implant_time(&self, front: u32, back: u32) -> Option<f64> {
        self.chain(front, back).and_then(CorrelationChain::implant_time)
    }

    pub fn decay_time(&self, front: u32, back: u32) -> Option<f64> {
        self.chain(front, back).and_then(CorrelationChain::decay_time)
    }

    /// Number of locations holding an implant
    pub fn active_chains(&self) -> usize {
        self.chains.values().filter(|c| !c.is_empty()).count()
    }

    /// Report every flagged chain and clear the table
    pub fn flush_all(&mut self) {
        let mut locations: Vec<(u32, u32)> = self.chains.keys().copied().collect();
        locations.sort_unstable();
        for (front, back) in locations {
            self.flush_location(front, back);
        }
        self.chains.clear();
        if let Err(e) = self.sink.flush() {
            self.stats.sink_errors += 1;
            warn!(error = %e, "Failed to flush report sink");
        }
        info!(reports = self.stats.reports, "Correlator flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: f64 = 1000.0;

    fn config() -> CorrelatorConfig {
        CorrelatorConfig {
            correlation_window: WINDOW,
            min_implant_separation: 50.0,
            clock_reset_jump: 1.0e6,
            clock_reset_time: 1.0e4,
            max_strip: 40,
        }
    }

    #[test]
    fn test_implant_decay_scenario() {
        let mut correlator = Correlator::new(config());
        assert_eq!(
            correlator.correlate(CorrelatorEvent::implant(0.0, 5000.0), 3, 7),
            Condition::ValidImplant
        );
        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(0.7 * WINDOW, 800.0), 3, 7),
            Condition::ValidDecay
        );
        let chain = correlator.chain(3, 7).unwrap();
        assert_eq!(chain.entries().len(), 2);
        assert_eq!(chain.entries()[1].generation, 1);
        assert_eq!(correlator.decay_time(3, 7), Some(0.7 * WINDOW));

        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(1.5 * WINDOW, 700.0), 3, 7),
            Condition::DecayTooLate
        );
        assert!(correlator.chain(3, 7).is_none());

        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(1.6 * WINDOW, 600.0), 3, 7),
            Condition::InvalidLocation
        );
        assert!(correlator.sink().is_empty());
    }

    #[test]
    fn test_out_of_range_location() {
        let mut correlator = Correlator::new(config());
        assert_eq!(
            correlator.correlate(CorrelatorEvent::implant(0.0, 1.0), 40, 0),
            Condition::InvalidLocation
        );
        assert_eq!(
            correlator.correlate(CorrelatorEvent::implant(0.0, 1.0), 0, 99),
            Condition::InvalidLocation
        );
        assert_eq!(correlator.active_chains(), 0);
    }

    #[test]
    fn test_generations_count_decays() {
        let mut correlator = Correlator::new(config());
        correlator.correlate(CorrelatorEvent::implant(100.0, 1.0), 0, 0);
        for i in 1..=5 {
            let t = 100.0 + i as f64 * 10.0;
            assert_eq!(
                correlator.correlate(CorrelatorEvent::decay(t, 1.0), 0, 0),
                Condition::ValidDecay
            );
        }
        let generations: Vec<u32> = correlator
            .chain(0, 0)
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.generation)
            .collect();
        assert_eq!(generations, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_back_to_back_implants() {
        let mut correlator = Correlator::new(config());
        correlator.correlate(CorrelatorEvent::implant(0.0, 1.0), 1, 1);
        assert_eq!(
            correlator.correlate(CorrelatorEvent::implant(10.0, 1.0), 1, 1),
            Condition::BackToBackImplant
        );
        // A single implant per location
        assert_eq!(correlator.chain(1, 1).unwrap().entries().len(), 1);
        assert_eq!(correlator.implant_time(1, 1), Some(10.0));

        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(20.0, 1.0), 1, 1),
            Condition::ImplantTooSoon
        );
        assert_eq!(correlator.chain(1, 1).unwrap().entries().len(), 1);

        assert_eq!(
            correlator.correlate(CorrelatorEvent::implant(500.0, 1.0), 1, 1),
            Condition::ValidImplant
        );
        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(510.0, 1.0), 1, 1),
            Condition::ValidDecay
        );
        assert_eq!(correlator.stats().back_to_back, 1);
        assert_eq!(correlator.stats().implants, 3);
    }

    #[test]
    fn test_negative_time_dropped() {
        let mut correlator = Correlator::new(config());
        correlator.correlate(CorrelatorEvent::implant(50_000.0, 1.0), 2, 2);
        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(49_000.0, 1.0), 2, 2),
            Condition::NegativeTime
        );
        assert_eq!(correlator.chain(2, 2).unwrap().entries().len(), 1);
    }

    // Clock-reset detection is a heuristic: a large backwards jump to a
    // small absolute time.
    #[test]
    fn test_clock_reset_heuristic_flushes_everything() {
        let mut correlator = Correlator::new(config());
        correlator.correlate(CorrelatorEvent::implant(5.0e6, 1.0), 2, 2);
        correlator.correlate(CorrelatorEvent::implant(5.0e6, 1.0), 4, 4);
        correlator.flag(4, 4);

        assert_eq!(
            correlator.correlate(CorrelatorEvent::decay(100.0, 1.0), 2, 2),
            Condition::ClockReset
        );
        assert_eq!(correlator.active_chains(), 0);
        assert_eq!(correlator.sink().len(), 1);
        assert_eq!(correlator.sink()[0].back, 4);
        assert_eq!(correlator.stats().clock_resets, 1);
    }

    #[test]
    fn test_flagged_chain_reported_on_new_implant() {
        let mut correlator = Correlator::new(config());
        let wall = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        correlator.set_wall_clock(wall);
        correlator.correlate(CorrelatorEvent::implant(0.0, 9000.0), 5, 6);
        correlator.correlate(CorrelatorEvent::decay(100.0, 1200.0), 5, 6);
        assert!(correlator.flag_last_entry(5, 6));
        assert!(correlator.is_flagged(5, 6));

        correlator.correlate(CorrelatorEvent::implant(200.0, 8000.0), 5, 6);
        assert!(!correlator.is_flagged(5, 6));

        let reports = correlator.sink();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!((report.front, report.back), (5, 6));
        assert_eq!(report.implant_time, 0.0);
        assert_eq!(report.wall_clock, Some(wall));
        assert_eq!(report.entries.len(), 2);
        assert!(report.entries[1].flagged);
        assert_eq!(report.entries[1].generation, 1);
    }

    #[test]
    fn test_flagged_chain_reported_once() {
        let mut correlator = Correlator::new(config());
        correlator.correlate(CorrelatorEvent::implant(0.0, 1.0), 0, 1);
        assert!(correlator.flag(0, 1));

        // Too-late decay clears and reports
        correlator.correlate(CorrelatorEvent::decay(2.0 * WINDOW, 1.0), 0, 1);
        assert_eq!(correlator.sink().len(), 1);

        correlator.flush_all();
        assert_eq!(correlator.sink().len(), 1);
        assert_eq!(correlator.stats().reports, 1);
    }

    #[test]
    fn test_flush_all_reports_flagged_only() {
        let mut correlator = Correlator::new(config());
        for strip in 0..4 {
            correlator.correlate(CorrelatorEvent::implant(0.0, 1.0), strip, strip);
        }
        correlator.flag(1, 1);
        correlator.flag(3, 3);
        correlator.flush_all();

        let backs: Vec<u32> = correlator.sink().iter().map(|r| r.back).collect();
        assert_eq!(backs, vec![1, 3]);
        assert_eq!(correlator.active_chains(), 0);
    }

    #[test]
    fn test_flag_without_chain() {
        let mut correlator = Correlator::new(config());
        assert!(!correlator.flag(0, 0));
        assert!(!correlator.flag_last_entry(0, 0));
        assert!(!correlator.is_flagged(0, 0));
    }

    #[test]
    fn test_condition_codes() {
        assert_eq!(Condition::InvalidLocation.code(), 4);
        assert_eq!(Condition::ValidImplant.code(), 12);
        assert_eq!(Condition::ValidDecay.code(), 16);
        assert_eq!(Condition::BackToBackImplant.code(), 32);
        assert_eq!(Condition::DecayTooLate.code(), 48);
        assert_eq!(Condition::ImplantTooSoon.code(), 52);
    }
}
