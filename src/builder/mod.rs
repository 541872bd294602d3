//! Event builder: groups channel records into time-windowed raw events
//!
//! ```text
//! module 0: ──●──●───────●────●──
//! module 1: ────●──────●──────●──
//! module 2: ──●─────────●────────
//!             └─ win ─┘ └─ win ─┘
//! ```
//!
//! Records are queued per module, sorted by time, then drained one window
//! at a time. Window starts never move backwards, so a record that arrives
//! later than the current window start joins the current window.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decoder::ChannelRecord;

fn default_event_width() -> f64 {
    62.0
}

fn default_max_modules() -> usize {
    14
}

fn default_max_channels() -> usize {
    16
}

/// Event builder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Window width in the units of [`ChannelRecord::time`]
    #[serde(default = "default_event_width")]
    pub event_width: f64,
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            event_width: default_event_width(),
            max_modules: default_max_modules(),
            max_channels: default_max_channels(),
        }
    }
}

/// Records that fell into one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    /// Window start
    pub start_time: f64,
    /// Earliest record time in the event
    pub first_time: f64,
    /// Latest record time in the event
    pub last_time: f64,
    pub records: Vec<ChannelRecord>,
}

impl RawEvent {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.records.iter()
    }
}

/// Downstream consumer of raw events
pub trait EventProcessor {
    fn process(&mut self, event: RawEvent);

    /// Wall-clock time found in the spill whose events follow
    fn wall_clock(&mut self, _time: DateTime<Utc>) {}

    /// Called when the input is exhausted or the scan stops
    fn finish(&mut self) {}
}

/// Collects events in memory
impl EventProcessor for Vec<RawEvent> {
    fn process(&mut self, event: RawEvent) {
        self.push(event);
    }
}

/// Event builder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuilderStats {
    pub records_in: u64,
    /// Records with a module or channel outside the configured limits
    pub dropped: u64,
    /// Records earlier than the window they were placed in
    pub late_records: u64,
    pub events_built: u64,
}

/// Per-module queues and the forward-only window
#[derive(Debug)]
pub struct EventBuilder {
    config: BuilderConfig,
    queues: Vec<VecDeque<ChannelRecord>>,
    last_start: Option<f64>,
    stats: BuilderStats,
}

impl EventBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            queues: Vec::new(),
            last_start: None,
            stats: BuilderStats::default(),
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats
    }

    /// Queue a record; returns false if it was dropped
    pub fn push(&mut self, record: ChannelRecord) -> bool {
        let module = record.module as usize;
        let channel = record.channel as usize;
        if module >= self.config.max_modules || channel >= self.config.max_channels {
            warn!(
                module,
                channel,
                max_modules = self.config.max_modules,
                max_channels = self.config.max_channels,
                "Dropping record with non-physical module/channel"
            );
            self.stats.dropped += 1;
            return false;
        }

        if self.queues.len() <= module {
            self.queues.resize_with(module + 1, VecDeque::new);
        }
        self.queues[module].push_back(record);
        self.stats.records_in += 1;
        true
    }

    /// Stable sort of every queue by time
    pub fn time_sort(&mut self) {
        for queue in &mut self.queues {
            queue
                .make_contiguous()
                .sort_by(|a, b| a.time.total_cmp(&b.time));
        }
    }

    /// Earliest time at the front of any queue
    pub fn first_time(&self) -> Option<f64> {
        self.queues
            .iter()
            .filter_map(|q| q.front())
            .map(|r| r.time)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Start of the most recent window
    pub fn last_start(&self) -> Option<f64> {
        self.last_start
    }

    /// Drain the next window, or `None` when every queue is empty
    pub fn build_raw_event(&mut self) -> Option<RawEvent> {
        let first = self.first_time()?;
        let start = match self.last_start {
            Some(previous) if previous > first => previous,
            _ => first,
        };
        let end = start + self.config.event_width;

        let mut event = RawEvent {
            start_time: start,
            first_time: f64::MAX,
            last_time: f64::MIN,
            records: Vec::new(),
        };

        for queue in &mut self.queues {
            while let Some(front) = queue.front() {
                if front.time >= end {
                    break;
                }
                if front.time < start {
                    debug!(
                        module = front.module,
                        channel = front.channel,
                        time = front.time,
                        start,
                        "Record earlier than window start"
                    );
                    self.stats.late_records += 1;
                }
                if let Some(record) = queue.pop_front() {
                    event.first_time = event.first_time.min(record.time);
                    event.last_time = event.last_time.max(record.time);
                    event.records.push(record);
                }
            }
        }

        self.last_start = Some(start);
        self.stats.events_built += 1;
        Some(event)
    }

    /// Drain every window into a processor; returns the number of events
    pub fn drain_into<P: EventProcessor + ?Sized>(&mut self, processor: &mut P) -> u64 {
        let mut count = 0;
        while let Some(event) = self.build_raw_event() {
            processor.process(event);
            count += 1;
        }
        count
    }

    /// Discard queued records, keeping the window position
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
    }

    /// Discard queued records and forget the window position
    pub fn reset(&mut self) {
        self.clear();
        self.last_start = None;
    }

    /// Number of queued records
    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}
