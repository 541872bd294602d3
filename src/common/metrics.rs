//! Scan counters shared between the ingestion loop and status queries
//!
//! Written only by the ingestion loop; readers take a `snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters updated once per spill
#[derive(Debug, Default)]
pub struct ScanCounters {
    /// Full spills handed to the unpacker
    pub good_spills: AtomicU64,
    /// Incomplete spills that were not processed
    pub fragments: AtomicU64,
    /// Spills with a damaged footer
    pub corrupt: AtomicU64,
    /// Full spills the unpacker rejected
    pub dropped: AtomicU64,
    /// Words in good spills
    pub words: AtomicU64,
    pub records: AtomicU64,
    pub events: AtomicU64,
}

impl ScanCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_good(&self, words: u64) {
        self.good_spills.fetch_add(1, Ordering::Relaxed);
        self.words.fetch_add(words, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fragments(&self) {
        self.fragments.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_corrupt(&self) {
        self.corrupt.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_records(&self, n: u64) {
        self.records.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_events(&self, n: u64) {
        self.events.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            good_spills: self.good_spills.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            words: self.words.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub good_spills: u64,
    pub fragments: u64,
    pub corrupt: u64,
    pub dropped: u64,
    pub words: u64,
    pub records: u64,
    pub events: u64,
}
