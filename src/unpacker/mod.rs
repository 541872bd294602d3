//! Spill unpacker
//!
//! A spill is a run of module segments `(length, vsn, ...)`:
//! ```text
//! ┌────────┬─────┬──────────────────┐
//! │ length │ vsn │ list-mode words  │  vsn 0..13: module data
//! ├────────┼─────┼──────────────────┤
//! │   6    │ vsn │ (4 words)        │  empty module
//! ├────────┼─────┼──────────────────┤
//! │ length │1000 │ time_t (2 words) │  wall-clock block
//! ├────────┼─────┼──────────────────┤
//! │   2    │9999 │                  │  end of spill
//! └────────┴─────┴──────────────────┘
//! ```
//! Module segments are decoded, pushed into the [`EventBuilder`] and, once
//! the spill is complete, drained into an [`EventProcessor`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::builder::{BuilderConfig, EventBuilder, EventProcessor};
use crate::decoder::{ListModeDecoder, ListModeMask};
use crate::ldf::ENDBUFF;

/// VSN of the wall-clock block
pub const WALL_CLOCK_VSN: u32 = 1000;

/// VSN marking the end of a spill
pub const END_OF_SPILL_VSN: u32 = 9999;

/// Segment length of a module that produced no data
pub const EMPTY_MODULE_WORDS: u32 = 6;

fn default_max_vsn() -> u32 {
    14
}

fn default_max_words() -> usize {
    131_072
}

/// Unpacker limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpackerConfig {
    /// Module numbers must be below this value
    #[serde(default = "default_max_vsn")]
    pub max_vsn: u32,
    /// Largest accepted segment length in words
    #[serde(default = "default_max_words")]
    pub max_words: usize,
}

impl Default for UnpackerConfig {
    fn default() -> Self {
        Self {
            max_vsn: default_max_vsn(),
            max_words: default_max_words(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("Sanity check failed at word {offset}: length {length}, vsn {vsn}")]
    SanityCheck { offset: usize, length: u32, vsn: u32 },

    #[error("Segment at word {offset} declares {length} words, {available} available")]
    Truncated {
        offset: usize,
        length: u32,
        available: usize,
    },
}

/// Outcome of one spill
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpillSummary {
    pub records: usize,
    pub events: u64,
    /// Gaps in the module sequence
    pub missing_modules: u32,
    /// Segments abandoned by the decoder
    pub decode_errors: u32,
    /// Wall-clock time carried by the spill, if any
    pub wall_clock: Option<DateTime<Utc>>,
}

impl SpillSummary {
    /// No missing modules and no decode errors
    pub fn is_clean(&self) -> bool {
        self.missing_modules == 0 && self.decode_errors == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackerStats {
    pub spills: u64,
    pub rejected_spills: u64,
    pub records: u64,
    pub events: u64,
    pub missing_modules: u64,
    pub decode_errors: u64,
}

/// Spill unpacker owning the decoder and the event builder
pub struct Unpacker {
    config: UnpackerConfig,
    decoder: ListModeDecoder,
    default_mask: ListModeMask,
    module_masks: HashMap<u32, ListModeMask>,
    builder: EventBuilder,
    last_wall_clock: Option<DateTime<Utc>>,
    stats: UnpackerStats,
}

impl Unpacker {
    pub fn new(config: UnpackerConfig, mask: ListModeMask, builder: BuilderConfig) -> Self {
        Self {
            config,
            decoder: ListModeDecoder::new(mask),
            default_mask: mask,
            module_masks: HashMap::new(),
            builder: EventBuilder::new(builder),
            last_wall_clock: None,
            stats: UnpackerStats::default(),
        }
    }

    /// Use a different mask for one module
    pub fn set_module_mask(&mut self, vsn: u32, mask: ListModeMask) {
        self.module_masks.insert(vsn, mask);
    }

    fn mask_for(&self, vsn: u32) -> ListModeMask {
        self.module_masks
            .get(&vsn)
            .copied()
            .unwrap_or(self.default_mask)
    }

    pub fn stats(&self) -> UnpackerStats {
        self.stats
    }

    pub fn decoder(&self) -> &ListModeDecoder {
        &self.decoder
    }

    pub fn builder(&self) -> &EventBuilder {
        &self.builder
    }

    /// Most recent wall-clock time seen in the data
    pub fn last_wall_clock(&self) -> Option<DateTime<Utc>> {
        self.last_wall_clock
    }

    /// Forget queued records and the event window, e.g. after a rewind
    pub fn reset(&mut self) {
        self.builder.reset();
    }

    fn reject(&mut self, err: UnpackError) -> UnpackError {
        warn!(error = %err, "Rejecting spill");
        self.builder.clear();
        self.stats.rejected_spills += 1;
        err
    }

    /// Decode a spill and hand its events to `processor`
    pub fn read_spill<P: EventProcessor + ?Sized>(
        &mut self,
        words: &[u32],
        processor: &mut P,
    ) -> Result<SpillSummary, UnpackError> {
        let mut summary = SpillSummary::default();
        let mut last_vsn: Option<u32> = None;
        let mut pos = 0usize;

        loop {
            while pos < words.len() && words[pos] == ENDBUFF {
                pos += 1;
            }
            if pos >= words.len() {
                break;
            }
            if pos + 2 > words.len() {
                return Err(self.reject(UnpackError::Truncated {
                    offset: pos,
                    length: words[pos],
                    available: words.len() - pos,
                }));
            }

            let length = words[pos];
            let vsn = words[pos + 1];
            let known_vsn = vsn <= self.config.max_vsn
                || vsn == WALL_CLOCK_VSN
                || vsn == END_OF_SPILL_VSN;
            if length < 2 || length as usize > self.config.max_words || !known_vsn {
                return Err(self.reject(UnpackError::SanityCheck {
                    offset: pos,
                    length,
                    vsn,
                }));
            }

            if length == EMPTY_MODULE_WORDS {
                pos += length as usize;
                last_vsn = Some(vsn);
                continue;
            }

            if vsn < self.config.max_vsn {
                if let Some(last) = last_vsn {
                    if vsn != last.wrapping_add(1) {
                        warn!(
                            expected = last.wrapping_add(1),
                            vsn,
                            length,
                            "Missing module buffer"
                        );
                        self.builder.clear();
                        summary.missing_modules += 1;
                    }
                }

                let end = pos + length as usize;
                if end > words.len() {
                    return Err(self.reject(UnpackError::Truncated {
                        offset: pos,
                        length,
                        available: words.len() - pos,
                    }));
                }

                let mask = self.mask_for(vsn);
                self.decoder.set_mask(mask);
                let records = match self.decoder.decode_buffer(&words[pos..end]) {
                    Ok(records) => records,
                    Err(e) => {
                        summary.decode_errors += 1;
                        e.into_decoded()
                    }
                };
                for record in records {
                    if self.builder.push(record) {
                        summary.records += 1;
                    }
                }

                last_vsn = Some(vsn);
                pos = end;
            } else if vsn == WALL_CLOCK_VSN {
                if length >= 4 && pos + 4 <= words.len() {
                    let seconds =
                        u64::from(words[pos + 2]) | (u64::from(words[pos + 3]) << 32);
                    summary.wall_clock = DateTime::from_timestamp(seconds as i64, 0);
                    self.last_wall_clock = summary.wall_clock;
                    debug!(seconds, "Wall-clock block");
                }
                pos += length as usize;
            } else if vsn == END_OF_SPILL_VSN {
                break;
            } else {
                // Only `max_vsn` itself gets here: stop and keep what was read
                warn!(offset = pos, vsn, "Unexpected VSN, ending spill walk");
                break;
            }
        }

        if let Some(time) = summary.wall_clock {
            processor.wall_clock(time);
        }
        self.builder.time_sort();
        summary.events = self.builder.drain_into(processor);

        self.stats.spills += 1;
        self.stats.records += summary.records as u64;
        self.stats.events += summary.events;
        self.stats.missing_modules += u64::from(summary.missing_modules);
        self.stats.decode_errors += u64::from(summary.decode_errors);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RawEvent;
    use crate::decoder::{encode_segment, ChannelRecord, Firmware, Frequency};

    fn mask() -> ListModeMask {
        ListModeMask::new(Firmware::R30474, Frequency::Mhz250)
    }

    fn unpacker() -> Unpacker {
        Unpacker::new(UnpackerConfig::default(), mask(), BuilderConfig::default())
    }

    fn hit(channel: u32, time_low: u32, energy: u32) -> ChannelRecord {
        ChannelRecord {
            channel,
            event_time_low: time_low,
            energy,
            ..Default::default()
        }
    }

    #[test]
    fn test_two_modules_one_event() {
        let mut words = encode_segment(&mask(), 0, &[hit(1, 1000, 10)]);
        words.extend(encode_segment(&mask(), 1, &[hit(2, 1010, 20)]));
        words.extend_from_slice(&[2, END_OF_SPILL_VSN]);

        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        let summary = unpacker.read_spill(&words, &mut events).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.events, 1);
        assert!(summary.is_clean());
        assert_eq!(events[0].len(), 2);
        assert_eq!(events[0].records[1].module, 1);
    }

    #[test]
    fn test_empty_module_and_wall_clock() {
        let mut words = vec![EMPTY_MODULE_WORDS, 0, 0, 0, 0, 0];
        words.extend(encode_segment(&mask(), 1, &[hit(0, 5, 1)]));
        words.extend_from_slice(&[4, WALL_CLOCK_VSN, 1_700_000_000, 0]);

        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        let summary = unpacker.read_spill(&words, &mut events).unwrap();
        assert_eq!(summary.missing_modules, 0);
        assert_eq!(summary.events, 1);
        assert_eq!(
            summary.wall_clock.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(unpacker.last_wall_clock(), summary.wall_clock);
    }

    #[test]
    fn test_missing_module_discards_earlier_records() {
        let mut words = encode_segment(&mask(), 0, &[hit(0, 100, 1)]);
        words.extend(encode_segment(&mask(), 2, &[hit(0, 100_000, 2)]));

        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        let summary = unpacker.read_spill(&words, &mut events).unwrap();
        assert_eq!(summary.missing_modules, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].records[0].energy, 2);
    }

    #[test]
    fn test_sanity_check_rejects_spill() {
        let mut words = encode_segment(&mask(), 0, &[hit(0, 100, 1)]);
        words.extend_from_slice(&[10, 50, 0, 0]);

        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        assert!(matches!(
            unpacker.read_spill(&words, &mut events),
            Err(UnpackError::SanityCheck { vsn: 50, .. })
        ));
        assert!(events.is_empty());
        assert!(unpacker.builder().is_empty());
        assert_eq!(unpacker.stats().rejected_spills, 1);
    }

    #[test]
    fn test_max_vsn_ends_walk() {
        let mut words = encode_segment(&mask(), 0, &[hit(0, 100, 1)]);
        words.extend_from_slice(&[10, 14, 0, 0]);
        words.extend(encode_segment(&mask(), 1, &[hit(0, 200, 2)]));

        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        let summary = unpacker.read_spill(&words, &mut events).unwrap();
        // Segments after the unexpected VSN are not read
        assert_eq!(summary.records, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(unpacker.stats().rejected_spills, 0);
    }

    #[test]
    fn test_decode_error_keeps_records() {
        let mut words = encode_segment(&mask(), 0, &[hit(0, 100, 1), hit(1, 120, 2)]);
        // Break the header length of the second record
        words[6] = (words[6] & !0x1_F000) | (7 << 12);
        words.extend(encode_segment(&mask(), 1, &[hit(3, 110, 3)]));

        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        let summary = unpacker.read_spill(&words, &mut events).unwrap();
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.records, 2);
        assert_eq!(unpacker.stats().decode_errors, 1);
    }

    #[test]
    fn test_per_module_mask() {
        let new_mask = ListModeMask::new(Firmware::R34688, Frequency::Mhz250);
        let mut words = encode_segment(&mask(), 0, &[hit(0, 100, 1)]);
        words.extend(encode_segment(&new_mask, 1, &[hit(0, 100, 40_000)]));

        let mut unpacker = unpacker();
        unpacker.set_module_mask(1, new_mask);
        let mut events: Vec<RawEvent> = Vec::new();
        unpacker.read_spill(&words, &mut events).unwrap();
        let energies: Vec<u32> = events[0].iter().map(|r| r.energy).collect();
        assert!(energies.contains(&40_000));
    }

    #[test]
    fn test_truncated_segment() {
        let mut words = encode_segment(&mask(), 0, &[hit(0, 100, 1)]);
        words[0] += 10;
        let mut unpacker = unpacker();
        let mut events: Vec<RawEvent> = Vec::new();
        assert!(matches!(
            unpacker.read_spill(&words, &mut events),
            Err(UnpackError::Truncated { .. })
        ));
    }
}
