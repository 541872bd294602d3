//! Decoded channel record and header shapes

use serde::{Deserialize, Serialize};

/// Number of QDC sums carried by a QDC header
pub const QDC_WORDS: usize = 8;

/// Number of on-board energy sums (trailing, leading, gap, baseline)
pub const ENERGY_SUM_WORDS: usize = 4;

/// Words in the fixed part of every header
pub const BASE_HEADER_WORDS: u32 = 4;

/// Header length used by the acquisition for inserted statistics blocks
pub const STATS_BLOCK_LENGTH: u32 = 1;

/// Recognized list-mode header layouts, selected by the header length
///
/// Optional fields follow the four base words in the order energy sums,
/// QDC sums, external timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderShape {
    Basic,
    ExternalTimestamp,
    EnergySums,
    EnergySumsExternalTimestamp,
    Qdc,
    QdcExternalTimestamp,
    EnergySumsQdc,
    EnergySumsQdcExternalTimestamp,
}

impl HeaderShape {
    /// Shape for a header length in words
    pub fn from_length(words: u32) -> Option<Self> {
        match words {
            4 => Some(HeaderShape::Basic),
            6 => Some(HeaderShape::ExternalTimestamp),
            8 => Some(HeaderShape::EnergySums),
            10 => Some(HeaderShape::EnergySumsExternalTimestamp),
            12 => Some(HeaderShape::Qdc),
            14 => Some(HeaderShape::QdcExternalTimestamp),
            16 => Some(HeaderShape::EnergySumsQdc),
            18 => Some(HeaderShape::EnergySumsQdcExternalTimestamp),
            _ => None,
        }
    }

    /// Header length in words
    pub fn length(&self) -> u32 {
        let mut words = BASE_HEADER_WORDS;
        if self.has_energy_sums() {
            words += ENERGY_SUM_WORDS as u32;
        }
        if self.has_qdc() {
            words += QDC_WORDS as u32;
        }
        if self.has_external_timestamp() {
            words += 2;
        }
        words
    }

    pub fn has_external_timestamp(&self) -> bool {
        matches!(
            self,
            HeaderShape::ExternalTimestamp
                | HeaderShape::EnergySumsExternalTimestamp
                | HeaderShape::QdcExternalTimestamp
                | HeaderShape::EnergySumsQdcExternalTimestamp
        )
    }

    pub fn has_qdc(&self) -> bool {
        matches!(
            self,
            HeaderShape::Qdc
                | HeaderShape::QdcExternalTimestamp
                | HeaderShape::EnergySumsQdc
                | HeaderShape::EnergySumsQdcExternalTimestamp
        )
    }

    pub fn has_energy_sums(&self) -> bool {
        matches!(
            self,
            HeaderShape::EnergySums
                | HeaderShape::EnergySumsExternalTimestamp
                | HeaderShape::EnergySumsQdc
                | HeaderShape::EnergySumsQdcExternalTimestamp
        )
    }

    /// Shape carrying exactly the requested optional fields
    pub fn with_fields(energy_sums: bool, qdc: bool, external_timestamp: bool) -> Self {
        match (energy_sums, qdc, external_timestamp) {
            (false, false, false) => HeaderShape::Basic,
            (false, false, true) => HeaderShape::ExternalTimestamp,
            (true, false, false) => HeaderShape::EnergySums,
            (true, false, true) => HeaderShape::EnergySumsExternalTimestamp,
            (false, true, false) => HeaderShape::Qdc,
            (false, true, true) => HeaderShape::QdcExternalTimestamp,
            (true, true, false) => HeaderShape::EnergySumsQdc,
            (true, true, true) => HeaderShape::EnergySumsQdcExternalTimestamp,
        }
    }
}

/// One decoded channel hit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Module number (segment VSN)
    pub module: u32,
    pub crate_id: u32,
    pub slot: u32,
    pub channel: u32,
    /// Low 32 bits of the 48-bit filter timestamp
    pub event_time_low: u32,
    /// High 16 bits of the 48-bit filter timestamp
    pub event_time_high: u32,
    pub cfd_fraction: u32,
    pub cfd_forced_trigger: bool,
    pub cfd_trigger_source: u32,
    pub energy: u32,
    /// Finish code
    pub pileup: bool,
    pub saturated: bool,
    pub virtual_channel: bool,
    pub out_of_range: bool,
    /// 48-bit external timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qdc: Option<[u32; QDC_WORDS]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_sums: Option<[u32; ENERGY_SUM_WORDS]>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub trace: Vec<u16>,
    /// High-resolution time in samples
    pub time: f64,
}

impl ChannelRecord {
    /// Combined 48-bit filter timestamp
    pub fn timestamp(&self) -> u64 {
        u64::from(self.event_time_low) | (u64::from(self.event_time_high) << 32)
    }

    pub fn has_trace(&self) -> bool {
        !self.trace.is_empty()
    }

    /// Shape needed to encode the optional fields of this record
    pub fn header_shape(&self) -> HeaderShape {
        HeaderShape::with_fields(
            self.energy_sums.is_some(),
            self.qdc.is_some(),
            self.external_timestamp.is_some(),
        )
    }

    /// Format for display
    pub fn display(&self) -> String {
        format!(
            "Mod:{:2} Ch:{:2} T:{:18.3} E:{:5}{}{}{}",
            self.module,
            self.channel,
            self.time,
            self.energy,
            if self.pileup { " [PU]" } else { "" },
            if self.saturated { " [SAT]" } else { "" },
            if self.has_trace() { " [TR]" } else { "" }
        )
    }
}

impl std::fmt::Display for ChannelRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_lengths() {
        for words in [4, 6, 8, 10, 12, 14, 16, 18] {
            let shape = HeaderShape::from_length(words).unwrap();
            assert_eq!(shape.length(), words);
        }
        assert!(HeaderShape::from_length(1).is_none());
        assert!(HeaderShape::from_length(5).is_none());
        assert!(HeaderShape::from_length(21).is_none());
    }

    #[test]
    fn test_shape_fields() {
        let shape = HeaderShape::QdcExternalTimestamp;
        assert!(shape.has_qdc());
        assert!(shape.has_external_timestamp());
        assert!(!shape.has_energy_sums());
        assert_eq!(HeaderShape::with_fields(false, true, true), shape);
    }

    #[test]
    fn test_timestamp_combination() {
        let record = ChannelRecord {
            event_time_low: 123456789,
            event_time_high: 26001,
            ..Default::default()
        };
        assert_eq!(record.timestamp(), 111673568120085);
    }

    #[test]
    fn test_record_json_skips_empty_fields() {
        let record = ChannelRecord {
            module: 3,
            channel: 7,
            energy: 100,
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("trace"));
        assert!(!json.contains("qdc"));
        let back: ChannelRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
