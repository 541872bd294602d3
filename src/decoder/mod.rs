//! Decoder for XIA Pixie-16 list-mode data
//!
//! Converts module segments of a spill into [`ChannelRecord`]s.
//!
//! Header word layout:
//! ```text
//! word 0: [31] finish code  [30] saturated  [29] virtual
//!         [28:17] event length  [16:12] header length
//!         [11:8] crate  [7:4] slot  [3:0] channel
//! word 1: event time low
//! word 2: [31:16] CFD fraction / forced trigger / trigger source
//!         [15:0] event time high
//! word 3: trace length, out-of-range flag, energy
//! ```
//! The exact CFD and word 3 layouts depend on firmware and sampling
//! frequency; see [`ListModeMask`].

pub mod list_mode;
pub mod mask;
pub mod record;

pub use list_mode::{
    calculate_time_in_samples, encode_record, encode_segment, time_in_ns, DecoderStats,
    ListModeDecoder,
};
pub use mask::{Firmware, Frequency, ListModeMask};
pub use record::{ChannelRecord, HeaderShape};

use thiserror::Error;

/// Reason a module segment was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortCause {
    #[error(
        "unrecognized header length {length} (module {module}, crate {crate_id}, slot {slot}, channel {channel})"
    )]
    UnknownHeaderLength {
        length: u32,
        module: u32,
        crate_id: u32,
        slot: u32,
        channel: u32,
    },

    #[error(
        "event length {event_length} does not match header length {header_length} and trace length {trace_length}"
    )]
    LengthMismatch {
        event_length: u32,
        header_length: u32,
        trace_length: u32,
    },

    #[error("record at word {offset} needs {needed} words, {available} available")]
    Overrun {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("statistics block with zero length at word {offset}")]
    ZeroEventLength { offset: usize },
}

/// Decoder errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Module segment {module} has zero length")]
    ZeroLength { module: u32 },

    #[error("Module segment of {0} words has no prologue")]
    MissingPrologue(usize),

    #[error("Decoding aborted after {} records: {cause}", .decoded.len())]
    Aborted {
        decoded: Vec<ChannelRecord>,
        cause: AbortCause,
    },

    #[error("Unknown firmware revision: {0}")]
    UnknownFirmware(String),

    #[error("Unsupported sampling frequency: {0} MHz")]
    UnknownFrequency(u32),
}

impl DecodeError {
    /// Records decoded before the error, if any
    pub fn into_decoded(self) -> Vec<ChannelRecord> {
        match self {
            DecodeError::Aborted { decoded, .. } => decoded,
            _ => Vec::new(),
        }
    }
}
