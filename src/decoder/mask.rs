//! Bit masks for Pixie-16 list-mode words per firmware and frequency

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::DecodeError;

/// Masks that do not depend on firmware or frequency
mod constants {
    // Word 0
    pub const CHANNEL_MASK: u32 = 0x0000_000F;
    pub const SLOT_MASK: u32 = 0x0000_00F0;
    pub const SLOT_SHIFT: u32 = 4;
    pub const CRATE_MASK: u32 = 0x0000_0F00;
    pub const CRATE_SHIFT: u32 = 8;
    pub const HEADER_LENGTH_MASK: u32 = 0x0001_F000;
    pub const HEADER_LENGTH_SHIFT: u32 = 12;
    pub const EVENT_LENGTH_MASK: u32 = 0x1FFE_0000;
    pub const EVENT_LENGTH_SHIFT: u32 = 17;
    pub const VIRTUAL_CHANNEL_MASK: u32 = 0x2000_0000;
    pub const SATURATED_MASK: u32 = 0x4000_0000;
    pub const FINISH_CODE_MASK: u32 = 0x8000_0000;

    // Word 2
    pub const EVENT_TIME_HIGH_MASK: u32 = 0x0000_FFFF;
    pub const CFD_SHIFT: u32 = 16;

    // Word 3
    pub const TRACE_LENGTH_SHIFT: u32 = 16;
}

/// Pixie-16 firmware revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Firmware {
    R29432,
    R30474,
    R30980,
    R30981,
    R34688,
}

impl FromStr for Firmware {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "R29432" => Ok(Firmware::R29432),
            "R30474" => Ok(Firmware::R30474),
            "R30980" => Ok(Firmware::R30980),
            "R30981" => Ok(Firmware::R30981),
            "R34688" => Ok(Firmware::R34688),
            other => Err(DecodeError::UnknownFirmware(other.to_string())),
        }
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Firmware::R29432 => "R29432",
            Firmware::R30474 => "R30474",
            Firmware::R30980 => "R30980",
            Firmware::R30981 => "R30981",
            Firmware::R34688 => "R34688",
        };
        f.write_str(name)
    }
}

/// Module sampling frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Mhz100,
    Mhz250,
    Mhz500,
}

impl Frequency {
    pub fn from_mhz(mhz: u32) -> Result<Self, DecodeError> {
        match mhz {
            100 => Ok(Frequency::Mhz100),
            250 => Ok(Frequency::Mhz250),
            500 => Ok(Frequency::Mhz500),
            other => Err(DecodeError::UnknownFrequency(other)),
        }
    }

    pub fn mhz(&self) -> u32 {
        match self {
            Frequency::Mhz100 => 100,
            Frequency::Mhz250 => 250,
            Frequency::Mhz500 => 500,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz", self.mhz())
    }
}

/// A `(mask, shift)` pair for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub mask: u32,
    pub shift: u32,
}

impl Field {
    const NONE: Field = Field { mask: 0, shift: 0 };

    const fn new(mask: u32, shift: u32) -> Self {
        Self { mask, shift }
    }

    #[inline]
    pub fn extract(&self, word: u32) -> u32 {
        (word & self.mask) >> self.shift
    }

    #[inline]
    pub fn insert(&self, value: u32) -> u32 {
        (value << self.shift) & self.mask
    }

    pub fn is_present(&self) -> bool {
        self.mask != 0
    }
}

/// Field layout of the list-mode header for one firmware/frequency pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListModeMask {
    firmware: Firmware,
    frequency: Frequency,
}

impl ListModeMask {
    /// Mask for a supported firmware/frequency combination
    ///
    /// Every firmware in [`Firmware`] is defined at every [`Frequency`], so
    /// construction cannot fail once both values are parsed.
    pub fn new(firmware: Firmware, frequency: Frequency) -> Self {
        Self {
            firmware,
            frequency,
        }
    }

    /// Mask from configuration strings, e.g. `("R30474", 250)`
    pub fn from_config(firmware: &str, frequency_mhz: u32) -> Result<Self, DecodeError> {
        Ok(Self::new(
            firmware.parse()?,
            Frequency::from_mhz(frequency_mhz)?,
        ))
    }

    pub fn firmware(&self) -> Firmware {
        self.firmware
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn is_r29432(&self) -> bool {
        self.firmware == Firmware::R29432
    }

    fn is_r34688(&self) -> bool {
        self.firmware == Firmware::R34688
    }

    // Word 0

    pub fn channel(&self) -> Field {
        Field::new(constants::CHANNEL_MASK, 0)
    }

    pub fn slot(&self) -> Field {
        Field::new(constants::SLOT_MASK, constants::SLOT_SHIFT)
    }

    pub fn crate_id(&self) -> Field {
        Field::new(constants::CRATE_MASK, constants::CRATE_SHIFT)
    }

    pub fn header_length(&self) -> Field {
        Field::new(constants::HEADER_LENGTH_MASK, constants::HEADER_LENGTH_SHIFT)
    }

    pub fn event_length(&self) -> Field {
        Field::new(constants::EVENT_LENGTH_MASK, constants::EVENT_LENGTH_SHIFT)
    }

    pub fn virtual_channel(&self) -> Field {
        Field::new(constants::VIRTUAL_CHANNEL_MASK, 29)
    }

    pub fn saturated(&self) -> Field {
        Field::new(constants::SATURATED_MASK, 30)
    }

    pub fn finish_code(&self) -> Field {
        Field::new(constants::FINISH_CODE_MASK, 31)
    }

    // Word 2

    pub fn event_time_high(&self) -> Field {
        Field::new(constants::EVENT_TIME_HIGH_MASK, 0)
    }

    pub fn cfd_fraction(&self) -> Field {
        let mask = match self.frequency {
            Frequency::Mhz100 if self.is_r29432() => 0xFFFF_0000,
            Frequency::Mhz100 => 0x7FFF_0000,
            Frequency::Mhz250 if self.is_r29432() => 0x7FFF_0000,
            Frequency::Mhz250 => 0x3FFF_0000,
            Frequency::Mhz500 => 0x1FFF_0000,
        };
        Field::new(mask, constants::CFD_SHIFT)
    }

    pub fn cfd_forced_trigger(&self) -> Field {
        match self.frequency {
            Frequency::Mhz100 | Frequency::Mhz250 if !self.is_r29432() => {
                Field::new(0x8000_0000, 31)
            }
            _ => Field::NONE,
        }
    }

    pub fn cfd_trigger_source(&self) -> Field {
        match self.frequency {
            Frequency::Mhz100 => Field::NONE,
            Frequency::Mhz250 if self.is_r29432() => Field::new(0x8000_0000, 31),
            Frequency::Mhz250 => Field::new(0x4000_0000, 30),
            Frequency::Mhz500 => Field::new(0xE000_0000, 29),
        }
    }

    /// Full scale of the CFD fraction
    pub fn cfd_size(&self) -> f64 {
        match self.frequency {
            Frequency::Mhz100 if self.is_r29432() => 65536.0,
            Frequency::Mhz100 => 32768.0,
            Frequency::Mhz250 if self.is_r29432() => 32768.0,
            Frequency::Mhz250 => 16384.0,
            Frequency::Mhz500 => 8192.0,
        }
    }

    // Word 3

    pub fn energy(&self) -> Field {
        if self.is_r34688() {
            Field::new(0x0000_FFFF, 0)
        } else {
            Field::new(0x0000_7FFF, 0)
        }
    }

    pub fn trace_out_of_range(&self) -> Field {
        if self.is_r34688() {
            Field::new(0x8000_0000, 31)
        } else {
            Field::new(0x0000_8000, 15)
        }
    }

    pub fn trace_length(&self) -> Field {
        if self.is_r34688() {
            Field::new(0x7FFF_0000, constants::TRACE_LENGTH_SHIFT)
        } else {
            Field::new(0xFFFF_0000, constants::TRACE_LENGTH_SHIFT)
        }
    }
}
