//! Pure decoders from raw register words to typed values.

use serde::Serialize;
use strum::IntoEnumIterator;

use super::registers::{CoffeeType, SelectionFlag};

/// Decode the board serial number: two characters per word, high byte first.
///
/// Zero bytes are skipped and trailing NULs stripped; a blank serial yields `None`.
pub fn decode_serial_number(words: &[u16]) -> Option<String> {
    let serial = words
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .filter(|byte| *byte != 0)
        .map(char::from)
        .collect::<String>();
    let serial = serial.trim_end_matches('\0');
    if serial.is_empty() {
        None
    } else {
        Some(serial.to_string())
    }
}

/// `major.minor` from the high and low byte of the version register.
pub fn decode_firmware_version(word: u16) -> String {
    let [major, minor] = word.to_be_bytes();
    format!("{major}.{minor}")
}

/// Single-word boolean registers (blocked, sensor fault) read `1` when set.
pub fn decode_flag(word: u16) -> bool {
    word == 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MachineConfig {
    pub doses_available: u8,
    pub raw_config: u16,
}

impl MachineConfig {
    /// `0b11` in the dose bits is an unused configuration.
    pub fn is_valid(&self) -> bool {
        self.raw_config & 0x03 != 0x03
    }
}

pub fn decode_machine_config(word: u16) -> MachineConfig {
    let doses_available = match word & 0x03 {
        0b00 => 4,
        0b01 => 6,
        0b10 => 2,
        _ => 0,
    };
    MachineConfig {
        doses_available,
        raw_config: word,
    }
}

/// Decoded selection word of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupSelection {
    pub single_short: bool,
    pub single_long: bool,
    pub double_short: bool,
    pub double_long: bool,
    pub continuous_flow: bool,
    pub single_medium: bool,
    pub double_medium: bool,
    pub purge: bool,
    pub raw_status: u16,
}

impl GroupSelection {
    pub fn decode(word: u16) -> Self {
        let has = |flag: SelectionFlag| word & flag.mask() != 0;
        Self {
            single_short: has(SelectionFlag::SingleShort),
            single_long: has(SelectionFlag::SingleLong),
            double_short: has(SelectionFlag::DoubleShort),
            double_long: has(SelectionFlag::DoubleLong),
            continuous_flow: has(SelectionFlag::ContinuousFlow),
            single_medium: has(SelectionFlag::SingleMedium),
            double_medium: has(SelectionFlag::DoubleMedium),
            purge: has(SelectionFlag::Purge),
            raw_status: word,
        }
    }

    pub fn is_set(&self, flag: SelectionFlag) -> bool {
        self.raw_status & flag.mask() != 0
    }

    pub fn is_busy(&self) -> bool {
        self.raw_status & SelectionFlag::all_mask() != 0
    }

    /// Flags currently set, in mask order.
    pub fn active_flags(&self) -> Vec<SelectionFlag> {
        SelectionFlag::iter().filter(|f| self.is_set(*f)).collect()
    }

    /// Re-encode the decoded flags; bits outside the eight masks are dropped.
    pub fn encode(&self) -> u16 {
        self.active_flags()
            .into_iter()
            .fold(0, |acc, flag| acc | flag.mask())
    }

    pub fn active_coffee_types(&self) -> Vec<CoffeeType> {
        self.active_flags()
            .into_iter()
            .filter_map(SelectionFlag::coffee_type)
            .collect()
    }

    /// Short description of what the group is doing.
    pub fn current_action(&self) -> String {
        if self.purge {
            return "Purging".to_string();
        }
        if self.continuous_flow {
            return "Continuous flow".to_string();
        }
        match self.active_coffee_types().first() {
            Some(ct) => format!("Delivering {}", ct.label()),
            None => "Idle".to_string(),
        }
    }
}
