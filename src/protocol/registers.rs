//! Register map of the espresso machine controller board.
//!
//! Addresses are holding-register offsets on the Modbus node. The map below
//! is the canonical one for this crate: four groups are addressable even on
//! three-group machines, the number actually fitted is read from
//! `NUMBER_OF_GROUPS` at runtime.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::error::MachineError;

/// Highest group number the register map can address.
pub const MAX_GROUPS: u8 = 4;

/// Group count assumed when the machine does not report one.
pub const DEFAULT_GROUPS: u8 = 3;

/// Deliveries are refused when the automatic purge is closer than this.
pub const NEAR_PURGE_THRESHOLD_SECS: u16 = 10;

/// Purge countdowns below this are surfaced as health warnings.
pub const PURGE_WARNING_THRESHOLD_SECS: u16 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub count: u16,
    pub access: Access,
}

impl RegisterDescriptor {
    const fn new(name: &'static str, address: u16, count: u16, access: Access) -> Self {
        Self {
            name,
            address,
            count,
            access,
        }
    }

    pub fn readable(&self) -> bool {
        self.access != Access::WriteOnly
    }

    pub fn writable(&self) -> bool {
        self.access != Access::ReadOnly
    }
}

// Identification
pub const SERIAL_NUMBER: RegisterDescriptor =
    RegisterDescriptor::new("SERIAL_NUMBER", 0, 10, Access::ReadOnly);
pub const FIRMWARE_VERSION: RegisterDescriptor =
    RegisterDescriptor::new("FIRMWARE_VERSION", 11, 1, Access::ReadOnly);

// Machine state
pub const MACHINE_CONFIG: RegisterDescriptor =
    RegisterDescriptor::new("MACHINE_CONFIG", 0x10C, 1, Access::ReadOnly);
pub const MACHINE_BLOCKED: RegisterDescriptor =
    RegisterDescriptor::new("MACHINE_BLOCKED", 0x10D, 1, Access::ReadOnly);
pub const NUMBER_OF_GROUPS: RegisterDescriptor =
    RegisterDescriptor::new("NUMBER_OF_GROUPS", 0x10E, 1, Access::ReadOnly);

// Commands outside of the groups
pub const WATER_COMMAND: RegisterDescriptor =
    RegisterDescriptor::new("WATER_COMMAND", 0x204, 1, Access::WriteOnly);
pub const MAT_COMMAND: RegisterDescriptor =
    RegisterDescriptor::new("MAT_COMMAND", 0x205, 1, Access::WriteOnly);

/// Every register the controller knows about, in address order.
pub const REGISTER_MAP: &[RegisterDescriptor] = &[
    SERIAL_NUMBER,
    FIRMWARE_VERSION,
    RegisterDescriptor::new("GROUP_1_SELECTION", 0x100, 1, Access::ReadOnly),
    RegisterDescriptor::new("GROUP_2_SELECTION", 0x101, 1, Access::ReadOnly),
    RegisterDescriptor::new("GROUP_3_SELECTION", 0x102, 1, Access::ReadOnly),
    RegisterDescriptor::new("GROUP_4_SELECTION", 0x103, 1, Access::ReadOnly),
    RegisterDescriptor::new("SENSOR_FAULT_GROUP_1", 0x104, 1, Access::ReadOnly),
    RegisterDescriptor::new("SENSOR_FAULT_GROUP_2", 0x105, 1, Access::ReadOnly),
    RegisterDescriptor::new("SENSOR_FAULT_GROUP_3", 0x106, 1, Access::ReadOnly),
    RegisterDescriptor::new("SENSOR_FAULT_GROUP_4", 0x107, 1, Access::ReadOnly),
    RegisterDescriptor::new("PURGE_COUNTDOWN_GROUP_1", 0x108, 1, Access::ReadOnly),
    RegisterDescriptor::new("PURGE_COUNTDOWN_GROUP_2", 0x109, 1, Access::ReadOnly),
    RegisterDescriptor::new("PURGE_COUNTDOWN_GROUP_3", 0x10A, 1, Access::ReadOnly),
    RegisterDescriptor::new("PURGE_COUNTDOWN_GROUP_4", 0x10B, 1, Access::ReadOnly),
    MACHINE_CONFIG,
    MACHINE_BLOCKED,
    NUMBER_OF_GROUPS,
    RegisterDescriptor::new("COMMAND_GROUP_1", 0x200, 1, Access::WriteOnly),
    RegisterDescriptor::new("COMMAND_GROUP_2", 0x201, 1, Access::WriteOnly),
    RegisterDescriptor::new("COMMAND_GROUP_3", 0x202, 1, Access::WriteOnly),
    RegisterDescriptor::new("COMMAND_GROUP_4", 0x203, 1, Access::WriteOnly),
    WATER_COMMAND,
    MAT_COMMAND,
];

/// Look up a register by its symbolic name.
pub fn find_register(name: &str) -> Option<&'static RegisterDescriptor> {
    REGISTER_MAP.iter().find(|reg| reg.name == name)
}

/// Look up a register by its address.
pub fn register_at(address: u16) -> Option<&'static RegisterDescriptor> {
    REGISTER_MAP.iter().find(|reg| reg.address == address)
}

/// Per-group register banks; each bank holds one word per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRegister {
    Selection,
    SensorFault,
    PurgeCountdown,
    Command,
}

impl GroupRegister {
    const fn base(self) -> u16 {
        match self {
            GroupRegister::Selection => 0x100,
            GroupRegister::SensorFault => 0x104,
            GroupRegister::PurgeCountdown => 0x108,
            GroupRegister::Command => 0x200,
        }
    }

    /// Address of this bank's register for `group` (1-based).
    pub fn address(self, group: u8) -> Result<u16, MachineError> {
        validate_group(group)?;
        Ok(self.base() + u16::from(group - 1))
    }
}

pub fn validate_group(group: u8) -> Result<(), MachineError> {
    if (1..=MAX_GROUPS).contains(&group) {
        Ok(())
    } else {
        Err(MachineError::invalid(format!(
            "Group number must be 1-{MAX_GROUPS}, got {group}"
        )))
    }
}

/// Command word written to a group's command register. Exactly one bit is set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[repr(u16)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    SingleShort = 0x0001,
    SingleLong = 0x0002,
    DoubleShort = 0x0004,
    DoubleLong = 0x0008,
    NoAction = 0x0010,
    SingleMedium = 0x0020,
    DoubleMedium = 0x0040,
    StopDelivery = 0x0080,
    StartPurge = 0x0100,
}

impl Command {
    pub fn bits(self) -> u16 {
        self.into()
    }

    /// Validate a raw command word coming from outside the crate.
    pub fn from_bits(bits: u16) -> Result<Self, MachineError> {
        Command::try_from(bits)
            .map_err(|_| MachineError::invalid(format!("Invalid command: {bits} (0x{bits:04X})")))
    }

    /// Coffee type dispensed by this command, if it is a delivery command.
    pub fn coffee_type(self) -> Option<CoffeeType> {
        CoffeeType::iter().find(|ct| ct.command() == self)
    }
}

/// Coffee products a group can dispense.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CoffeeType {
    SingleShort,
    SingleMedium,
    SingleLong,
    DoubleShort,
    DoubleMedium,
    DoubleLong,
}

impl CoffeeType {
    pub fn command(self) -> Command {
        match self {
            CoffeeType::SingleShort => Command::SingleShort,
            CoffeeType::SingleMedium => Command::SingleMedium,
            CoffeeType::SingleLong => Command::SingleLong,
            CoffeeType::DoubleShort => Command::DoubleShort,
            CoffeeType::DoubleMedium => Command::DoubleMedium,
            CoffeeType::DoubleLong => Command::DoubleLong,
        }
    }

    /// Parse a coffee type name, e.g. `"double_medium"`.
    pub fn parse(name: &str) -> Result<Self, MachineError> {
        name.parse::<CoffeeType>().map_err(|_| {
            let valid = CoffeeType::iter()
                .map(|ct| ct.as_ref().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            MachineError::invalid(format!(
                "Invalid coffee_type: {name}. Must be one of [{valid}]"
            ))
        })
    }

    pub fn label(self) -> &'static str {
        match self {
            CoffeeType::SingleShort => "Single Short",
            CoffeeType::SingleMedium => "Single Medium",
            CoffeeType::SingleLong => "Single Long",
            CoffeeType::DoubleShort => "Double Short",
            CoffeeType::DoubleMedium => "Double Medium",
            CoffeeType::DoubleLong => "Double Long",
        }
    }
}

/// Bits of a group's selection (status) word.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    IntoPrimitive,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[repr(u16)]
#[strum(serialize_all = "snake_case")]
pub enum SelectionFlag {
    SingleShort = 0x01,
    SingleLong = 0x02,
    DoubleShort = 0x04,
    DoubleLong = 0x08,
    ContinuousFlow = 0x10,
    SingleMedium = 0x20,
    DoubleMedium = 0x40,
    Purge = 0x80,
}

impl SelectionFlag {
    pub fn mask(self) -> u16 {
        self.into()
    }

    /// OR of all eight masks; a group is busy iff any of these bits is set.
    pub fn all_mask() -> u16 {
        SelectionFlag::iter().fold(0, |acc, flag| acc | flag.mask())
    }

    pub fn coffee_type(self) -> Option<CoffeeType> {
        match self {
            SelectionFlag::SingleShort => Some(CoffeeType::SingleShort),
            SelectionFlag::SingleLong => Some(CoffeeType::SingleLong),
            SelectionFlag::DoubleShort => Some(CoffeeType::DoubleShort),
            SelectionFlag::DoubleLong => Some(CoffeeType::DoubleLong),
            SelectionFlag::SingleMedium => Some(CoffeeType::SingleMedium),
            SelectionFlag::DoubleMedium => Some(CoffeeType::DoubleMedium),
            SelectionFlag::ContinuousFlow | SelectionFlag::Purge => None,
        }
    }
}
