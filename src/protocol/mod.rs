//! Wire-level knowledge about the espresso machine: the register map, the
//! pure decoders for register words and the Modbus RTU frame helpers.
pub mod decode;
pub mod frame;
pub mod registers;

pub use decode::{
    decode_firmware_version, decode_flag, decode_machine_config, decode_serial_number,
    GroupSelection, MachineConfig,
};
pub use registers::{
    validate_group, Access, CoffeeType, Command, GroupRegister, RegisterDescriptor, SelectionFlag,
    DEFAULT_GROUPS, MAX_GROUPS, REGISTER_MAP,
};
