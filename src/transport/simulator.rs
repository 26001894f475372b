//! In-process stand-in for the espresso machine's Modbus node.
//!
//! Used by `--simulate` and by the tests. The simulated board keeps a
//! register file, reacts to group commands the way the real board does
//! (selection bits go up on a delivery command and drop after a number of
//! status polls) and can be told to fail in specific ways.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

use super::{Transport, TransportFactory};
use crate::{
    config::SerialSettings,
    error::{BusFault, MachineError},
    protocol::registers::{
        Command, GroupRegister, SelectionFlag, FIRMWARE_VERSION, MACHINE_BLOCKED, MACHINE_CONFIG,
        MAX_GROUPS, NUMBER_OF_GROUPS, REGISTER_MAP, SERIAL_NUMBER,
    },
};

const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;
const DEFAULT_SERIAL: &str = "S50QSS0001";

#[derive(Debug)]
struct SimState {
    registers: HashMap<u16, u16>,
    /// Remaining selection polls before a group's delivery finishes
    remaining_polls: HashMap<u8, u32>,
    busy_polls: u32,
    hold_busy: bool,
    fail_open: bool,
    fail_io: bool,
    exceptions: HashMap<u16, u8>,
    writes: Vec<(u16, u16)>,
    reads: usize,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
}

impl SimState {
    fn new() -> Self {
        let mut registers = HashMap::new();
        for descriptor in REGISTER_MAP.iter().filter(|d| d.readable()) {
            for offset in 0..descriptor.count {
                registers.insert(descriptor.address + offset, 0);
            }
        }
        let mut state = Self {
            registers,
            remaining_polls: HashMap::new(),
            busy_polls: 2,
            hold_busy: false,
            fail_open: false,
            fail_io: false,
            exceptions: HashMap::new(),
            writes: Vec::new(),
            reads: 0,
            opens: HashMap::new(),
            closes: HashMap::new(),
        };
        state.set_serial(DEFAULT_SERIAL);
        state.registers.insert(FIRMWARE_VERSION.address, 0x0205);
        state.registers.insert(NUMBER_OF_GROUPS.address, 3);
        for group in 1..=MAX_GROUPS {
            if let Ok(address) = GroupRegister::PurgeCountdown.address(group) {
                state.registers.insert(address, 600);
            }
        }
        state
    }

    fn set_serial(&mut self, serial: &str) {
        let mut bytes = serial.as_bytes().to_vec();
        bytes.resize(SERIAL_NUMBER.count as usize * 2, 0);
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            self.registers.insert(
                SERIAL_NUMBER.address + i as u16,
                u16::from_be_bytes([chunk[0], chunk[1]]),
            );
        }
    }

    fn selection_group(address: u16) -> Option<u8> {
        (1..=MAX_GROUPS).find(|g| GroupRegister::Selection.address(*g).ok() == Some(address))
    }

    fn command_group(address: u16) -> Option<u8> {
        (1..=MAX_GROUPS).find(|g| GroupRegister::Command.address(*g).ok() == Some(address))
    }

    fn set_selection(&mut self, group: u8, word: u16) {
        if let Ok(address) = GroupRegister::Selection.address(group) {
            self.registers.insert(address, word);
        }
    }

    /// A selection read advances the simulated delivery by one poll.
    fn tick_selection(&mut self, group: u8) {
        if self.hold_busy {
            return;
        }
        if let Some(remaining) = self.remaining_polls.get_mut(&group) {
            if *remaining == 0 {
                self.remaining_polls.remove(&group);
                self.set_selection(group, 0);
            } else {
                *remaining -= 1;
            }
        }
    }

    fn apply_command(&mut self, group: u8, value: u16) -> Result<(), BusFault> {
        let command = Command::try_from(value).map_err(|_| BusFault::Exception {
            code: ILLEGAL_DATA_VALUE,
        })?;
        match command {
            Command::NoAction => {}
            Command::StopDelivery => {
                self.remaining_polls.remove(&group);
                self.set_selection(group, 0);
            }
            Command::StartPurge => {
                self.set_selection(group, SelectionFlag::Purge.mask());
                self.remaining_polls.insert(group, self.busy_polls);
                if let Ok(address) = GroupRegister::PurgeCountdown.address(group) {
                    self.registers.insert(address, 600);
                }
            }
            delivery => {
                self.set_selection(group, delivery.bits());
                self.remaining_polls.insert(group, self.busy_polls);
            }
        }
        Ok(())
    }
}

/// Shared handle to a simulated board. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct SimulatedMachine {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMachine {
    /// Idle three-group machine with four doses per group.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    /// Drop a register so reads of it fail with an exception response.
    pub fn remove_register(&self, address: u16) {
        self.state.lock().registers.remove(&address);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state.lock().registers.get(&address).copied()
    }

    pub fn set_serial_number(&self, serial: &str) {
        self.state.lock().set_serial(serial);
    }

    pub fn set_number_of_groups(&self, groups: u16) {
        self.set_register(NUMBER_OF_GROUPS.address, groups);
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.set_register(MACHINE_BLOCKED.address, u16::from(blocked));
    }

    pub fn set_machine_config(&self, word: u16) {
        self.set_register(MACHINE_CONFIG.address, word);
    }

    pub fn set_group_selection(&self, group: u8, word: u16) {
        self.state.lock().set_selection(group, word);
    }

    pub fn set_purge_countdown(&self, group: u8, seconds: u16) {
        if let Ok(address) = GroupRegister::PurgeCountdown.address(group) {
            self.set_register(address, seconds);
        }
    }

    pub fn set_sensor_fault(&self, group: u8, fault: bool) {
        if let Ok(address) = GroupRegister::SensorFault.address(group) {
            self.set_register(address, u16::from(fault));
        }
    }

    /// Number of selection polls a delivery stays visible before it ends.
    pub fn set_busy_polls(&self, polls: u32) {
        self.state.lock().busy_polls = polls;
    }

    /// Keep every started delivery running until stopped.
    pub fn set_hold_busy(&self, hold: bool) {
        self.state.lock().hold_busy = hold;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make every transaction fail as if the line went dead.
    pub fn set_fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    pub fn set_exception(&self, address: u16, code: u8) {
        self.state.lock().exceptions.insert(address, code);
    }

    pub fn clear_exception(&self, address: u16) {
        self.state.lock().exceptions.remove(&address);
    }

    /// Every accepted write as `(address, value)`, oldest first.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().writes.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn open_count(&self, port: &str) -> usize {
        self.state.lock().opens.get(port).copied().unwrap_or(0)
    }

    pub fn close_count(&self, port: &str) -> usize {
        self.state.lock().closes.get(port).copied().unwrap_or(0)
    }

    fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, BusFault> {
        let mut state = self.state.lock();
        state.reads += 1;
        if state.fail_io {
            return Err(BusFault::io("no response within timeout"));
        }
        let mut values = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let current = address.wrapping_add(offset);
            if let Some(code) = state.exceptions.get(&current) {
                return Err(BusFault::Exception { code: *code });
            }
            let value = state
                .registers
                .get(&current)
                .copied()
                .ok_or(BusFault::Exception {
                    code: ILLEGAL_DATA_ADDRESS,
                })?;
            values.push(value);
        }
        if count == 1 {
            if let Some(group) = SimState::selection_group(address) {
                state.tick_selection(group);
            }
        }
        Ok(values)
    }

    fn write(&self, address: u16, value: u16) -> Result<(), BusFault> {
        let mut state = self.state.lock();
        if state.fail_io {
            return Err(BusFault::io("no response within timeout"));
        }
        if let Some(code) = state.exceptions.get(&address) {
            return Err(BusFault::Exception { code: *code });
        }
        let writable = REGISTER_MAP
            .iter()
            .any(|d| d.address == address && d.writable());
        if !writable {
            return Err(BusFault::Exception {
                code: ILLEGAL_DATA_ADDRESS,
            });
        }
        if let Some(group) = SimState::command_group(address) {
            state.apply_command(group, value)?;
        }
        state.writes.push((address, value));
        Ok(())
    }
}

/// Transport session against a [`SimulatedMachine`].
pub struct SimulatorTransport {
    port: String,
    machine: SimulatedMachine,
    open: bool,
}

impl SimulatorTransport {
    pub fn new(port: impl Into<String>, machine: SimulatedMachine) -> Self {
        Self {
            port: port.into(),
            machine,
            open: false,
        }
    }
}

impl Transport for SimulatorTransport {
    fn port(&self) -> &str {
        &self.port
    }

    fn open(&mut self) -> Result<(), MachineError> {
        if self.open {
            return Ok(());
        }
        let mut state = self.machine.state.lock();
        if state.fail_open {
            return Err(MachineError::ConnectionFailed {
                port: self.port.clone(),
                cause: "simulated open failure".to_string(),
            });
        }
        *state.opens.entry(self.port.clone()).or_default() += 1;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            *self
                .machine
                .state
                .lock()
                .closes
                .entry(self.port.clone())
                .or_default() += 1;
            self.open = false;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, MachineError> {
        let result = if self.open {
            self.machine.read(address, count)
        } else {
            Err(BusFault::io("port is not open"))
        };
        result.map_err(|cause| MachineError::ReadFailed {
            address,
            count,
            cause,
        })
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<(), MachineError> {
        let result = if self.open {
            self.machine.write(address, value)
        } else {
            Err(BusFault::io("port is not open"))
        };
        result.map_err(|cause| MachineError::WriteFailed {
            address,
            value,
            cause,
        })
    }
}

/// Hands out transports that all talk to one shared simulated board.
#[derive(Debug, Clone, Default)]
pub struct SimulatorFactory {
    machine: SimulatedMachine,
}

impl SimulatorFactory {
    pub fn new(machine: SimulatedMachine) -> Self {
        Self { machine }
    }

    pub fn machine(&self) -> &SimulatedMachine {
        &self.machine
    }
}

impl TransportFactory for SimulatorFactory {
    fn create(&self, settings: &SerialSettings) -> Box<dyn Transport> {
        Box::new(SimulatorTransport::new(
            settings.port.clone(),
            self.machine.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode::decode_serial_number;

    fn open_transport(machine: &SimulatedMachine) -> SimulatorTransport {
        let mut transport = SimulatorTransport::new("sim0", machine.clone());
        transport.open().unwrap();
        transport
    }

    #[test]
    fn test_serial_number_layout() {
        let machine = SimulatedMachine::new();
        let mut transport = open_transport(&machine);
        let words = transport
            .read_registers(SERIAL_NUMBER.address, SERIAL_NUMBER.count)
            .unwrap();
        assert_eq!(decode_serial_number(&words).as_deref(), Some(DEFAULT_SERIAL));
    }

    #[test]
    fn test_delivery_clears_after_polls() {
        let machine = SimulatedMachine::new();
        machine.set_busy_polls(1);
        let mut transport = open_transport(&machine);
        let command = GroupRegister::Command.address(2).unwrap();
        let selection = GroupRegister::Selection.address(2).unwrap();

        transport
            .write_register(command, Command::DoubleShort.bits())
            .unwrap();
        assert_eq!(transport.read_registers(selection, 1).unwrap(), vec![0x04]);
        assert_eq!(transport.read_registers(selection, 1).unwrap(), vec![0x04]);
        assert_eq!(transport.read_registers(selection, 1).unwrap(), vec![0]);
        assert_eq!(machine.writes(), vec![(command, 0x04)]);
    }

    #[test]
    fn test_stop_clears_selection() {
        let machine = SimulatedMachine::new();
        machine.set_hold_busy(true);
        let mut transport = open_transport(&machine);
        let command = GroupRegister::Command.address(1).unwrap();
        let selection = GroupRegister::Selection.address(1).unwrap();

        transport
            .write_register(command, Command::SingleLong.bits())
            .unwrap();
        assert_eq!(transport.read_registers(selection, 1).unwrap(), vec![0x02]);
        transport
            .write_register(command, Command::StopDelivery.bits())
            .unwrap();
        assert_eq!(transport.read_registers(selection, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_unknown_address_is_an_exception() {
        let machine = SimulatedMachine::new();
        let mut transport = open_transport(&machine);
        let err = transport.read_registers(0x0300, 1).unwrap_err();
        assert!(matches!(
            err,
            MachineError::ReadFailed {
                cause: BusFault::Exception { code: 2 },
                ..
            }
        ));
        assert!(!err.is_connection_issue());
        // Read-only registers reject writes.
        assert!(transport
            .write_register(MACHINE_BLOCKED.address, 1)
            .is_err());
    }

    #[test]
    fn test_closed_and_failing_transport() {
        let machine = SimulatedMachine::new();
        let mut transport = SimulatorTransport::new("sim0", machine.clone());
        assert!(transport.read_registers(0x100, 1).is_err());

        machine.set_fail_open(true);
        assert!(transport.open().is_err());
        machine.set_fail_open(false);
        transport.open().unwrap();
        transport.open().unwrap();
        assert_eq!(machine.open_count("sim0"), 1);

        machine.set_fail_io(true);
        let err = transport.read_registers(0x100, 1).unwrap_err();
        assert!(err.is_connection_issue());

        transport.close();
        transport.close();
        assert_eq!(machine.close_count("sim0"), 1);
    }
}
