//! Device driver for the espresso machine.
//!
//! [`CoffeeMachine`] owns one transport and turns the register map into a
//! typed command/status model. Register I/O is serialized through a single
//! mutex around the transport; connect and disconnect are serialized through
//! a second lock so a reconnect never races a caller tearing the session down.

pub mod clock;
pub mod snapshot;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    cache::{SnapshotKind, StatusCache},
    config::SerialSettings,
    error::MachineError,
    protocol::{
        decode::{
            decode_firmware_version, decode_flag, decode_machine_config, decode_serial_number,
            GroupSelection, MachineConfig,
        },
        registers::{
            validate_group, CoffeeType, Command, GroupRegister, DEFAULT_GROUPS, FIRMWARE_VERSION,
            MACHINE_BLOCKED, MACHINE_CONFIG, MAT_COMMAND, MAX_GROUPS, NEAR_PURGE_THRESHOLD_SECS,
            NUMBER_OF_GROUPS, PURGE_WARNING_THRESHOLD_SECS, SERIAL_NUMBER, WATER_COMMAND,
        },
    },
    transport::Transport,
};

use clock::{CancelHandle, Clock};
use snapshot::{
    group_key, GroupHealth, GroupStatus, HealthReport, MachineInfo, MachineStatus, OverallStatus,
};

/// Accepted coffee dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReceipt {
    pub group: u8,
    pub coffee_type: CoffeeType,
    pub command: Command,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

/// How a wait for a group to become free ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Free,
    /// Deadline reached; `last_busy` is the last successful reading, if any.
    TimedOut {
        waited: Duration,
        last_busy: Option<bool>,
    },
    Cancelled,
}

impl WaitOutcome {
    pub fn is_free(&self) -> bool {
        matches!(self, WaitOutcome::Free)
    }
}

pub struct CoffeeMachine {
    settings: SerialSettings,
    transport: Mutex<Box<dyn Transport>>,
    connection_lock: Mutex<()>,
    connected: AtomicBool,
    retired: AtomicBool,
    cache: Arc<StatusCache>,
    clock: Arc<dyn Clock>,
}

impl CoffeeMachine {
    pub fn new(
        settings: SerialSettings,
        transport: Box<dyn Transport>,
        cache: Arc<StatusCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            transport: Mutex::new(transport),
            connection_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            cache,
            clock,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn port(&self) -> &str {
        &self.settings.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.settings.baud_rate
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn unavailable(&self) -> MachineError {
        MachineError::ConnectionUnavailable {
            port: self.settings.port.clone(),
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cache.put_connected(false);
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    /// Open the session. Calling it while connected is a no-op.
    pub fn connect(&self) -> Result<(), MachineError> {
        let _guard = self.connection_lock.lock();
        if self.retired.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        let mut transport = self.transport.lock();
        if self.is_connected() && transport.is_open() {
            return Ok(());
        }
        match transport.open() {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.cache.put_connected(true);
                log::info!(
                    "Connected to coffee machine on {} at {} baud",
                    self.settings.port,
                    self.settings.baud_rate
                );
                Ok(())
            }
            Err(err) => {
                self.mark_disconnected();
                log::error!("Failed to connect to coffee machine: {err}");
                Err(err)
            }
        }
    }

    /// Close the session. Safe to call when already disconnected.
    pub fn disconnect(&self) {
        let _guard = self.connection_lock.lock();
        let mut transport = self.transport.lock();
        if transport.is_open() {
            transport.close();
            log::info!("Disconnected from coffee machine on {}", self.settings.port);
        }
        self.mark_disconnected();
    }

    /// Disconnect for good; later connection attempts fail.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.disconnect();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Make one reconnect attempt if disconnected.
    pub fn ensure_connection(&self) -> Result<(), MachineError> {
        if self.is_connected() {
            return Ok(());
        }
        log::warn!("Not connected, attempting to reconnect...");
        self.connect().map_err(|err| {
            log::debug!("reconnect failed: {err}");
            self.unavailable()
        })
    }

    // ---------------------------------------------------------------------
    // Raw register access
    // ---------------------------------------------------------------------

    /// Run one transaction on an established session. Link-level failures
    /// close the transport and mark the driver disconnected.
    fn transact<T>(
        &self,
        op: impl FnOnce(&mut dyn Transport) -> Result<T, MachineError>,
    ) -> Result<T, MachineError> {
        let mut transport = self.transport.lock();
        if !self.is_connected() || !transport.is_open() {
            return Err(self.unavailable());
        }
        let result = op(&mut **transport);
        if let Err(err) = &result {
            log::error!("{err}");
            if err.is_connection_issue() {
                transport.close();
                self.mark_disconnected();
            }
        }
        result
    }

    pub fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, MachineError> {
        if count == 0 {
            return Err(MachineError::invalid("Register count must be positive"));
        }
        self.ensure_connection()?;
        self.transact(|t| t.read_registers(address, count))
    }

    pub fn write_register(&self, address: u16, value: u16) -> Result<(), MachineError> {
        self.ensure_connection()?;
        self.transact(|t| t.write_register(address, value))
    }

    fn read_word(&self, address: u16) -> Result<u16, MachineError> {
        let words = self.read_registers(address, 1)?;
        words.first().copied().ok_or(MachineError::ReadFailed {
            address,
            count: 1,
            cause: crate::error::BusFault::protocol("empty response"),
        })
    }

    // ---------------------------------------------------------------------
    // Machine reads
    // ---------------------------------------------------------------------

    /// Board serial number; `None` when the machine reports a blank one.
    pub fn serial_number(&self) -> Result<Option<String>, MachineError> {
        let words = self.read_registers(SERIAL_NUMBER.address, SERIAL_NUMBER.count)?;
        Ok(decode_serial_number(&words))
    }

    pub fn firmware_version(&self) -> Result<String, MachineError> {
        self.read_word(FIRMWARE_VERSION.address)
            .map(decode_firmware_version)
    }

    pub fn number_of_groups(&self) -> Result<u8, MachineError> {
        let word = self.read_word(NUMBER_OF_GROUPS.address)?;
        u8::try_from(word).map_err(|_| MachineError::ReadFailed {
            address: NUMBER_OF_GROUPS.address,
            count: 1,
            cause: crate::error::BusFault::protocol(format!("implausible group count {word}")),
        })
    }

    pub fn is_machine_blocked(&self) -> Result<bool, MachineError> {
        self.read_word(MACHINE_BLOCKED.address).map(decode_flag)
    }

    pub fn machine_config(&self) -> Result<MachineConfig, MachineError> {
        self.read_word(MACHINE_CONFIG.address)
            .map(decode_machine_config)
    }

    /// Groups to iterate in aggregations: the reported count when it is
    /// plausible, otherwise the default.
    fn group_count(&self) -> u8 {
        match self.number_of_groups() {
            Ok(n) if (1..=MAX_GROUPS).contains(&n) => n,
            Ok(n) => {
                log::warn!("Machine reports {n} groups, using {DEFAULT_GROUPS}");
                DEFAULT_GROUPS
            }
            Err(_) => DEFAULT_GROUPS,
        }
    }

    // ---------------------------------------------------------------------
    // Group reads
    // ---------------------------------------------------------------------

    pub fn group_selection(&self, group: u8) -> Result<GroupSelection, MachineError> {
        let address = GroupRegister::Selection.address(group)?;
        self.read_word(address).map(GroupSelection::decode)
    }

    pub fn sensor_fault(&self, group: u8) -> Result<bool, MachineError> {
        let address = GroupRegister::SensorFault.address(group)?;
        self.read_word(address).map(decode_flag)
    }

    /// Seconds until the group's automatic purge.
    pub fn purge_countdown(&self, group: u8) -> Result<u16, MachineError> {
        let address = GroupRegister::PurgeCountdown.address(group)?;
        self.read_word(address)
    }

    pub fn is_group_busy(&self, group: u8) -> Result<bool, MachineError> {
        self.group_selection(group).map(|s| s.is_busy())
    }

    // ---------------------------------------------------------------------
    // Aggregations
    // ---------------------------------------------------------------------

    pub fn machine_info(&self) -> Result<MachineInfo, MachineError> {
        let ticket = self.cache.ticket(SnapshotKind::Info);
        self.ensure_connection()?;
        let info = MachineInfo {
            serial_number: self.serial_number().ok().flatten(),
            firmware_version: self.firmware_version().ok(),
            number_of_groups: self.number_of_groups().ok(),
            is_blocked: self.is_machine_blocked().ok(),
            machine_config: self.machine_config().ok(),
            connection_status: self.is_connected(),
            port: self.settings.port.clone(),
            baudrate: self.settings.baud_rate,
            last_updated: Local::now(),
        };
        self.cache.put_info_checked(ticket, info.clone());
        Ok(info)
    }

    pub fn all_groups_status(&self) -> Result<MachineStatus, MachineError> {
        let ticket = self.cache.ticket(SnapshotKind::Status);
        self.ensure_connection()?;
        let mut groups = BTreeMap::new();
        for group in 1..=self.group_count() {
            let status = GroupStatus::from_reads(
                self.group_selection(group).ok(),
                self.sensor_fault(group).ok(),
                self.purge_countdown(group).ok(),
            );
            groups.insert(group_key(group), status);
        }
        let status = MachineStatus {
            connected: self.is_connected(),
            groups,
            machine_blocked: self.is_machine_blocked().ok(),
            machine_config: self.machine_config().ok(),
            last_updated: Local::now(),
        };
        // A command sent during the reads invalidates this snapshot.
        self.cache.put_status_checked(ticket, status.clone());
        Ok(status)
    }

    /// Composite, read-only health check. Never fails: a missing session is
    /// reported inside the result.
    pub fn health_check(&self) -> HealthReport {
        let ticket = self.cache.ticket(SnapshotKind::Health);
        if let Err(err) = self.ensure_connection() {
            let health = HealthReport::not_connected(err.to_string());
            self.cache.put_health_checked(ticket, health.clone());
            return health;
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let machine_blocked = self.is_machine_blocked().ok();
        match machine_blocked {
            Some(true) => errors.push("Machine is blocked".to_string()),
            Some(false) => {}
            None => errors.push("Unable to read machine blocked state".to_string()),
        }

        let mut groups_status = BTreeMap::new();
        for group in 1..=self.group_count() {
            let health = GroupHealth {
                busy: self.is_group_busy(group).ok(),
                sensor_fault: self.sensor_fault(group).ok(),
                purge_countdown: self.purge_countdown(group).ok(),
            };
            match health.sensor_fault {
                Some(true) => errors.push(format!("Sensor fault detected on group {group}")),
                Some(false) => {}
                None => errors.push(format!("Unable to read sensor state of group {group}")),
            }
            if let Some(countdown) = health.purge_countdown {
                if countdown < PURGE_WARNING_THRESHOLD_SECS {
                    warnings.push(format!("Group {group} automatic purge in {countdown}s"));
                }
            }
            groups_status.insert(group_key(group), health);
        }

        let health = HealthReport {
            connection: self.is_connected(),
            machine_blocked,
            groups_status,
            errors,
            warnings,
            overall_status: OverallStatus::Unhealthy,
            timestamp: Local::now(),
        }
        .finish();
        self.cache.put_health_checked(ticket, health.clone());
        health
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    pub fn send_command(&self, group: u8, command: Command) -> Result<(), MachineError> {
        let address = GroupRegister::Command.address(group)?;
        self.write_register(address, command.bits())?;
        self.cache.invalidate(SnapshotKind::Status);
        self.cache.invalidate(SnapshotKind::Health);
        log::info!(
            "Sent command {command} (0x{:04X}) to group {group}",
            command.bits()
        );
        Ok(())
    }

    /// Send a command given as a raw register value.
    pub fn send_raw_command(&self, group: u8, bits: u16) -> Result<Command, MachineError> {
        validate_group(group)?;
        let command = Command::from_bits(bits)?;
        self.send_command(group, command)?;
        Ok(command)
    }

    pub fn deliver_coffee(
        &self,
        group: u8,
        coffee_type: CoffeeType,
    ) -> Result<DeliveryReceipt, MachineError> {
        validate_group(group)?;

        if self.is_group_busy(group)? {
            log::warn!("Group {group} is busy, refusing {coffee_type}");
            return Err(MachineError::GroupBusy { group });
        }

        match self.purge_countdown(group) {
            Ok(countdown) if countdown < NEAR_PURGE_THRESHOLD_SECS => {
                log::warn!("Group {group} purge in {countdown}s, refusing {coffee_type}");
                return Err(MachineError::NearPurge { group, countdown });
            }
            Ok(_) => {}
            Err(err) => log::warn!("Purge countdown of group {group} unknown: {err}"),
        }

        let command = coffee_type.command();
        self.send_command(group, command)?;
        Ok(DeliveryReceipt {
            group,
            coffee_type,
            command,
            message: format!(
                "Coffee delivery started: {} on group {group}",
                coffee_type.label()
            ),
            timestamp: Local::now(),
        })
    }

    pub fn stop_delivery(&self, group: u8) -> Result<(), MachineError> {
        self.send_command(group, Command::StopDelivery)
    }

    pub fn start_purge(&self, group: u8) -> Result<(), MachineError> {
        self.send_command(group, Command::StartPurge)
    }

    /// Hot water dispenser: 0 stops, 1 and 2 select a dose.
    pub fn send_water_command(&self, set: u16) -> Result<(), MachineError> {
        self.send_dispenser_command(WATER_COMMAND.address, "water", set)
    }

    /// MAT (milk/steam) dispenser: 0 stops, 1 and 2 select a dose.
    pub fn send_mat_command(&self, set: u16) -> Result<(), MachineError> {
        self.send_dispenser_command(MAT_COMMAND.address, "mat", set)
    }

    fn send_dispenser_command(&self, address: u16, name: &str, set: u16) -> Result<(), MachineError> {
        if set > 2 {
            return Err(MachineError::invalid(format!(
                "Invalid {name} set: {set}. Must be 0, 1 or 2"
            )));
        }
        self.write_register(address, set)?;
        log::info!("Sent {name} command set={set}");
        Ok(())
    }

    /// Poll the group until it reports free, the timeout elapses or the wait
    /// is cancelled. Unreadable polls keep waiting; the deadline always wins.
    pub fn wait_until_group_is_free(
        &self,
        group: u8,
        timeout: Duration,
        poll_interval: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<WaitOutcome, MachineError> {
        validate_group(group)?;
        if poll_interval.is_zero() {
            return Err(MachineError::invalid("Poll interval must be positive"));
        }
        let start = self.clock.now();
        let deadline = start + timeout;
        let mut last_busy = None;

        loop {
            if cancel.is_some_and(CancelHandle::is_cancelled) {
                return Ok(WaitOutcome::Cancelled);
            }
            let now = self.clock.now();
            if now >= deadline {
                log::warn!("Timeout waiting for group {group} to become free");
                return Ok(WaitOutcome::TimedOut {
                    waited: now - start,
                    last_busy,
                });
            }
            match self.is_group_busy(group) {
                Ok(false) => return Ok(WaitOutcome::Free),
                Ok(true) => last_busy = Some(true),
                Err(err) => log::debug!("group {group} status unreadable while waiting: {err}"),
            }
            let now = self.clock.now();
            if now >= deadline {
                continue;
            }
            self.clock.sleep(poll_interval.min(deadline - now));
        }
    }
}

impl Drop for CoffeeMachine {
    fn drop(&mut self) {
        let transport = self.transport.get_mut();
        if transport.is_open() {
            transport.close();
        }
    }
}
