//! Composition root: wires configuration, transport factory, driver
//! manager, cache and orchestrator together and exposes the operations
//! the HTTP API, the scheduler and the CLI call.

use std::{sync::Arc, time::Duration};

use crate::{
    cache::{SnapshotKind, StatusCache},
    config::ControllerConfig,
    driver::{
        clock::{Clock, SystemClock},
        snapshot::{HealthReport, MachineInfo, MachineStatus},
        CoffeeMachine,
    },
    error::MachineError,
    events::{self, EventSink, MachineEvent, MaintenanceKind},
    manager::MachineManager,
    orchestrator::{DeliveryAttempt, DeliveryRecord, Orchestrator},
    protocol::registers::CoffeeType,
    transport::{SerialTransportFactory, SimulatedMachine, SimulatorFactory, TransportFactory},
};

pub struct Controller {
    config: ControllerConfig,
    manager: Arc<MachineManager>,
    orchestrator: Orchestrator,
    events: EventSink,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> (Self, flume::Receiver<MachineEvent>) {
        let (events, receiver) = events::channel();
        let cache = Arc::new(StatusCache::new(config.cache.clone(), clock.clone()));
        let manager = Arc::new(MachineManager::new(
            config.serial.clone(),
            factory,
            cache,
            clock,
        ));
        let orchestrator = Orchestrator::new(
            manager.clone(),
            events.clone(),
            Duration::from_secs(config.scheduler.delivery_timeout_secs),
            Duration::from_millis(config.scheduler.poll_interval_ms),
        );
        let controller = Self {
            config,
            manager,
            orchestrator,
            events,
        };
        (controller, receiver)
    }

    /// Controller on the system clock, talking to the serial port or to a
    /// fresh simulator when `simulate` is set.
    pub fn from_config(config: ControllerConfig) -> (Self, flume::Receiver<MachineEvent>) {
        let factory: Arc<dyn TransportFactory> = if config.simulate {
            log::info!("Using simulated coffee machine");
            Arc::new(SimulatorFactory::new(SimulatedMachine::new()))
        } else {
            Arc::new(SerialTransportFactory)
        };
        Self::new(config, factory, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn machine(&self) -> Arc<CoffeeMachine> {
        self.manager.get()
    }

    pub fn manager(&self) -> &Arc<MachineManager> {
        &self.manager
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn cache(&self) -> &Arc<StatusCache> {
        self.manager.cache()
    }

    /// Connect, replacing the driver when a port or baud rate is given.
    pub fn connect(
        &self,
        port: Option<&str>,
        baud_rate: Option<u32>,
    ) -> Result<MachineInfo, MachineError> {
        let machine = if port.is_some() || baud_rate.is_some() {
            self.manager.get_with(port, baud_rate, true)
        } else {
            self.manager.get()
        };
        if let Err(err) = machine.connect() {
            self.events.maintenance(
                MaintenanceKind::ConnectionIssue,
                None,
                err.to_string(),
            );
            return Err(err);
        }
        machine.machine_info()
    }

    /// Close the session. The offline marker left by the driver stays
    /// cached so reads report "not connected" instead of reopening the port.
    pub fn disconnect(&self) {
        self.machine().disconnect();
        let cache = self.cache();
        cache.invalidate(SnapshotKind::Info);
        cache.invalidate(SnapshotKind::Status);
        cache.invalidate(SnapshotKind::Health);
    }

    /// Recently failed connection; reads skip the reconnect attempt until
    /// the cached state expires.
    fn known_offline(&self, machine: &CoffeeMachine) -> bool {
        !machine.is_connected() && self.cache().connected() == Some(false)
    }

    pub fn info(&self) -> MachineInfo {
        if let Some(info) = self.cache().info() {
            return info;
        }
        let machine = self.machine();
        if self.known_offline(&machine) {
            return MachineInfo::not_connected(machine.port(), machine.baud_rate());
        }
        machine.machine_info().unwrap_or_else(|err| {
            log::warn!("machine info unavailable: {err}");
            MachineInfo::not_connected(machine.port(), machine.baud_rate())
        })
    }

    pub fn status(&self) -> MachineStatus {
        if let Some(status) = self.cache().status() {
            return status;
        }
        let machine = self.machine();
        if self.known_offline(&machine) {
            return MachineStatus::not_connected();
        }
        machine.all_groups_status().unwrap_or_else(|err| {
            log::warn!("machine status unavailable: {err}");
            MachineStatus::not_connected()
        })
    }

    pub fn health(&self) -> HealthReport {
        self.cache()
            .health()
            .unwrap_or_else(|| self.machine().health_check())
    }

    /// The single periodic health entry point. Always reads the machine and
    /// reports the outcome as maintenance events.
    pub fn run_health_check(&self) -> HealthReport {
        let health = self.machine().health_check();

        if !health.connection {
            self.events.maintenance(
                MaintenanceKind::ConnectionIssue,
                None,
                health.errors.join("; "),
            );
        }
        for group in health.faulted_groups() {
            self.events.maintenance(
                MaintenanceKind::SensorFault,
                Some(group),
                format!("Sensor fault detected on group {group}"),
            );
        }
        let mut description = format!("Health check: {}", health.overall_status);
        if !health.errors.is_empty() {
            description.push_str(&format!(" ({})", health.errors.join("; ")));
        }
        self.events
            .maintenance(MaintenanceKind::HealthCheck, None, description);
        health
    }

    pub fn deliver(&self, group: u8, coffee_type: CoffeeType) -> DeliveryAttempt {
        self.orchestrator.request_delivery(group, coffee_type)
    }

    pub fn track_delivery(&self, id: u64) -> Option<DeliveryRecord> {
        self.orchestrator.track_completion(id)
    }

    pub fn stop(&self, group: u8) -> Result<Option<DeliveryRecord>, MachineError> {
        self.orchestrator.stop_delivery(group)
    }

    pub fn purge(&self, group: u8) -> Result<(), MachineError> {
        self.orchestrator.start_purge(group)
    }

    pub fn water(&self, set: u16) -> Result<(), MachineError> {
        self.machine().send_water_command(set)
    }

    pub fn mat(&self, set: u16) -> Result<(), MachineError> {
        self.machine().send_mat_command(set)
    }

    pub fn deliveries(&self, limit: usize) -> Vec<DeliveryRecord> {
        self.orchestrator.deliveries(limit)
    }

    pub fn delivery(&self, id: u64) -> Option<DeliveryRecord> {
        self.orchestrator.delivery(id)
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}
