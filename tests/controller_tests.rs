use std::sync::Arc;

use brewctl::{
    config::ControllerConfig,
    controller::Controller,
    driver::{clock::ManualClock, snapshot::OverallStatus},
    error::MachineError,
    events::{MachineEvent, MaintenanceKind},
    protocol::registers::{CoffeeType, MAT_COMMAND, WATER_COMMAND},
    transport::{SimulatedMachine, SimulatorFactory},
};

fn setup() -> (Controller, flume::Receiver<MachineEvent>, SimulatedMachine) {
    let machine = SimulatedMachine::new();
    let (controller, events) = Controller::new(
        ControllerConfig::default(),
        Arc::new(SimulatorFactory::new(machine.clone())),
        Arc::new(ManualClock::new()),
    );
    (controller, events, machine)
}

fn maintenance_kinds(events: &flume::Receiver<MachineEvent>) -> Vec<(MaintenanceKind, Option<u8>)> {
    events
        .try_iter()
        .filter_map(|event| match event {
            MachineEvent::Maintenance(entry) => Some((entry.kind, entry.group_number)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_info_reads_identification_and_caches_it() {
    let (controller, _events, machine) = setup();

    let info = controller.info();
    assert!(info.connection_status);
    assert_eq!(info.serial_number.as_deref(), Some("S50QSS0001"));
    assert_eq!(info.firmware_version.as_deref(), Some("2.5"));
    assert_eq!(info.number_of_groups, Some(3));
    assert_eq!(info.is_blocked, Some(false));
    assert_eq!(info.port, "/dev/ttyUSB0");
    assert_eq!(info.baudrate, 9600);

    let reads = machine.read_count();
    let again = controller.info();
    assert_eq!(again.serial_number, info.serial_number);
    assert_eq!(machine.read_count(), reads);
}

#[test]
fn test_unreachable_machine_yields_not_connected_shapes() {
    let (controller, events, machine) = setup();
    machine.set_fail_open(true);

    let info = controller.info();
    assert!(!info.connection_status);
    assert_eq!(info.serial_number, None);
    assert_eq!(info.port, "/dev/ttyUSB0");

    let status = controller.status();
    assert!(!status.connected);
    assert!(status.groups.is_empty());
    assert_eq!(machine.read_count(), 0);

    let err = controller.connect(None, None).unwrap_err();
    assert!(err.is_connection_issue());
    assert!(maintenance_kinds(&events).contains(&(MaintenanceKind::ConnectionIssue, None)));

    machine.set_fail_open(false);
    let info = controller.connect(None, None).unwrap();
    assert!(info.connection_status);
}

#[test]
fn test_status_lists_every_reported_group() {
    let (controller, _events, machine) = setup();
    machine.set_number_of_groups(2);
    machine.set_purge_countdown(2, 42);

    let status = controller.status();
    assert!(status.connected);
    assert_eq!(
        status.groups.keys().cloned().collect::<Vec<_>>(),
        vec!["group_1".to_string(), "group_2".to_string()]
    );
    let group = status.group(2).unwrap();
    assert_eq!(group.purge_countdown, Some(42));
    assert_eq!(group.is_busy, Some(false));
    assert_eq!(group.sensor_fault, Some(false));
}

#[test]
fn test_command_refreshes_cached_status() {
    let (controller, _events, machine) = setup();
    machine.set_hold_busy(true);

    assert_eq!(controller.status().group(1).unwrap().is_busy, Some(false));
    controller
        .deliver(1, CoffeeType::SingleLong)
        .result
        .unwrap();
    let group = controller.status().group(1).cloned().unwrap();
    assert_eq!(group.is_busy, Some(true));
    assert_eq!(group.current_action.as_deref(), Some("Delivering Single Long"));
}

#[test]
fn test_health_check_reports_faults_as_events() {
    let (controller, events, machine) = setup();
    machine.set_sensor_fault(2, true);
    machine.set_purge_countdown(3, 12);

    let health = controller.run_health_check();
    assert_eq!(health.overall_status, OverallStatus::Unhealthy);
    assert_eq!(health.errors, vec!["Sensor fault detected on group 2"]);
    assert_eq!(health.warnings, vec!["Group 3 automatic purge in 12s"]);

    let kinds = maintenance_kinds(&events);
    assert!(kinds.contains(&(MaintenanceKind::SensorFault, Some(2))));
    assert_eq!(kinds.last(), Some(&(MaintenanceKind::HealthCheck, None)));

    // The on-demand read serves the stored report.
    let reads = machine.read_count();
    assert_eq!(controller.health().errors, health.errors);
    assert_eq!(machine.read_count(), reads);
}

#[test]
fn test_health_check_without_connection() {
    let (controller, events, machine) = setup();
    machine.set_fail_open(true);

    let health = controller.run_health_check();
    assert!(!health.connection);
    assert!(!health.is_healthy());
    assert_eq!(health.errors.len(), 1);

    let kinds = maintenance_kinds(&events);
    assert!(kinds.contains(&(MaintenanceKind::ConnectionIssue, None)));
    assert!(kinds.contains(&(MaintenanceKind::HealthCheck, None)));
}

#[test]
fn test_connect_to_another_port_replaces_driver() {
    let (controller, _events, machine) = setup();
    assert!(controller.info().connection_status);
    let old = controller.machine();

    let info = controller.connect(Some("/dev/ttyUSB1"), Some(19200)).unwrap();
    assert_eq!(info.port, "/dev/ttyUSB1");
    assert_eq!(info.baudrate, 19200);
    assert!(old.is_retired());
    assert_eq!(machine.close_count("/dev/ttyUSB0"), 1);
    assert_eq!(machine.open_count("/dev/ttyUSB1"), 1);
    assert!(old.connect().is_err());
}

#[test]
fn test_disconnect_closes_and_forgets_snapshots() {
    let (controller, _events, machine) = setup();
    controller.info();
    controller.disconnect();
    assert!(!controller.machine().is_connected());
    assert_eq!(machine.close_count("/dev/ttyUSB0"), 1);
    assert!(controller.manager().cache().info().is_none());

    // Reads report the closed session rather than reopening the port.
    let info = controller.info();
    assert!(!info.connection_status);
    assert_eq!(info.serial_number, None);
    assert!(!controller.status().connected);
    assert_eq!(machine.open_count("/dev/ttyUSB0"), 1);
    assert!(!controller.machine().is_connected());

    controller.connect(None, None).unwrap();
    assert!(controller.info().connection_status);
    assert_eq!(machine.open_count("/dev/ttyUSB0"), 2);
}

#[test]
fn test_dispenser_commands() {
    let (controller, _events, machine) = setup();
    controller.water(1).unwrap();
    controller.mat(2).unwrap();
    assert_eq!(
        machine.writes(),
        vec![(WATER_COMMAND.address, 1), (MAT_COMMAND.address, 2)]
    );
    assert!(matches!(
        controller.water(3),
        Err(MachineError::InvalidArgument { .. })
    ));
}

#[test]
fn test_link_loss_is_recovered_on_next_call() {
    let (controller, _events, machine) = setup();
    assert!(controller.info().connection_status);

    machine.set_fail_io(true);
    let err = controller.purge(1).unwrap_err();
    assert!(err.is_connection_issue());
    assert!(!controller.machine().is_connected());

    machine.set_fail_io(false);
    controller.purge(1).unwrap();
    assert!(controller.machine().is_connected());
    assert_eq!(machine.open_count("/dev/ttyUSB0"), 2);
}
