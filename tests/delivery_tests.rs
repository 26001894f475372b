use std::sync::Arc;

use brewctl::{
    config::ControllerConfig,
    controller::Controller,
    driver::clock::ManualClock,
    error::MachineError,
    events::{MachineEvent, MaintenanceKind},
    orchestrator::DeliveryStatus,
    protocol::registers::{CoffeeType, Command, GroupRegister},
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

fn delivery_statuses(events: &flume::Receiver<MachineEvent>, id: u64) -> Vec<DeliveryStatus> {
    events
        .try_iter()
        .filter_map(|event| match event {
            MachineEvent::Delivery(record) if record.id == id => Some(record.status),
            _ => None,
        })
        .collect()
}

#[test]
fn test_delivery_completes_when_group_frees() {
    let (controller, events, machine) = setup();

    let attempt = controller.deliver(1, CoffeeType::DoubleMedium);
    let receipt = attempt.result.unwrap();
    assert_eq!(
        receipt.message,
        "Coffee delivery started: Double Medium on group 1"
    );
    let record = attempt.record.unwrap();
    assert_eq!(record.status, DeliveryStatus::InProgress);

    let command_address = GroupRegister::Command.address(1).unwrap();
    assert!(machine
        .writes()
        .contains(&(command_address, Command::DoubleMedium.bits())));

    let resolved = controller.track_delivery(record.id).unwrap();
    assert_eq!(resolved.status, DeliveryStatus::Completed);
    assert!(resolved.completed_at.is_some());
    assert_eq!(controller.orchestrator().active_delivery(1), None);

    assert_eq!(
        delivery_statuses(&events, record.id),
        vec![
            DeliveryStatus::Pending,
            DeliveryStatus::InProgress,
            DeliveryStatus::Completed
        ]
    );
}

#[test]
fn test_second_request_on_busy_group_is_rejected() {
    let (controller, _events, machine) = setup();
    machine.set_hold_busy(true);

    let first = controller.deliver(2, CoffeeType::SingleShort);
    assert!(first.result.is_ok());

    let second = controller.deliver(2, CoffeeType::SingleLong);
    assert!(matches!(
        second.result,
        Err(MachineError::GroupBusy { group: 2 })
    ));
    let rejected = second.record.unwrap();
    assert_eq!(rejected.status, DeliveryStatus::Failed);
    assert_eq!(
        rejected.error_message.as_deref(),
        Some("Group 2 is currently busy")
    );

    // Other groups are independent.
    assert!(controller.deliver(3, CoffeeType::SingleShort).result.is_ok());
    assert_eq!(
        controller.orchestrator().active_delivery(2),
        first.record.map(|r| r.id)
    );
}

#[test]
fn test_concurrent_requests_dispatch_once() {
    let (controller, _events, machine) = setup();
    machine.set_hold_busy(true);
    let controller = Arc::new(controller);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let controller = controller.clone();
            std::thread::spawn(move || controller.deliver(1, CoffeeType::DoubleShort))
        })
        .collect();
    let accepted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|attempt| attempt.result.is_ok())
        .count();
    assert_eq!(accepted, 1);

    let command_address = GroupRegister::Command.address(1).unwrap();
    let commands = machine
        .writes()
        .iter()
        .filter(|(address, _)| *address == command_address)
        .count();
    assert_eq!(commands, 1);
}

#[test]
fn test_delivery_times_out_on_stuck_group() {
    let (controller, events, machine) = setup();
    machine.set_hold_busy(true);

    let record = controller
        .deliver(1, CoffeeType::SingleMedium)
        .record
        .unwrap();
    let resolved = controller.track_delivery(record.id).unwrap();
    assert_eq!(resolved.status, DeliveryStatus::Failed);
    assert_eq!(
        resolved.error_message.as_deref(),
        Some("Timeout waiting for group 1 to become free after 120000ms")
    );
    assert_eq!(controller.orchestrator().active_delivery(1), None);
    assert_eq!(
        delivery_statuses(&events, record.id).last(),
        Some(&DeliveryStatus::Failed)
    );
}

#[test]
fn test_stop_resolves_delivery_as_stopped() {
    let (controller, events, machine) = setup();
    machine.set_hold_busy(true);

    let record = controller.deliver(1, CoffeeType::DoubleLong).record.unwrap();
    let stopped = controller.stop(1).unwrap().unwrap();
    assert_eq!(stopped.id, record.id);
    assert_eq!(stopped.status, DeliveryStatus::Stopped);
    assert_eq!(stopped.error_message.as_deref(), Some("Stopped manually"));

    // Tracking a stopped delivery leaves it stopped.
    let tracked = controller.track_delivery(record.id).unwrap();
    assert_eq!(tracked.status, DeliveryStatus::Stopped);

    let command_address = GroupRegister::Command.address(1).unwrap();
    assert_eq!(
        machine.writes().last(),
        Some(&(command_address, Command::StopDelivery.bits()))
    );

    let manual_stops = events
        .try_iter()
        .filter(|event| {
            matches!(event, MachineEvent::Maintenance(entry)
                if entry.kind == MaintenanceKind::ManualStop && entry.group_number == Some(1))
        })
        .count();
    assert_eq!(manual_stops, 1);
}

#[test]
fn test_stop_on_idle_group_still_sends_command() {
    let (controller, _events, machine) = setup();
    assert_eq!(controller.stop(2).unwrap(), None);
    let command_address = GroupRegister::Command.address(2).unwrap();
    assert_eq!(
        machine.writes(),
        vec![(command_address, Command::StopDelivery.bits())]
    );
}

#[test]
fn test_near_purge_rejection_is_recorded() {
    let (controller, _events, machine) = setup();
    machine.set_purge_countdown(1, 5);

    let attempt = controller.deliver(1, CoffeeType::SingleShort);
    assert!(matches!(
        attempt.result,
        Err(MachineError::NearPurge {
            group: 1,
            countdown: 5
        })
    ));
    assert_eq!(attempt.record.unwrap().status, DeliveryStatus::Failed);
    assert_eq!(controller.orchestrator().active_delivery(1), None);
    assert!(machine.writes().is_empty());
}

#[test]
fn test_invalid_group_never_reaches_ledger() {
    let (controller, _events, machine) = setup();
    let attempt = controller.deliver(5, CoffeeType::SingleShort);
    assert!(attempt.record.is_none());
    assert!(matches!(
        attempt.result,
        Err(MachineError::InvalidArgument { .. })
    ));
    assert!(controller.deliveries(10).is_empty());
    assert_eq!(machine.read_count(), 0);
}

#[test]
fn test_history_is_newest_first() {
    let (controller, _events, _machine) = setup();
    let ids: Vec<u64> = [1, 2, 3]
        .into_iter()
        .filter_map(|g| controller.deliver(g, CoffeeType::SingleShort).record)
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let history = controller.deliveries(2);
    assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2]);
    assert_eq!(controller.delivery(1).map(|r| r.group_number), Some(1));
    assert!(controller.delivery(99).is_none());
}

#[test]
fn test_purge_emits_maintenance_entry() {
    let (controller, events, machine) = setup();
    controller.purge(3).unwrap();

    let command_address = GroupRegister::Command.address(3).unwrap();
    assert_eq!(
        machine.writes(),
        vec![(command_address, Command::StartPurge.bits())]
    );
    let purge = events.try_iter().find_map(|event| match event {
        MachineEvent::Maintenance(entry) if entry.kind == MaintenanceKind::Purge => Some(entry),
        _ => None,
    });
    assert_eq!(purge.and_then(|e| e.group_number), Some(3));
}
