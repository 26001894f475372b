//! Outbound events for whoever persists delivery and maintenance history.
//!
//! The controller never stores these itself beyond the in-memory delivery
//! ledger; a consumer drains the receiver returned by [`channel`] and writes
//! them wherever it likes.
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::orchestrator::DeliveryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MaintenanceKind {
    Purge,
    ManualStop,
    HealthCheck,
    SensorFault,
    ConnectionIssue,
}

/// A maintenance log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceEntry {
    pub kind: MaintenanceKind,
    pub group_number: Option<u8>,
    pub description: String,
    pub timestamp: DateTime<Local>,
}

impl MaintenanceEntry {
    pub fn new(kind: MaintenanceKind, group_number: Option<u8>, description: String) -> Self {
        Self {
            kind,
            group_number,
            description,
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MachineEvent {
    /// A delivery record changed state
    Delivery(DeliveryRecord),
    Maintenance(MaintenanceEntry),
}

#[derive(Debug, Clone)]
pub struct EventSink {
    sender: flume::Sender<MachineEvent>,
}

impl EventSink {
    pub fn emit(&self, event: MachineEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("event receiver dropped, discarding event");
        }
    }

    pub fn maintenance(&self, kind: MaintenanceKind, group_number: Option<u8>, description: String) {
        log::info!("maintenance {kind}: {description}");
        self.emit(MachineEvent::Maintenance(MaintenanceEntry::new(
            kind,
            group_number,
            description,
        )));
    }
}

/// Create a sink and the receiving end consumers drain.
pub fn channel() -> (EventSink, flume::Receiver<MachineEvent>) {
    let (sender, receiver) = flume::unbounded();
    (EventSink { sender }, receiver)
}
