//! Delivery lifecycle on top of the driver.
//!
//! Every accepted coffee request gets a [`DeliveryRecord`] that moves
//! `pending -> in_progress -> completed | failed | stopped`. A group carries
//! at most one unresolved delivery; a second request for the same group is
//! rejected while the first one is in flight.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    driver::{clock::CancelHandle, DeliveryReceipt, WaitOutcome},
    error::MachineError,
    events::{EventSink, MachineEvent, MaintenanceKind},
    manager::MachineManager,
    protocol::registers::{validate_group, CoffeeType},
};

const LEDGER_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Stopped,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Completed | DeliveryStatus::Failed | DeliveryStatus::Stopped
        )
    }

    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Completed | Failed | Stopped)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    pub id: u64,
    pub coffee_type: CoffeeType,
    pub group_number: u8,
    pub status: DeliveryStatus,
    pub started_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub error_message: Option<String>,
}

/// Result of asking for a delivery. `record` is `None` only when the request
/// was malformed and never reached the ledger.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub record: Option<DeliveryRecord>,
    pub result: Result<DeliveryReceipt, MachineError>,
}

struct Claim {
    delivery_id: u64,
    cancel: CancelHandle,
}

#[derive(Default)]
struct Ledger {
    records: VecDeque<DeliveryRecord>,
}

impl Ledger {
    fn push(&mut self, record: DeliveryRecord) {
        if self.records.len() == LEDGER_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn get(&self, id: u64) -> Option<&DeliveryRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn transition(
        &mut self,
        id: u64,
        next: DeliveryStatus,
        error_message: Option<String>,
    ) -> Option<DeliveryRecord> {
        let record = self.records.iter_mut().find(|r| r.id == id)?;
        if !record.status.can_transition_to(next) {
            log::debug!(
                "delivery {id}: ignoring {} -> {next}",
                record.status
            );
            return None;
        }
        record.status = next;
        if next.is_terminal() {
            record.completed_at = Some(Local::now());
        }
        if error_message.is_some() {
            record.error_message = error_message;
        }
        Some(record.clone())
    }
}

pub struct Orchestrator {
    manager: Arc<MachineManager>,
    events: EventSink,
    ledger: Mutex<Ledger>,
    claims: Mutex<HashMap<u8, Claim>>,
    next_id: AtomicU64,
    delivery_timeout: Duration,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<MachineManager>,
        events: EventSink,
        delivery_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            events,
            ledger: Mutex::new(Ledger::default()),
            claims: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            delivery_timeout,
            poll_interval,
        }
    }

    fn transition(
        &self,
        id: u64,
        next: DeliveryStatus,
        error_message: Option<String>,
    ) -> Option<DeliveryRecord> {
        let updated = self.ledger.lock().transition(id, next, error_message);
        if let Some(record) = &updated {
            self.events.emit(MachineEvent::Delivery(record.clone()));
        }
        updated
    }

    fn release(&self, group: u8, delivery_id: u64) {
        let mut claims = self.claims.lock();
        if claims.get(&group).is_some_and(|c| c.delivery_id == delivery_id) {
            claims.remove(&group);
        }
    }

    /// Validate, record and dispatch a delivery. Completion is resolved
    /// separately by [`Orchestrator::track_completion`].
    pub fn request_delivery(&self, group: u8, coffee_type: CoffeeType) -> DeliveryAttempt {
        if let Err(err) = validate_group(group) {
            return DeliveryAttempt {
                record: None,
                result: Err(err),
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = DeliveryRecord {
            id,
            coffee_type,
            group_number: group,
            status: DeliveryStatus::Pending,
            started_at: Local::now(),
            completed_at: None,
            error_message: None,
        };
        self.ledger.lock().push(record.clone());
        self.events.emit(MachineEvent::Delivery(record));

        let claimed = {
            let mut claims = self.claims.lock();
            if claims.contains_key(&group) {
                false
            } else {
                claims.insert(
                    group,
                    Claim {
                        delivery_id: id,
                        cancel: CancelHandle::new(),
                    },
                );
                true
            }
        };
        if !claimed {
            let err = MachineError::GroupBusy { group };
            let record = self.transition(id, DeliveryStatus::Failed, Some(err.to_string()));
            return DeliveryAttempt {
                record,
                result: Err(err),
            };
        }

        let machine = self.manager.get();
        match machine.deliver_coffee(group, coffee_type) {
            Ok(receipt) => {
                let record = self.transition(id, DeliveryStatus::InProgress, None);
                log::info!("delivery {id}: {}", receipt.message);
                DeliveryAttempt {
                    record,
                    result: Ok(receipt),
                }
            }
            Err(err) => {
                self.release(group, id);
                log::warn!("delivery {id} refused: {err}");
                let record = self.transition(id, DeliveryStatus::Failed, Some(err.to_string()));
                DeliveryAttempt {
                    record,
                    result: Err(err),
                }
            }
        }
    }

    /// Block until the delivery's group is free and resolve the record.
    /// A delivery stopped meanwhile stays `stopped`.
    pub fn track_completion(&self, id: u64) -> Option<DeliveryRecord> {
        let (group, status) = {
            let ledger = self.ledger.lock();
            let record = ledger.get(id)?;
            (record.group_number, record.status)
        };
        if status != DeliveryStatus::InProgress {
            return self.delivery(id);
        }
        let cancel = self
            .claims
            .lock()
            .get(&group)
            .filter(|c| c.delivery_id == id)
            .map(|c| c.cancel.clone())
            .unwrap_or_default();

        let machine = self.manager.get();
        let outcome = machine.wait_until_group_is_free(
            group,
            self.delivery_timeout,
            self.poll_interval,
            Some(&cancel),
        );
        match outcome {
            Ok(WaitOutcome::Free) => {
                self.transition(id, DeliveryStatus::Completed, None);
                log::info!("delivery {id} completed on group {group}");
            }
            Ok(WaitOutcome::TimedOut { waited, .. }) => {
                let err = MachineError::Timeout {
                    group,
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                };
                log::warn!("delivery {id}: {err}");
                self.transition(id, DeliveryStatus::Failed, Some(err.to_string()));
            }
            Ok(WaitOutcome::Cancelled) => {
                log::info!("delivery {id} tracking cancelled");
            }
            Err(err) => {
                self.transition(id, DeliveryStatus::Failed, Some(err.to_string()));
            }
        }
        self.release(group, id);
        self.delivery(id)
    }

    /// Request a delivery and block until it resolves.
    pub fn deliver_and_wait(&self, group: u8, coffee_type: CoffeeType) -> DeliveryAttempt {
        let attempt = self.request_delivery(group, coffee_type);
        let id = match (&attempt.result, &attempt.record) {
            (Ok(_), Some(record)) => record.id,
            _ => return attempt,
        };
        DeliveryAttempt {
            record: self.track_completion(id),
            result: attempt.result,
        }
    }

    /// Stop whatever the group is dispensing. An in-flight delivery on the
    /// group resolves to `stopped`.
    pub fn stop_delivery(&self, group: u8) -> Result<Option<DeliveryRecord>, MachineError> {
        validate_group(group)?;
        self.manager.get().stop_delivery(group)?;

        let claim = self.claims.lock().remove(&group);
        let stopped = claim.and_then(|claim| {
            claim.cancel.cancel();
            self.transition(
                claim.delivery_id,
                DeliveryStatus::Stopped,
                Some("Stopped manually".to_string()),
            )
        });
        self.events.maintenance(
            MaintenanceKind::ManualStop,
            Some(group),
            format!("Manual stop on group {group}"),
        );
        Ok(stopped)
    }

    pub fn start_purge(&self, group: u8) -> Result<(), MachineError> {
        validate_group(group)?;
        self.manager.get().start_purge(group)?;
        self.events.maintenance(
            MaintenanceKind::Purge,
            Some(group),
            format!("Purge started on group {group}"),
        );
        Ok(())
    }

    /// Most recent deliveries first.
    pub fn deliveries(&self, limit: usize) -> Vec<DeliveryRecord> {
        self.ledger
            .lock()
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn delivery(&self, id: u64) -> Option<DeliveryRecord> {
        self.ledger.lock().get(id).cloned()
    }

    /// Group currently holding an unresolved delivery, if any.
    pub fn active_delivery(&self, group: u8) -> Option<u64> {
        self.claims.lock().get(&group).map(|c| c.delivery_id)
    }
}
