//! Serializable snapshots produced by the driver's aggregations.
//!
//! Fields read from the machine are `Option`: `None` means the read failed
//! and the value is unknown, never "zero" or "false".

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::protocol::decode::{GroupSelection, MachineConfig};

pub fn group_key(group: u8) -> String {
    format!("group_{group}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineInfo {
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub number_of_groups: Option<u8>,
    pub is_blocked: Option<bool>,
    pub machine_config: Option<MachineConfig>,
    pub connection_status: bool,
    pub port: String,
    pub baudrate: u32,
    pub last_updated: DateTime<Local>,
}

impl MachineInfo {
    /// Shape returned while the driver holds no session.
    pub fn not_connected(port: &str, baudrate: u32) -> Self {
        Self {
            serial_number: None,
            firmware_version: None,
            number_of_groups: None,
            is_blocked: None,
            machine_config: None,
            connection_status: false,
            port: port.to_string(),
            baudrate,
            last_updated: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub selection: Option<GroupSelection>,
    pub sensor_fault: Option<bool>,
    pub purge_countdown: Option<u16>,
    pub is_busy: Option<bool>,
    pub current_action: Option<String>,
}

impl GroupStatus {
    pub fn from_reads(
        selection: Option<GroupSelection>,
        sensor_fault: Option<bool>,
        purge_countdown: Option<u16>,
    ) -> Self {
        Self {
            is_busy: selection.map(|s| s.is_busy()),
            current_action: selection.map(|s| s.current_action()),
            selection,
            sensor_fault,
            purge_countdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStatus {
    pub connected: bool,
    pub groups: BTreeMap<String, GroupStatus>,
    pub machine_blocked: Option<bool>,
    pub machine_config: Option<MachineConfig>,
    pub last_updated: DateTime<Local>,
}

impl MachineStatus {
    pub fn not_connected() -> Self {
        Self {
            connected: false,
            groups: BTreeMap::new(),
            machine_blocked: None,
            machine_config: None,
            last_updated: Local::now(),
        }
    }

    pub fn group(&self, group: u8) -> Option<&GroupStatus> {
        self.groups.get(&group_key(group))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupHealth {
    pub busy: Option<bool>,
    pub sensor_fault: Option<bool>,
    pub purge_countdown: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub connection: bool,
    pub machine_blocked: Option<bool>,
    pub groups_status: BTreeMap<String, GroupHealth>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub overall_status: OverallStatus,
    pub timestamp: DateTime<Local>,
}

impl HealthReport {
    /// Derive the overall status: healthy iff connected and no errors.
    pub fn finish(mut self) -> Self {
        self.overall_status = if self.connection && self.errors.is_empty() {
            OverallStatus::Healthy
        } else {
            OverallStatus::Unhealthy
        };
        self
    }

    pub fn not_connected(error: impl Into<String>) -> Self {
        Self {
            connection: false,
            machine_blocked: None,
            groups_status: BTreeMap::new(),
            errors: vec![error.into()],
            warnings: Vec::new(),
            overall_status: OverallStatus::Unhealthy,
            timestamp: Local::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_status == OverallStatus::Healthy
    }

    /// Groups reporting a sensor fault, in group order.
    pub fn faulted_groups(&self) -> Vec<u8> {
        self.groups_status
            .iter()
            .filter(|(_, g)| g.sensor_fault == Some(true))
            .filter_map(|(key, _)| key.strip_prefix("group_")?.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(connection: bool, errors: Vec<String>) -> HealthReport {
        HealthReport {
            connection,
            machine_blocked: Some(false),
            groups_status: BTreeMap::new(),
            errors,
            warnings: vec!["Group 1 automatic purge in 20s".into()],
            overall_status: OverallStatus::Unhealthy,
            timestamp: Local::now(),
        }
        .finish()
    }

    #[test]
    fn test_overall_status() {
        assert!(report(true, vec![]).is_healthy());
        assert!(!report(false, vec![]).is_healthy());
        assert!(!report(true, vec!["Machine is blocked".into()]).is_healthy());
    }

    #[test]
    fn test_faulted_groups() {
        let mut health = report(true, vec![]);
        for (group, fault) in [(1, Some(false)), (2, Some(true)), (3, None)] {
            health.groups_status.insert(
                group_key(group),
                GroupHealth {
                    busy: Some(false),
                    sensor_fault: fault,
                    purge_countdown: Some(100),
                },
            );
        }
        assert_eq!(health.faulted_groups(), vec![2]);
    }

    #[test]
    fn test_unknown_selection_leaves_busy_unknown() {
        let status = GroupStatus::from_reads(None, Some(false), Some(50));
        assert_eq!(status.is_busy, None);
        assert_eq!(status.current_action, None);

        let status = GroupStatus::from_reads(Some(GroupSelection::decode(0x80)), None, None);
        assert_eq!(status.is_busy, Some(true));
        assert_eq!(status.current_action.as_deref(), Some("Purging"));
    }
}
