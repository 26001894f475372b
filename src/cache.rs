//! Short-lived cache of the driver's aggregated snapshots.

use parking_lot::RwLock;
use strum::IntoEnumIterator;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    config::CacheSettings,
    driver::{
        clock::Clock,
        snapshot::{HealthReport, MachineInfo, MachineStatus},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum SnapshotKind {
    Info,
    Status,
    Health,
    Connected,
}

#[derive(Debug, Clone)]
enum Snapshot {
    Info(MachineInfo),
    Status(MachineStatus),
    Health(HealthReport),
    Connected(bool),
}

#[derive(Debug)]
struct Entry {
    value: Snapshot,
    expires_at: Instant,
}

/// Generation of a snapshot kind taken before the reads that produce it.
/// A snapshot stored with a stale ticket is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    kind: SnapshotKind,
    generation: u64,
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<SnapshotKind, Entry>,
    generations: HashMap<SnapshotKind, u64>,
}

impl Entries {
    fn generation(&self, kind: SnapshotKind) -> u64 {
        self.generations.get(&kind).copied().unwrap_or(0)
    }

    fn bump(&mut self, kind: SnapshotKind) {
        *self.generations.entry(kind).or_default() += 1;
    }
}

pub struct StatusCache {
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    entries: RwLock<Entries>,
}

impl StatusCache {
    pub fn new(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            entries: RwLock::new(Entries::default()),
        }
    }

    fn ttl(&self, value: &Snapshot) -> Duration {
        let secs = match value {
            Snapshot::Info(_) => self.settings.info_ttl_secs,
            Snapshot::Status(_) => self.settings.status_ttl_secs,
            Snapshot::Health(_) => self.settings.health_ttl_secs,
            Snapshot::Connected(true) => self.settings.connected_ttl_secs,
            Snapshot::Connected(false) => self.settings.disconnected_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    fn put(&self, kind: SnapshotKind, value: Snapshot) {
        let expires_at = self.clock.now() + self.ttl(&value);
        self.entries
            .write()
            .values
            .insert(kind, Entry { value, expires_at });
    }

    /// Store `value` unless `kind` was invalidated since `ticket` was taken.
    fn put_checked(&self, ticket: CacheTicket, value: Snapshot) -> bool {
        let expires_at = self.clock.now() + self.ttl(&value);
        let mut entries = self.entries.write();
        if entries.generation(ticket.kind) != ticket.generation {
            log::debug!("discarding stale {} snapshot", ticket.kind);
            return false;
        }
        entries
            .values
            .insert(ticket.kind, Entry { value, expires_at });
        true
    }

    fn get(&self, kind: SnapshotKind) -> Option<Snapshot> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.values.get(&kind) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut entries = self.entries.write();
        // A fresh put may have landed between the two locks.
        if entries
            .values
            .get(&kind)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            log::debug!("cache entry {kind} expired");
            entries.values.remove(&kind);
            return None;
        }
        entries.values.get(&kind).map(|entry| entry.value.clone())
    }

    /// Take a ticket for `kind` before reading the machine.
    pub fn ticket(&self, kind: SnapshotKind) -> CacheTicket {
        CacheTicket {
            kind,
            generation: self.entries.read().generation(kind),
        }
    }

    pub fn put_info(&self, info: MachineInfo) {
        self.put(SnapshotKind::Info, Snapshot::Info(info));
    }

    pub fn put_info_checked(&self, ticket: CacheTicket, info: MachineInfo) -> bool {
        self.put_checked(ticket, Snapshot::Info(info))
    }

    pub fn info(&self) -> Option<MachineInfo> {
        match self.get(SnapshotKind::Info)? {
            Snapshot::Info(info) => Some(info),
            _ => None,
        }
    }

    pub fn put_status(&self, status: MachineStatus) {
        self.put(SnapshotKind::Status, Snapshot::Status(status));
    }

    pub fn put_status_checked(&self, ticket: CacheTicket, status: MachineStatus) -> bool {
        self.put_checked(ticket, Snapshot::Status(status))
    }

    pub fn status(&self) -> Option<MachineStatus> {
        match self.get(SnapshotKind::Status)? {
            Snapshot::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn put_health(&self, health: HealthReport) {
        self.put(SnapshotKind::Health, Snapshot::Health(health));
    }

    pub fn put_health_checked(&self, ticket: CacheTicket, health: HealthReport) -> bool {
        self.put_checked(ticket, Snapshot::Health(health))
    }

    pub fn health(&self) -> Option<HealthReport> {
        match self.get(SnapshotKind::Health)? {
            Snapshot::Health(health) => Some(health),
            _ => None,
        }
    }

    pub fn put_connected(&self, connected: bool) {
        self.put(SnapshotKind::Connected, Snapshot::Connected(connected));
    }

    pub fn connected(&self) -> Option<bool> {
        match self.get(SnapshotKind::Connected)? {
            Snapshot::Connected(connected) => Some(connected),
            _ => None,
        }
    }

    pub fn invalidate(&self, kind: SnapshotKind) {
        let mut entries = self.entries.write();
        entries.values.remove(&kind);
        entries.bump(kind);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.values.clear();
        for kind in SnapshotKind::iter() {
            entries.bump(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::clock::ManualClock;
    use parking_lot::RwLockUpgradableReadGuard;

    fn cache() -> (StatusCache, ManualClock) {
        let clock = ManualClock::new();
        let cache = StatusCache::new(CacheSettings::default(), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_status_expires_after_ttl() {
        let (cache, clock) = cache();
        cache.put_status(MachineStatus::not_connected());
        clock.advance(Duration::from_secs(29));
        assert!(cache.status().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.status().is_none());
    }

    #[test]
    fn test_connected_ttl_depends_on_value() {
        let (cache, clock) = cache();
        cache.put_connected(false);
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.connected(), None);

        cache.put_connected(true);
        clock.advance(Duration::from_secs(299));
        assert_eq!(cache.connected(), Some(true));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (cache, _clock) = cache();
        cache.put_status(MachineStatus::not_connected());
        cache.put_info(MachineInfo::not_connected("sim0", 9600));
        cache.invalidate(SnapshotKind::Status);
        assert!(cache.status().is_none());
        assert!(cache.info().is_some());
        cache.clear();
        assert!(cache.info().is_none());
    }

    #[test]
    fn test_snapshot_read_before_invalidation_is_dropped() {
        let (cache, _clock) = cache();
        let ticket = cache.ticket(SnapshotKind::Status);
        cache.invalidate(SnapshotKind::Status);
        assert!(!cache.put_status_checked(ticket, MachineStatus::not_connected()));
        assert!(cache.status().is_none());

        let ticket = cache.ticket(SnapshotKind::Health);
        cache.clear();
        assert!(!cache.put_health_checked(ticket, HealthReport::not_connected("down")));
        assert!(cache.health().is_none());

        // Other kinds keep their own generation.
        let ticket = cache.ticket(SnapshotKind::Info);
        cache.invalidate(SnapshotKind::Status);
        assert!(cache.put_info_checked(ticket, MachineInfo::not_connected("sim0", 9600)));
        assert!(cache.info().is_some());
    }

    #[test]
    fn test_expired_lookup_keeps_fresh_entry() {
        let clock = ManualClock::new();
        let cache = Arc::new(StatusCache::new(
            CacheSettings::default(),
            Arc::new(clock.clone()),
        ));
        cache.put_status(MachineStatus::not_connected());
        clock.advance(Duration::from_secs(31));

        // Writers wait while this guard is held; readers do not.
        let guard = cache.entries.upgradable_read();
        let reader = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.status())
        };
        std::thread::sleep(Duration::from_millis(50));
        let mut entries = RwLockUpgradableReadGuard::upgrade(guard);
        entries.values.insert(
            SnapshotKind::Status,
            Entry {
                value: Snapshot::Status(MachineStatus::not_connected()),
                expires_at: clock.now() + Duration::from_secs(30),
            },
        );
        drop(entries);

        assert!(reader.join().unwrap().is_some());
        assert!(cache.status().is_some());
    }
}
