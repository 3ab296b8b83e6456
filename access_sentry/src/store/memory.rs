use std::sync::{Mutex, MutexGuard};

use super::{
    check_registrable, EventFilter, EventStore, RegistryStore, StoreError, StoreResult,
    StoredIdentity,
};
use crate::events::{AccessEvent, NotificationEvent};

/// Process local store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    identities: Mutex<Vec<StoredIdentity>>,
    access: Mutex<Vec<AccessEvent>>,
    notifications: Mutex<Vec<NotificationEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| StoreError::Poisoned)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Vec<StoredIdentity>) -> Self {
        Self {
            identities: Mutex::new(identities),
            ..Default::default()
        }
    }
}

fn latest_first<T: Clone>(
    events: &[T],
    filter: &EventFilter,
    timestamp: impl Fn(&T) -> chrono::DateTime<chrono::Utc>,
    keep: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut selected: Vec<T> = events
        .iter()
        .filter(|&e| filter.matches_time(timestamp(e)) && keep(e))
        .cloned()
        .collect();
    // Stable sort keeps insertion order reversed for equal timestamps.
    selected.reverse();
    selected.sort_by(|a, b| timestamp(b).cmp(&timestamp(a)));
    if let Some(limit) = filter.limit {
        selected.truncate(limit);
    }
    selected
}

impl RegistryStore for MemoryStore {
    fn identities(&self) -> StoreResult<Vec<StoredIdentity>> {
        Ok(lock(&self.identities)?.clone())
    }

    fn register(&self, identity: &StoredIdentity) -> StoreResult<()> {
        check_registrable(identity)?;
        let mut identities = lock(&self.identities)?;
        if identities.iter().any(|i| i.roll_no == identity.roll_no) {
            return Err(StoreError::DuplicateRollNo(identity.roll_no.clone()));
        }
        identities.push(identity.clone());
        Ok(())
    }
}

impl EventStore for MemoryStore {
    fn insert_access(&self, event: &AccessEvent) -> StoreResult<()> {
        lock(&self.access)?.push(event.clone());
        Ok(())
    }

    fn insert_notification(&self, event: &NotificationEvent) -> StoreResult<()> {
        lock(&self.notifications)?.push(event.clone());
        Ok(())
    }

    fn access_events(&self, filter: &EventFilter) -> StoreResult<Vec<AccessEvent>> {
        let events = lock(&self.access)?;
        Ok(latest_first(
            &events,
            filter,
            |e| e.timestamp,
            |e| filter.authenticated.map_or(true, |a| e.authenticated == a),
        ))
    }

    fn notifications(&self, filter: &EventFilter) -> StoreResult<Vec<NotificationEvent>> {
        let events = lock(&self.notifications)?;
        Ok(latest_first(&events, filter, |e| e.timestamp, |_| true))
    }
}
