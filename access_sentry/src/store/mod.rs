//! Persistence seams: the registry of people and vehicles, and the two
//! append only audit collections.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{AccessEvent, NotificationEvent};
use crate::face::UNKNOWN;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("duplicate roll number {0}")]
    DuplicateRollNo(String),
    #[error("{0:?} is reserved for unmatched faces")]
    ReservedName(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Bike,
    Car,
    #[default]
    Other,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Bike => "bike",
            VehicleType::Car => "car",
            VehicleType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "bike" => VehicleType::Bike,
            "car" => VehicleType::Car,
            _ => VehicleType::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredVehicle {
    pub plate_number: String,
    pub vehicle_type: VehicleType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceImage {
    pub name: String,
    /// Encoded image file (JPEG, PNG, ...).
    pub data: Vec<u8>,
}

/// A registered person as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredIdentity {
    pub name: String,
    pub roll_no: String,
    pub branch: String,
    pub images: Vec<ReferenceImage>,
    pub vehicle: Option<StoredVehicle>,
}

/// Unmatched faces are reported under `face::UNKNOWN`, so nobody can be
/// registered with that name.
pub fn check_registrable(identity: &StoredIdentity) -> StoreResult<()> {
    if identity.name.trim().eq_ignore_ascii_case(UNKNOWN) {
        return Err(StoreError::ReservedName(identity.name.clone()));
    }
    Ok(())
}

pub trait RegistryStore: Send + Sync {
    fn identities(&self) -> StoreResult<Vec<StoredIdentity>>;
    fn register(&self, identity: &StoredIdentity) -> StoreResult<()>;
}

/// Query over an audit collection. Results are time descending.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Only authenticated (or only rejected) access events.
    pub authenticated: Option<bool>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn matches_time(&self, timestamp: DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| timestamp >= since)
            && self.until.map_or(true, |until| timestamp <= until)
    }
}

pub trait EventStore: Send + Sync {
    fn insert_access(&self, event: &AccessEvent) -> StoreResult<()>;
    fn insert_notification(&self, event: &NotificationEvent) -> StoreResult<()>;
    fn access_events(&self, filter: &EventFilter) -> StoreResult<Vec<AccessEvent>>;
    /// `authenticated` is ignored, notifications are unauthorized by nature.
    fn notifications(&self, filter: &EventFilter) -> StoreResult<Vec<NotificationEvent>>;
}
