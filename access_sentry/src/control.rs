//! Operator facing views: control responses, recent logs and CSV export.

use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use crate::events::{AccessEvent, NotificationEvent};
use crate::orchestrator::ControlStatus;
use crate::store::{EventFilter, EventStore, RegistryStore, StoredIdentity};

pub const RECENT_ACCESS_EVENTS: usize = 10;
pub const RECENT_NOTIFICATIONS: usize = 5;

pub const CSV_HEADER: &str = "Name,Roll,Plate,Status,Time";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControlResponse {
    /// "success" when the request changed the pipeline state, "info" when it
    /// was already in the requested state.
    pub status: &'static str,
    pub message: &'static str,
}

impl From<ControlStatus> for ControlResponse {
    fn from(status: ControlStatus) -> Self {
        Self {
            status: if status.changed_state() { "success" } else { "info" },
            message: status.message(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RecentEvents {
    pub detection_logs: Vec<AccessEvent>,
    pub notification_logs: Vec<NotificationEvent>,
}

/// Latest events of both kinds, newest first.
pub fn recent_events(
    store: &dyn EventStore,
    access: usize,
    notifications: usize,
) -> Result<RecentEvents> {
    Ok(RecentEvents {
        detection_logs: store.access_events(&EventFilter::latest(access))?,
        notification_logs: store.notifications(&EventFilter::latest(notifications))?,
    })
}

/// A registered person without their reference images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub name: String,
    pub roll_no: String,
    pub branch: String,
    pub plate_number: Option<String>,
    pub vehicle_type: Option<&'static str>,
    pub images: usize,
}

impl From<&StoredIdentity> for UserSummary {
    fn from(identity: &StoredIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            roll_no: identity.roll_no.clone(),
            branch: identity.branch.clone(),
            plate_number: identity.vehicle.as_ref().map(|v| v.plate_number.clone()),
            vehicle_type: identity.vehicle.as_ref().map(|v| v.vehicle_type.as_str()),
            images: identity.images.len(),
        }
    }
}

/// Everyone in the registry, in registration order.
pub fn list_users(store: &dyn RegistryStore) -> Result<Vec<UserSummary>> {
    Ok(store.identities()?.iter().map(UserSummary::from).collect())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One row per access event, missing values as "N/A".
pub fn export_csv<W: Write>(events: &[AccessEvent], mut writer: W) -> Result<usize> {
    writeln!(writer, "{CSV_HEADER}")?;
    for event in events {
        let status = if event.authenticated {
            "authorized"
        } else {
            "unauthorized"
        };
        let time = event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        let row = [
            event.name.as_deref().unwrap_or("N/A"),
            event.roll_no.as_deref().unwrap_or("N/A"),
            event.plate_number.as_deref().unwrap_or("N/A"),
            status,
            time.as_str(),
        ]
        .map(csv_field);
        writeln!(writer, "{}", row.join(","))?;
    }
    writer.flush()?;
    Ok(events.len())
}
