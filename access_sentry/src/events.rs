//! Audit records written by the pipeline.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatus {
    Authorized,
    Unauthorized,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Authorized => "authorized",
            AccessStatus::Unauthorized => "unauthorized",
        }
    }
}

/// Evidence JPEG, base64 encoded when serialized.
fn as_base64<S: Serializer>(image: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match image {
        Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEvent {
    pub timestamp: DateTime<Utc>,
    pub person_detected: bool,
    pub plate_detected: bool,
    pub name: Option<String>,
    pub roll_no: Option<String>,
    pub plate_number: Option<String>,
    pub confidence: Option<f32>,
    #[serde(serialize_with = "as_base64")]
    pub image: Option<Vec<u8>>,
    pub objects_detected: Vec<String>,
    pub authenticated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationReason {
    #[serde(rename = "Unknown Person")]
    UnknownPerson,
    #[serde(rename = "Unauthorized Vehicle")]
    UnauthorizedVehicle,
    #[serde(rename = "Unknown Face")]
    UnknownFace,
}

impl NotificationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationReason::UnknownPerson => "Unknown Person",
            NotificationReason::UnauthorizedVehicle => "Unauthorized Vehicle",
            NotificationReason::UnknownFace => "Unknown Face",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Unknown Person" => Some(NotificationReason::UnknownPerson),
            "Unauthorized Vehicle" => Some(NotificationReason::UnauthorizedVehicle),
            "Unknown Face" => Some(NotificationReason::UnknownFace),
            _ => None,
        }
    }

    /// Reason of an unauthorized attempt, by priority: nobody identified at
    /// all, then an identified plate, then an unmatched face.
    pub fn derive(name: Option<&str>, plate: Option<&str>) -> Self {
        match (name, plate) {
            (None, None) => NotificationReason::UnknownPerson,
            (None, Some(_)) => NotificationReason::UnauthorizedVehicle,
            (Some(_), _) => NotificationReason::UnknownFace,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NotificationDetails {
    pub face: bool,
    pub plate: bool,
    pub matched: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: NotificationReason,
    #[serde(serialize_with = "as_base64")]
    pub image: Option<Vec<u8>>,
    pub details: NotificationDetails,
}
