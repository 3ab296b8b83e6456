use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::events::{
    AccessEvent, AccessStatus, NotificationDetails, NotificationEvent, NotificationReason,
};
use crate::face::UNKNOWN;
use crate::metrics;
use crate::store::EventStore;

/// Everything known about one evaluated subject.
#[derive(Clone, Debug, Default)]
pub struct AccessAttempt {
    /// Matched name, `"Unknown"` for an unmatched face, `None` when no face
    /// was involved.
    pub name: Option<String>,
    pub roll_no: Option<String>,
    pub confidence: Option<f32>,
    pub plate: Option<String>,
    pub evidence: Option<Vec<u8>>,
    pub objects_detected: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Logged {
    pub access: AccessEvent,
    pub notification: Option<NotificationEvent>,
}

/// Writes access events and, for unauthorized attempts, notifications.
/// Suppression of repeated subjects is the caller's business.
pub struct EventLogger {
    store: Arc<dyn EventStore>,
}

impl EventLogger {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn record(
        &self,
        attempt: AccessAttempt,
        status: AccessStatus,
        now: DateTime<Utc>,
    ) -> Result<Logged> {
        let access = access_event(&attempt, status, now);
        self.store.insert_access(&access)?;
        metrics::ACCESS_EVENTS
            .with_label_values(&[status.as_str()])
            .inc();

        let notification = match status {
            AccessStatus::Authorized => None,
            AccessStatus::Unauthorized => {
                let notification = notification_event(&attempt, now);
                self.store.insert_notification(&notification)?;
                metrics::NOTIFICATIONS
                    .with_label_values(&[notification.reason.as_str()])
                    .inc();
                Some(notification)
            }
        };

        info!(
            status = status.as_str(),
            subject = attempt
                .name
                .as_deref()
                .or(attempt.plate.as_deref())
                .unwrap_or(UNKNOWN),
            "logged access"
        );
        Ok(Logged {
            access,
            notification,
        })
    }
}

fn access_event(attempt: &AccessAttempt, status: AccessStatus, now: DateTime<Utc>) -> AccessEvent {
    let authenticated = status == AccessStatus::Authorized;
    AccessEvent {
        timestamp: now,
        person_detected: attempt.name.is_some(),
        plate_detected: attempt.plate.is_some(),
        name: attempt.name.clone().filter(|name| name != UNKNOWN),
        roll_no: attempt.roll_no.clone().filter(|_| authenticated),
        plate_number: attempt.plate.clone(),
        confidence: attempt.confidence,
        image: attempt.evidence.clone(),
        objects_detected: attempt.objects_detected.clone(),
        authenticated,
    }
}

fn notification_event(attempt: &AccessAttempt, now: DateTime<Utc>) -> NotificationEvent {
    NotificationEvent {
        timestamp: now,
        reason: NotificationReason::derive(attempt.name.as_deref(), attempt.plate.as_deref()),
        image: attempt.evidence.clone(),
        details: NotificationDetails {
            face: attempt.name.as_deref() == Some(UNKNOWN),
            plate: attempt.plate.is_some(),
            matched: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventFilter, MemoryStore};

    fn logger() -> (EventLogger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (EventLogger::new(store.clone()), store)
    }

    #[test]
    fn authorized_attempt_writes_only_an_access_event() {
        let (logger, store) = logger();
        let logged = logger
            .record(
                AccessAttempt {
                    name: Some("Asha".into()),
                    roll_no: Some("21CS01".into()),
                    confidence: Some(0.71),
                    ..Default::default()
                },
                AccessStatus::Authorized,
                Utc::now(),
            )
            .unwrap();
        assert!(logged.notification.is_none());
        assert!(logged.access.authenticated);
        assert_eq!(logged.access.roll_no.as_deref(), Some("21CS01"));
        assert_eq!(store.access_events(&EventFilter::default()).unwrap().len(), 1);
        assert!(store.notifications(&EventFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn unknown_face_is_stored_without_name() {
        let (logger, store) = logger();
        logger
            .record(
                AccessAttempt {
                    name: Some(UNKNOWN.into()),
                    confidence: Some(0.3),
                    ..Default::default()
                },
                AccessStatus::Unauthorized,
                Utc::now(),
            )
            .unwrap();
        let access = &store.access_events(&EventFilter::default()).unwrap()[0];
        assert!(access.person_detected);
        assert_eq!(access.name, None);
        let notification = &store.notifications(&EventFilter::default()).unwrap()[0];
        assert_eq!(notification.reason, NotificationReason::UnknownFace);
        assert!(notification.details.face);
        assert!(!notification.details.plate);
    }

    #[test]
    fn unauthorized_reasons_follow_priority() {
        let cases = [
            (None, None, NotificationReason::UnknownPerson),
            (None, Some("ABC123"), NotificationReason::UnauthorizedVehicle),
            (Some("X"), None, NotificationReason::UnknownFace),
        ];
        for (name, plate, expected) in cases {
            let (logger, _) = logger();
            let logged = logger
                .record(
                    AccessAttempt {
                        name: name.map(String::from),
                        plate: plate.map(String::from),
                        ..Default::default()
                    },
                    AccessStatus::Unauthorized,
                    Utc::now(),
                )
                .unwrap();
            assert_eq!(logged.notification.unwrap().reason, expected);
            assert!(!logged.access.authenticated);
        }
    }

    #[test]
    fn roll_number_is_dropped_for_rejected_attempts() {
        let (logger, _) = logger();
        let logged = logger
            .record(
                AccessAttempt {
                    name: Some("Asha".into()),
                    roll_no: Some("21CS01".into()),
                    ..Default::default()
                },
                AccessStatus::Unauthorized,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(logged.access.roll_no, None);
    }
}
