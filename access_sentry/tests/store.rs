use access_sentry::events::{
    AccessEvent, NotificationDetails, NotificationEvent, NotificationReason,
};
use access_sentry::store::{
    EventFilter, EventStore, ReferenceImage, RegistryStore, SqliteStore, StoreError,
    StoredIdentity, StoredVehicle, VehicleType,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 7, 45, 0).unwrap()
}

fn access(offset_secs: i64, authenticated: bool) -> AccessEvent {
    AccessEvent {
        timestamp: base() + Duration::seconds(offset_secs),
        person_detected: true,
        plate_detected: false,
        name: authenticated.then(|| "Asha".to_string()),
        roll_no: authenticated.then(|| "21CS01".to_string()),
        plate_number: None,
        confidence: Some(0.5),
        image: Some(vec![0xff, 0xd8, 0xff, 0xd9]),
        objects_detected: vec!["person".into(), "car".into()],
        authenticated,
    }
}

fn asha() -> StoredIdentity {
    StoredIdentity {
        name: "Asha".into(),
        roll_no: "21CS01".into(),
        branch: "CSE".into(),
        images: vec![
            ReferenceImage {
                name: "a.jpg".into(),
                data: vec![1, 2, 3],
            },
            ReferenceImage {
                name: "b.jpg".into(),
                data: vec![4, 5],
            },
        ],
        vehicle: Some(StoredVehicle {
            plate_number: "KA01AB1234".into(),
            vehicle_type: VehicleType::Bike,
        }),
    }
}

#[test]
fn identities_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sentry.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.register(&asha()).unwrap();
        let duplicate = store.register(&StoredIdentity {
            name: "Someone Else".into(),
            ..asha()
        });
        assert!(matches!(duplicate, Err(StoreError::DuplicateRollNo(roll)) if roll == "21CS01"));
    }

    let store = SqliteStore::open(&path).unwrap();
    let identities = store.identities().unwrap();
    assert_eq!(identities, vec![asha()]);
}

#[test]
fn unknown_cannot_be_registered() {
    let store = SqliteStore::in_memory().unwrap();
    let reserved = store.register(&StoredIdentity {
        name: "Unknown".into(),
        ..asha()
    });
    assert!(matches!(reserved, Err(StoreError::ReservedName(name)) if name == "Unknown"));
    assert!(store.identities().unwrap().is_empty());
    // The roll number is still free afterwards.
    store.register(&asha()).unwrap();
}

#[test]
fn access_events_come_back_newest_first_and_filtered() {
    let store = SqliteStore::in_memory().unwrap();
    store.insert_access(&access(0, true)).unwrap();
    store.insert_access(&access(10, false)).unwrap();
    store.insert_access(&access(20, true)).unwrap();

    let all = store.access_events(&EventFilter::default()).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0], access(20, true));
    assert_eq!(all[2], access(0, true));

    let latest = store.access_events(&EventFilter::latest(2)).unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[1].timestamp, base() + Duration::seconds(10));

    let rejected = store
        .access_events(&EventFilter {
            authenticated: Some(false),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rejected, vec![access(10, false)]);

    let window = store
        .access_events(&EventFilter {
            since: Some(base() + Duration::seconds(5)),
            until: Some(base() + Duration::seconds(15)),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(window.len(), 1);
}

#[test]
fn notifications_keep_reason_and_details() {
    let store = SqliteStore::in_memory().unwrap();
    for (offset, reason) in [
        (0, NotificationReason::UnknownPerson),
        (1, NotificationReason::UnauthorizedVehicle),
        (2, NotificationReason::UnknownFace),
    ] {
        store
            .insert_notification(&NotificationEvent {
                timestamp: base() + Duration::seconds(offset),
                reason,
                image: None,
                details: NotificationDetails {
                    face: reason == NotificationReason::UnknownFace,
                    plate: reason == NotificationReason::UnauthorizedVehicle,
                    matched: false,
                },
            })
            .unwrap();
    }
    let latest = store.notifications(&EventFilter::latest(5)).unwrap();
    let reasons: Vec<_> = latest.iter().map(|n| n.reason).collect();
    assert_eq!(
        reasons,
        vec![
            NotificationReason::UnknownFace,
            NotificationReason::UnauthorizedVehicle,
            NotificationReason::UnknownPerson,
        ]
    );
    assert!(latest[0].details.face);
    assert!(latest[1].details.plate);
}
