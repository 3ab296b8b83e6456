use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{
    check_registrable, EventFilter, EventStore, ReferenceImage, RegistryStore, StoreError,
    StoreResult, StoredIdentity, StoredVehicle, VehicleType,
};
use crate::events::{AccessEvent, NotificationDetails, NotificationEvent, NotificationReason};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn ensure_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS identities (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          roll_no TEXT NOT NULL UNIQUE,
          branch TEXT NOT NULL,
          plate_number TEXT,
          vehicle_type TEXT,
          created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS identity_images (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          identity_id INTEGER NOT NULL REFERENCES identities(id),
          name TEXT NOT NULL,
          data BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS access_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          created_at INTEGER NOT NULL,
          person_detected INTEGER NOT NULL,
          plate_detected INTEGER NOT NULL,
          name TEXT,
          roll_no TEXT,
          plate_number TEXT,
          confidence REAL,
          image BLOB,
          objects_json TEXT NOT NULL,
          authenticated INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notification_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          created_at INTEGER NOT NULL,
          reason TEXT NOT NULL,
          image BLOB,
          face INTEGER NOT NULL,
          plate INTEGER NOT NULL,
          matched INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_access_created ON access_events(created_at);
        CREATE INDEX IF NOT EXISTS idx_notification_created ON notification_events(created_at);
        "#,
    )?;
    Ok(())
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

/// `WHERE` clause and `LIMIT` bound for a filter over `created_at`.
fn filter_clause(filter: &EventFilter, authenticated_column: bool) -> (String, Vec<Value>) {
    let mut conditions = vec![];
    let mut values = vec![];
    if let Some(since) = filter.since {
        conditions.push("created_at >= ?");
        values.push(Value::Integer(since.timestamp_millis()));
    }
    if let Some(until) = filter.until {
        conditions.push("created_at <= ?");
        values.push(Value::Integer(until.timestamp_millis()));
    }
    if let (true, Some(authenticated)) = (authenticated_column, filter.authenticated) {
        conditions.push("authenticated = ?");
        values.push(Value::Integer(authenticated as i64));
    }
    let mut clause = String::new();
    if !conditions.is_empty() {
        clause.push_str(" WHERE ");
        clause.push_str(&conditions.join(" AND "));
    }
    clause.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
    values.push(Value::Integer(
        filter.limit.map_or(-1, |limit| limit as i64),
    ));
    (clause, values)
}

fn access_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, AccessEvent, String)> {
    let created_at: i64 = row.get(0)?;
    let objects_json: String = row.get(8)?;
    Ok((
        created_at,
        AccessEvent {
            timestamp: DateTime::<Utc>::MIN_UTC,
            person_detected: row.get(1)?,
            plate_detected: row.get(2)?,
            name: row.get(3)?,
            roll_no: row.get(4)?,
            plate_number: row.get(5)?,
            confidence: row.get::<_, Option<f64>>(6)?.map(|c| c as f32),
            image: row.get(7)?,
            objects_detected: vec![],
            authenticated: row.get(9)?,
        },
        objects_json,
    ))
}

impl RegistryStore for SqliteStore {
    fn identities(&self) -> StoreResult<Vec<StoredIdentity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, roll_no, branch, plate_number, vehicle_type FROM identities ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let plate_number: Option<String> = row.get(4)?;
            let vehicle_type: Option<String> = row.get(5)?;
            Ok((
                row.get::<_, i64>(0)?,
                StoredIdentity {
                    name: row.get(1)?,
                    roll_no: row.get(2)?,
                    branch: row.get(3)?,
                    images: vec![],
                    vehicle: plate_number.map(|plate_number| StoredVehicle {
                        plate_number,
                        vehicle_type: vehicle_type
                            .as_deref()
                            .map(VehicleType::parse)
                            .unwrap_or_default(),
                    }),
                },
            ))
        })?;

        let mut images_stmt = conn
            .prepare("SELECT name, data FROM identity_images WHERE identity_id = ?1 ORDER BY id")?;
        let mut identities = vec![];
        for row in rows {
            let (id, mut identity) = row?;
            identity.images = images_stmt
                .query_map(params![id], |row| {
                    Ok(ReferenceImage {
                        name: row.get(0)?,
                        data: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            identities.push(identity);
        }
        Ok(identities)
    }

    fn register(&self, identity: &StoredIdentity) -> StoreResult<()> {
        check_registrable(identity)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM identities WHERE roll_no = ?1",
                params![identity.roll_no],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::DuplicateRollNo(identity.roll_no.clone()));
        }
        tx.execute(
            r#"
            INSERT INTO identities(name, roll_no, branch, plate_number, vehicle_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                identity.name,
                identity.roll_no,
                identity.branch,
                identity.vehicle.as_ref().map(|v| v.plate_number.clone()),
                identity.vehicle.as_ref().map(|v| v.vehicle_type.as_str()),
                Utc::now().timestamp_millis(),
            ],
        )?;
        let identity_id = tx.last_insert_rowid();
        for image in &identity.images {
            tx.execute(
                "INSERT INTO identity_images(identity_id, name, data) VALUES (?1, ?2, ?3)",
                params![identity_id, image.name, image.data],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl EventStore for SqliteStore {
    fn insert_access(&self, event: &AccessEvent) -> StoreResult<()> {
        let objects_json = serde_json::to_string(&event.objects_detected)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.conn()?.execute(
            r#"
            INSERT INTO access_events(created_at, person_detected, plate_detected, name, roll_no,
              plate_number, confidence, image, objects_json, authenticated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                event.timestamp.timestamp_millis(),
                event.person_detected,
                event.plate_detected,
                event.name,
                event.roll_no,
                event.plate_number,
                event.confidence.map(|c| c as f64),
                event.image,
                objects_json,
                event.authenticated,
            ],
        )?;
        Ok(())
    }

    fn insert_notification(&self, event: &NotificationEvent) -> StoreResult<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO notification_events(created_at, reason, image, face, plate, matched)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.timestamp.timestamp_millis(),
                event.reason.as_str(),
                event.image,
                event.details.face,
                event.details.plate,
                event.details.matched,
            ],
        )?;
        Ok(())
    }

    fn access_events(&self, filter: &EventFilter) -> StoreResult<Vec<AccessEvent>> {
        let (clause, values) = filter_clause(filter, true);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT created_at, person_detected, plate_detected, name, roll_no, plate_number, \
             confidence, image, objects_json, authenticated FROM access_events{clause}"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), access_from_row)?;

        let mut events = vec![];
        for row in rows {
            let (created_at, mut event, objects_json) = row?;
            event.timestamp = from_millis(created_at)?;
            event.objects_detected = serde_json::from_str(&objects_json)
                .map_err(|e| StoreError::Corrupt(format!("objects_json: {e}")))?;
            events.push(event);
        }
        Ok(events)
    }

    fn notifications(&self, filter: &EventFilter) -> StoreResult<Vec<NotificationEvent>> {
        let (clause, values) = filter_clause(filter, false);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT created_at, reason, image, face, plate, matched FROM notification_events{clause}"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                NotificationDetails {
                    face: row.get(3)?,
                    plate: row.get(4)?,
                    matched: row.get(5)?,
                },
            ))
        })?;

        let mut events = vec![];
        for row in rows {
            let (created_at, reason, image, details) = row?;
            let reason = NotificationReason::parse(&reason)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown reason {reason}")))?;
            events.push(NotificationEvent {
                timestamp: from_millis(created_at)?,
                reason,
                image,
                details,
            });
        }
        Ok(events)
    }
}
