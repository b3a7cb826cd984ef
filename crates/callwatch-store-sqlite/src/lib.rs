#![allow(clippy::missing_errors_doc)]

mod history;
mod reconcile;

use std::path::Path;

use callwatch_core::{
    format_rfc3339, parse_feed_timestamp, unix_millis, CallRecord, CallwatchError, ReopenPolicy,
    Result, UpsertReport,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

const CALLS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CALLS_V1: &str = r"
CREATE TABLE IF NOT EXISTS calls (
  local_key INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id INTEGER NOT NULL,
  sequence_number TEXT NOT NULL,
  status TEXT NOT NULL,
  status_at TEXT NOT NULL,
  status_at_ms INTEGER NOT NULL,
  creation_at TEXT NOT NULL,
  creation_at_ms INTEGER NOT NULL,
  zone TEXT NOT NULL,
  location TEXT NOT NULL,
  cross_streets TEXT NOT NULL,
  premise TEXT,
  priority TEXT NOT NULL,
  agency_type TEXT NOT NULL,
  jurisdiction TEXT NOT NULL,
  call_type TEXT NOT NULL,
  type_description TEXT NOT NULL,
  city TEXT NOT NULL,
  state TEXT NOT NULL,
  latitude REAL,
  longitude REAL,
  battalion TEXT NOT NULL,
  stacked INTEGER NOT NULL DEFAULT 0 CHECK (stacked IN (0, 1)),
  entered_queue TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_entity_id
  ON calls(entity_id);
CREATE INDEX IF NOT EXISTS idx_calls_creation
  ON calls(creation_at_ms, local_key);
-- Serves status_counts grouping.
CREATE INDEX IF NOT EXISTS idx_calls_status
  ON calls(status);

CREATE TRIGGER IF NOT EXISTS trg_calls_no_delete
BEFORE DELETE ON calls
BEGIN
  SELECT RAISE(FAIL, 'calls rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_calls_creation_immutable
BEFORE UPDATE OF creation_at, creation_at_ms ON calls
WHEN NEW.creation_at <> OLD.creation_at OR NEW.creation_at_ms <> OLD.creation_at_ms
BEGIN
  SELECT RAISE(FAIL, 'calls.creation_at is immutable');
END;
";

const CALL_COLUMNS: &str = "local_key, entity_id, sequence_number, status, status_at, creation_at,
    zone, location, cross_streets, premise, priority, agency_type, jurisdiction,
    call_type, type_description, city, state, latitude, longitude, battalion,
    stacked, entered_queue";

/// Durable call history backed by a single `SQLite` file.
///
/// The handle is constructed explicitly and passed to whoever needs it. One
/// handle is the single writer; readers may open their own handle on the same
/// file and rely on WAL isolation.
pub struct SqliteCallStore {
    conn: Connection,
    reopen_policy: ReopenPolicy,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StatusCount {
    pub status: String,
    pub count: usize,
}

pub(crate) trait StorageContext<T> {
    fn storage(self, action: &str) -> Result<T>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, action: &str) -> Result<T> {
        self.map_err(|err| CallwatchError::Storage(format!("{action}: {err}")))
    }
}

impl SqliteCallStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| {
            CallwatchError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .storage("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            reopen_policy: ReopenPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_reopen_policy(mut self, policy: ReopenPolicy) -> Self {
        self.reopen_policy = policy;
        self
    }

    #[must_use]
    pub fn reopen_policy(&self) -> ReopenPolicy {
        self.reopen_policy
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .storage("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CALLS_V1)
            .storage("failed to apply calls schema")?;

        let now = format_rfc3339(callwatch_core::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CALLS_MIGRATION_VERSION, now],
            )
            .storage("failed to register calls schema migration")?;

        Ok(())
    }

    /// Flushes and closes the connection, surfacing any close failure.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, err)| CallwatchError::Storage(format!("failed to close sqlite database: {err}")))
    }

    pub fn get_all(&self) -> Result<Vec<CallRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CALL_COLUMNS} FROM calls ORDER BY local_key ASC"))
            .storage("failed to prepare full scan")?;
        let rows = stmt
            .query_map([], parse_call_row)
            .storage("failed to scan calls")?;
        collect_rows(rows)
    }

    pub fn find_by_entity_id(&self, entity_id: i64) -> Result<Option<CallRecord>> {
        find_call(&self.conn, entity_id)
    }

    /// Rows whose status is anything but `Closed`, in storage order.
    pub fn list_open(&self) -> Result<Vec<CallRecord>> {
        list_open_calls(&self.conn)
    }

    /// Rows ordered by creation time ascending. Bounds are inclusive and
    /// compared at millisecond granularity, so callers needing exact bounds
    /// must re-check `creation_timestamp`.
    pub fn query_by_creation_range(
        &self,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Vec<CallRecord>> {
        let start_ms = start.map_or(i64::MIN, unix_millis);
        let end_ms = end.map_or(i64::MAX, unix_millis);

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CALL_COLUMNS}
                 FROM calls
                 WHERE creation_at_ms >= ?1 AND creation_at_ms <= ?2
                 ORDER BY creation_at_ms ASC, local_key ASC"
            ))
            .storage("failed to prepare creation range query")?;
        let rows = stmt
            .query_map(params![start_ms, end_ms], parse_call_row)
            .storage("failed to query creation range")?;
        collect_rows(rows)
    }

    /// Applies `records` under the recency rule in one transaction.
    ///
    /// A record is written when its `entity_id` is unknown, or when its
    /// `status_timestamp` is strictly newer than the stored one. Anything else
    /// is discarded without error. If any statement or the commit fails, no
    /// write from this batch is visible.
    pub fn upsert_batch(&mut self, records: &[CallRecord]) -> Result<UpsertReport> {
        let policy = self.reopen_policy;
        let tx = self
            .conn
            .transaction()
            .storage("failed to start upsert transaction")?;
        let report = upsert_in(&tx, records, policy)?;
        tx.commit().storage("failed to commit upsert transaction")?;

        debug!(
            inserted = report.inserted,
            updated = report.updated,
            discarded = report.discarded,
            "upsert batch committed"
        );
        Ok(report)
    }

    pub fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM calls GROUP BY status ORDER BY status ASC")
            .storage("failed to prepare status counts")?;
        let rows = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok(StatusCount {
                    status: row.get(0)?,
                    count: usize::try_from(count).unwrap_or_default(),
                })
            })
            .storage("failed to count calls by status")?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn upsert_in(
    conn: &Connection,
    records: &[CallRecord],
    policy: ReopenPolicy,
) -> Result<UpsertReport> {
    let mut report = UpsertReport::default();

    for record in records {
        match find_call(conn, record.entity_id)? {
            None => {
                insert_call(conn, record)?;
                report.inserted += 1;
            }
            Some(current) if accepts_write(&current, record, policy) => {
                update_call(conn, &current, record)?;
                report.updated += 1;
            }
            Some(_) => report.discarded += 1,
        }
    }

    Ok(report)
}

fn accepts_write(current: &CallRecord, incoming: &CallRecord, policy: ReopenPolicy) -> bool {
    if incoming.status_timestamp <= current.status_timestamp {
        return false;
    }

    match policy {
        ReopenPolicy::AllowNewer => true,
        ReopenPolicy::Never => !current.is_closed() || incoming.is_closed(),
    }
}

/// Full scan on the reconcile path. `idx_calls_status` backs `status_counts`
/// grouping only; a case-insensitive inequality cannot seek on it.
pub(crate) fn list_open_calls(conn: &Connection) -> Result<Vec<CallRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CALL_COLUMNS}
             FROM calls
             WHERE lower(status) <> 'closed'
             ORDER BY local_key ASC"
        ))
        .storage("failed to prepare open calls query")?;
    let rows = stmt
        .query_map([], parse_call_row)
        .storage("failed to list open calls")?;
    collect_rows(rows)
}

fn find_call(conn: &Connection, entity_id: i64) -> Result<Option<CallRecord>> {
    conn.query_row(
        &format!("SELECT {CALL_COLUMNS} FROM calls WHERE entity_id = ?1"),
        params![entity_id],
        parse_call_row,
    )
    .optional()
    .storage("failed to look up call by entity_id")
}

fn insert_call(conn: &Connection, record: &CallRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO calls(
            entity_id, sequence_number, status, status_at, status_at_ms,
            creation_at, creation_at_ms, zone, location, cross_streets,
            premise, priority, agency_type, jurisdiction, call_type,
            type_description, city, state, latitude, longitude,
            battalion, stacked, entered_queue
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20,
            ?21, ?22, ?23
         )",
        params![
            record.entity_id,
            record.sequence_number,
            record.status,
            format_rfc3339(record.status_timestamp)?,
            unix_millis(record.status_timestamp),
            format_rfc3339(record.creation_timestamp)?,
            unix_millis(record.creation_timestamp),
            record.zone,
            record.location,
            record.cross_streets,
            record.premise,
            record.priority,
            record.agency_type,
            record.jurisdiction,
            record.call_type,
            record.type_description,
            record.city,
            record.state,
            record.latitude,
            record.longitude,
            record.battalion,
            i64::from(record.stacked),
            record.entered_queue,
        ],
    )
    .storage("failed to insert call")?;
    Ok(())
}

/// Overwrites the mutable columns of `current`. `local_key` and the creation
/// columns are left as first stored.
fn update_call(conn: &Connection, current: &CallRecord, incoming: &CallRecord) -> Result<()> {
    conn.execute(
        "UPDATE calls SET
            sequence_number = ?2,
            status = ?3,
            status_at = ?4,
            status_at_ms = ?5,
            zone = ?6,
            location = ?7,
            cross_streets = ?8,
            premise = ?9,
            priority = ?10,
            agency_type = ?11,
            jurisdiction = ?12,
            call_type = ?13,
            type_description = ?14,
            city = ?15,
            state = ?16,
            latitude = ?17,
            longitude = ?18,
            battalion = ?19,
            stacked = ?20,
            entered_queue = ?21
         WHERE entity_id = ?1",
        params![
            current.entity_id,
            incoming.sequence_number,
            incoming.status,
            format_rfc3339(incoming.status_timestamp)?,
            unix_millis(incoming.status_timestamp),
            incoming.zone,
            incoming.location,
            incoming.cross_streets,
            incoming.premise,
            incoming.priority,
            incoming.agency_type,
            incoming.jurisdiction,
            incoming.call_type,
            incoming.type_description,
            incoming.city,
            incoming.state,
            incoming.latitude,
            incoming.longitude,
            incoming.battalion,
            i64::from(incoming.stacked),
            incoming.entered_queue,
        ],
    )
    .storage("failed to update call")?;
    Ok(())
}

fn parse_call_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let status_at: String = row.get(4)?;
    let creation_at: String = row.get(5)?;
    let stacked: i64 = row.get(20)?;

    Ok(CallRecord {
        local_key: Some(row.get(0)?),
        entity_id: row.get(1)?,
        sequence_number: row.get(2)?,
        status: row.get(3)?,
        status_timestamp: parse_feed_timestamp(&status_at).map_err(|err| to_sql_error(4, &err))?,
        creation_timestamp: parse_feed_timestamp(&creation_at)
            .map_err(|err| to_sql_error(5, &err))?,
        zone: row.get(6)?,
        location: row.get(7)?,
        cross_streets: row.get(8)?,
        premise: row.get(9)?,
        priority: row.get(10)?,
        agency_type: row.get(11)?,
        jurisdiction: row.get(12)?,
        call_type: row.get(13)?,
        type_description: row.get(14)?,
        city: row.get(15)?,
        state: row.get(16)?,
        latitude: row.get(17)?,
        longitude: row.get(18)?,
        battalion: row.get(19)?,
        stacked: stacked != 0,
        entered_queue: row.get(21)?,
    })
}

fn to_sql_error(column: usize, err: &CallwatchError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.storage("failed to decode call row")?);
    }
    Ok(values)
}
