//! SQLite-backed store implementing every persistence trait.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{DeliveryLedger, EventStore, SubscriptionStore};
use crate::error::{ErrorCode, RelayError, RelayResult};
use crate::types::{DeliveryAttempt, DeliveryStatus, Event, NewAttempt, PairKey, Subscription};

const ATTEMPT_COLUMNS: &str =
    "id, subscription_id, event_id, attempt_number, status, http_code, error_details, created_at";

/// SQLite store for subscriptions, events and delivery attempts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn new(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| RelayError::Database {
            message: format!("Failed to open {}: {}", path.display(), e),
            code: ErrorCode::DbConnectionFailed,
            source: Some(Box::new(e)),
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> RelayResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> RelayResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RelayError::database(e.to_string()))
    }

    fn init_schema(&self) -> RelayResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                target_url TEXT NOT NULL,
                secret_key TEXT,
                event_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subscriptions_created ON subscriptions(created_at);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                http_code INTEGER,
                error_details TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (event_id) REFERENCES events(id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_pair_number
                ON delivery_attempts(subscription_id, event_id, attempt_number);
            CREATE INDEX IF NOT EXISTS idx_attempts_subscription
                ON delivery_attempts(subscription_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_attempts_event ON delivery_attempts(event_id);
        "#,
        )?;
        Ok(())
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    let is_active: i64 = row.get(4)?;
    Ok(Subscription {
        id: row.get(0)?,
        target_url: row.get(1)?,
        secret_key: row.get(2)?,
        event_type: row.get(3)?,
        is_active: is_active != 0,
        created_at: ts_column(row, 5)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload: String = row.get(2)?;
    Ok(Event {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e))?,
        created_at: ts_column(row, 3)?,
    })
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<DeliveryAttempt> {
    let status: String = row.get(4)?;
    Ok(DeliveryAttempt {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        event_id: row.get(2)?,
        attempt_number: row.get(3)?,
        status: DeliveryStatus::from_str(&status).map_err(|e| conversion_error(4, e))?,
        http_code: row.get(5)?,
        error_details: row.get(6)?,
        created_at: ts_column(row, 7)?,
    })
}

impl SubscriptionStore for SqliteStore {
    fn insert_subscription(&self, subscription: &Subscription) -> RelayResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO subscriptions (id, target_url, secret_key, event_type, is_active, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                subscription.id,
                subscription.target_url,
                subscription.secret_key,
                subscription.event_type,
                subscription.is_active as i64,
                format_ts(&subscription.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_subscription(&self, id: &str) -> RelayResult<Option<Subscription>> {
        let conn = self.conn()?;
        let subscription = conn
            .query_row(
                r#"SELECT id, target_url, secret_key, event_type, is_active, created_at
                   FROM subscriptions WHERE id = ?1"#,
                params![id],
                row_to_subscription,
            )
            .optional()?;
        Ok(subscription)
    }

    fn list_subscriptions(&self) -> RelayResult<Vec<Subscription>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, target_url, secret_key, event_type, is_active, created_at
               FROM subscriptions ORDER BY created_at ASC, id ASC"#,
        )?;
        let rows = stmt.query_map([], row_to_subscription)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn update_subscription(&self, subscription: &Subscription) -> RelayResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"UPDATE subscriptions
               SET target_url = ?2, secret_key = ?3, event_type = ?4, is_active = ?5
               WHERE id = ?1"#,
            params![
                subscription.id,
                subscription.target_url,
                subscription.secret_key,
                subscription.event_type,
                subscription.is_active as i64,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_subscription(&self, id: &str) -> RelayResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn subscriptions_created_before(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM subscriptions WHERE created_at < ?1")?;
        let rows = stmt.query_map(params![format_ts(&cutoff)], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl EventStore for SqliteStore {
    fn append(&self, event_type: &str, payload: serde_json::Value) -> RelayResult<Event> {
        let event = Event::new(event_type, payload);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (id, event_type, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.id,
                event.event_type,
                serde_json::to_string(&event.payload)?,
                format_ts(&event.created_at),
            ],
        )?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Stored event");
        Ok(event)
    }

    fn get_event(&self, id: &str) -> RelayResult<Option<Event>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                "SELECT id, event_type, payload, created_at FROM events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    fn event_count(&self) -> RelayResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl DeliveryLedger for SqliteStore {
    fn record_attempt(&self, attempt: NewAttempt) -> RelayResult<DeliveryAttempt> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let (count, terminal): (u32, i64) = tx.query_row(
            r#"SELECT COUNT(*), COALESCE(SUM(status != 'pending'), 0)
               FROM delivery_attempts WHERE subscription_id = ?1 AND event_id = ?2"#,
            params![attempt.pair.subscription_id, attempt.pair.event_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if terminal > 0 {
            return Err(RelayError::conflict(format!(
                "Pair {} already has a terminal attempt",
                attempt.pair
            )));
        }
        if attempt.attempt_number != count + 1 {
            return Err(RelayError::conflict(format!(
                "Pair {} expected attempt {}, got {}",
                attempt.pair,
                count + 1,
                attempt.attempt_number
            )));
        }

        let record = attempt.into_attempt();
        tx.execute(
            r#"INSERT INTO delivery_attempts
               (id, subscription_id, event_id, attempt_number, status, http_code, error_details, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                record.id,
                record.subscription_id,
                record.event_id,
                record.attempt_number,
                record.status.to_string(),
                record.http_code,
                record.error_details,
                format_ts(&record.created_at),
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn recent_for_subscription(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<DeliveryAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
               WHERE subscription_id = ?1
               ORDER BY created_at DESC, attempt_number DESC
               LIMIT ?2"#
        ))?;
        let rows = stmt.query_map(params![subscription_id, limit as i64], row_to_attempt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn attempts_for_event(&self, event_id: &str) -> RelayResult<Vec<DeliveryAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
               WHERE event_id = ?1
               ORDER BY attempt_number ASC, created_at ASC"#
        ))?;
        let rows = stmt.query_map(params![event_id], row_to_attempt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn attempt_count(&self, pair: &PairKey) -> RelayResult<u32> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM delivery_attempts WHERE subscription_id = ?1 AND event_id = ?2",
            params![pair.subscription_id, pair.event_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn last_attempt(&self, pair: &PairKey) -> RelayResult<Option<DeliveryAttempt>> {
        let conn = self.conn()?;
        let attempt = conn
            .query_row(
                &format!(
                    r#"SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                       WHERE subscription_id = ?1 AND event_id = ?2
                       ORDER BY attempt_number DESC LIMIT 1"#
                ),
                params![pair.subscription_id, pair.event_id],
                row_to_attempt,
            )
            .optional()?;
        Ok(attempt)
    }

    fn unfinished_pairs(&self) -> RelayResult<Vec<DeliveryAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts d
               WHERE d.status = 'pending'
                 AND d.attempt_number = (
                     SELECT MAX(attempt_number) FROM delivery_attempts
                     WHERE subscription_id = d.subscription_id AND event_id = d.event_id)
                 AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.id = d.subscription_id)
               ORDER BY d.created_at ASC"#
        ))?;
        let rows = stmt.query_map([], row_to_attempt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
