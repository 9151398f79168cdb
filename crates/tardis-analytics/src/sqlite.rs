//! SQLite-backed analytics storage.
//! Range filtering happens in SQL; tag filtering and aggregation in process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tardis_types::{AnalyticsError, AnalyticsEvent, AnalyticsStore, MetricPoint, MetricQuery};

/// SQLite-backed analytics store. Timestamps are stored as UTC microseconds.
pub struct SqliteAnalyticsStore {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteAnalyticsStore {
    /// Open (or create) the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AnalyticsError> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| AnalyticsError::Other(e.to_string()))?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self, AnalyticsError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| AnalyticsError::Other(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, AnalyticsError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                value REAL NOT NULL,
                ts INTEGER NOT NULL,
                tags TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                user_id TEXT,
                ts INTEGER NOT NULL,
                properties TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics(name, ts);
            CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events(event_type, ts);
            "#,
        )
        .map_err(|e| AnalyticsError::Other(e.to_string()))?;

        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, AnalyticsError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AnalyticsError::Other(format!("failed to acquire lock: {}", e)))?;
        f(&conn).map_err(|e| AnalyticsError::Other(e.to_string()))
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us).unwrap_or_default()
}

fn bound(ts: Option<DateTime<Utc>>, default: i64) -> i64 {
    ts.map(to_micros).unwrap_or(default)
}

#[async_trait::async_trait]
impl AnalyticsStore for SqliteAnalyticsStore {
    async fn record_metrics(&self, points: &[MetricPoint]) -> Result<(), AnalyticsError> {
        if let Some(bad) = points.iter().find(|p| p.name.is_empty() || !p.value.is_finite()) {
            return Err(AnalyticsError::InvalidQuery(format!(
                "metric point {} needs a name and a finite value",
                bad.id
            )));
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for p in points {
                let tags = serde_json::to_string(&p.tags)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute(
                    "INSERT INTO metrics (id, name, value, ts, tags) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![p.id, p.name, p.value, to_micros(p.timestamp), tags],
                )?;
            }
            tx.commit()
        })
    }

    async fn record_event(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        if event.event_type.is_empty() {
            return Err(AnalyticsError::InvalidQuery("event_type must not be empty".to_string()));
        }
        let properties = serde_json::to_string(&event.properties)
            .map_err(|e| AnalyticsError::Other(e.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (id, event_type, user_id, ts, properties) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    event.id,
                    event.event_type,
                    event.user_id,
                    to_micros(event.timestamp),
                    properties
                ],
            )?;
            Ok(())
        })
    }

    async fn query_metrics(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, AnalyticsError> {
        let start = bound(query.start, i64::MIN);
        let end = bound(query.end, i64::MAX);
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, value, ts, tags FROM metrics
                 WHERE name = ?1 AND ts >= ?2 AND ts < ?3
                 ORDER BY ts ASC, id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![query.name, start, end], |row| {
                let tags_json: String = row.get(4)?;
                Ok(MetricPoint {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                    timestamp: from_micros(row.get(3)?),
                    tags: serde_json::from_str::<HashMap<String, String>>(&tags_json)
                        .unwrap_or_default(),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(rows.into_iter().filter(|p| query.matches(p)).collect())
    }

    async fn query_events(
        &self,
        event_type: Option<&str>,
        user_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnalyticsEvent>, AnalyticsError> {
        let start = bound(start, i64::MIN);
        let end = bound(end, i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, user_id, ts, properties FROM events
                 WHERE (event_type = ?1 OR ?1 IS NULL)
                   AND (user_id = ?2 OR ?2 IS NULL)
                   AND ts >= ?3 AND ts < ?4
                 ORDER BY ts ASC, id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![event_type, user_id, start, end], |row| {
                let props_json: String = row.get(4)?;
                Ok(AnalyticsEvent {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    user_id: row.get(2)?,
                    timestamp: from_micros(row.get(3)?),
                    properties: serde_json::from_str(&props_json).unwrap_or_default(),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AnalyticsError> {
        let cutoff = to_micros(cutoff);
        let removed = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let m = tx.execute("DELETE FROM metrics WHERE ts < ?1", [cutoff])?;
            let e = tx.execute("DELETE FROM events WHERE ts < ?1", [cutoff])?;
            tx.commit()?;
            Ok(m + e)
        })?;
        tracing::info!(removed, "analytics rows purged");
        Ok(removed)
    }
}
