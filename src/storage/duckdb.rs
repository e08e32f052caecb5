use super::traits::{InsertOutcome, LogStore, StorageError};
use crate::collector::batch::LogBatch;
use crate::config::types::StorageConfig;
use crate::source::event::LogEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Table name for a source: lowercased, anything outside `[a-z0-9_]`
/// replaced with `_`, then prefixed.
pub fn collection_name(prefix: &str, service_name: &str) -> String {
    let sanitized: String = service_name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", prefix, sanitized)
}

/// Deterministic identity of an event, used as the primary key so a
/// redelivered batch collides with what is already stored.
pub fn event_id(event: &LogEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.hostname.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(event.line_number.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(event.timestamp.timestamp_micros().to_be_bytes());
    hasher.update([0u8]);
    hasher.update(event.line.as_bytes());

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn is_duplicate_key(error: &duckdb::Error) -> bool {
    let msg = error.to_string();
    msg.contains("Duplicate key") || msg.contains("PRIMARY KEY or UNIQUE constraint")
}

fn ensure_table(conn: &Connection, table: &str) -> Result<(), duckdb::Error> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{t}\" (
            event_id VARCHAR PRIMARY KEY,
            service_name VARCHAR NOT NULL,
            hostname VARCHAR NOT NULL,
            file_path VARCHAR NOT NULL,
            line VARCHAR NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL,
            line_number BIGINT NOT NULL,
            parsed VARCHAR,
            ingested_at TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS \"{t}_timestamp\" ON \"{t}\" (timestamp);
        CREATE INDEX IF NOT EXISTS \"{t}_hostname_timestamp\" ON \"{t}\" (hostname, timestamp);",
        t = table
    ))
}

fn purge_table(conn: &Connection, table: &str, cutoff_micros: i64) -> Result<usize, duckdb::Error> {
    conn.execute(
        &format!(
            "DELETE FROM \"{}\" WHERE timestamp < to_timestamp(? / 1000000.0)",
            table
        ),
        duckdb::params![cutoff_micros],
    )
}

type Row = (String, LogEvent, Option<String>);

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT OR IGNORE INTO \"{}\"
         (event_id, service_name, hostname, file_path, line, timestamp, line_number, parsed, ingested_at)
         VALUES (?, ?, ?, ?, ?, to_timestamp(? / 1000000.0), ?, ?, to_timestamp(? / 1000000.0))",
        table
    )
}

fn execute_row(
    stmt: &mut duckdb::Statement<'_>,
    (id, event, parsed): &Row,
    ingested_at: i64,
) -> Result<usize, duckdb::Error> {
    stmt.execute(duckdb::params![
        id,
        event.service_name,
        event.hostname,
        event.file_path,
        event.line,
        event.timestamp.timestamp_micros(),
        event.line_number as i64,
        parsed,
        ingested_at,
    ])
}

/// Store the whole batch under one commit. Any error rolls every row back.
fn insert_in_transaction(
    conn: &mut Connection,
    table: &str,
    rows: &[Row],
    ingested_at: i64,
) -> Result<InsertOutcome, duckdb::Error> {
    let tx = conn.transaction()?;
    let mut outcome = InsertOutcome::default();
    {
        let mut stmt = tx.prepare(&insert_sql(table))?;
        for row in rows {
            match execute_row(&mut stmt, row, ingested_at)? {
                0 => outcome.duplicates += 1,
                _ => outcome.inserted += 1,
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

/// Autocommit each row so one bad row does not take the rest down with it.
/// Returns the outcome, the number of failed rows and the first failure.
fn insert_row_by_row(
    conn: &Connection,
    table: &str,
    rows: &[Row],
    ingested_at: i64,
) -> Result<(InsertOutcome, usize, Option<duckdb::Error>), duckdb::Error> {
    let mut stmt = conn.prepare(&insert_sql(table))?;
    let mut outcome = InsertOutcome::default();
    let mut first_error: Option<duckdb::Error> = None;
    let mut failed = 0usize;

    for row in rows {
        match execute_row(&mut stmt, row, ingested_at) {
            Ok(0) => outcome.duplicates += 1,
            Ok(_) => outcome.inserted += 1,
            Err(e) if is_duplicate_key(&e) => outcome.duplicates += 1,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
    }
    Ok((outcome, failed, first_error))
}

fn invalid_timestamp(column: usize) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        column,
        duckdb::types::Type::BigInt,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid timestamp",
        )),
    )
}

/// DuckDB implementation of [`LogStore`]. Each source gets its own table.
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
    prefix: String,
    ttl_days: u32,
    collections: RwLock<HashMap<String, String>>,
    ensured: Arc<Mutex<HashSet<String>>>,
}

impl DuckDbStorage {
    pub fn new<P: AsRef<Path>>(path: P, prefix: &str, ttl_days: u32) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), prefix, ttl_days, "Opened log storage");
        Ok(Self::with_connection(conn, prefix, ttl_days))
    }

    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::new(&config.path, &config.collection_prefix, config.ttl_days)
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory(prefix: &str, ttl_days: u32) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_connection(conn, prefix, ttl_days))
    }

    fn with_connection(conn: Connection, prefix: &str, ttl_days: u32) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            prefix: prefix.to_string(),
            ttl_days,
            collections: RwLock::new(HashMap::new()),
            ensured: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Resolve (and cache) the table for a source.
    pub fn collection_for(&self, service_name: &str) -> String {
        if let Some(name) = self.collections.read().unwrap().get(service_name) {
            return name.clone();
        }
        let name = collection_name(&self.prefix, service_name);
        self.collections
            .write()
            .unwrap()
            .entry(service_name.to_string())
            .or_insert(name)
            .clone()
    }

    fn retention_cutoff(&self) -> Option<i64> {
        if self.ttl_days == 0 {
            return None;
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.ttl_days));
        Some(cutoff.timestamp_micros())
    }

    /// Create the table and its indexes once per process. A table seen for
    /// the first time also gets its expired rows purged.
    fn ensure_collection(
        conn: &Connection,
        ensured: &Mutex<HashSet<String>>,
        table: &str,
        cutoff: Option<i64>,
    ) -> Result<(), StorageError> {
        if ensured.lock().unwrap().contains(table) {
            return Ok(());
        }

        ensure_table(conn, table)?;
        if let Some(cutoff) = cutoff {
            let purged = purge_table(conn, table, cutoff)?;
            if purged > 0 {
                tracing::info!(collection = %table, purged, "Purged expired events");
            }
        }
        ensured.lock().unwrap().insert(table.to_string());
        tracing::debug!(collection = %table, "Collection ready");
        Ok(())
    }
}

#[async_trait]
impl LogStore for DuckDbStorage {
    async fn insert_batch(&self, batch: &LogBatch) -> Result<InsertOutcome, StorageError> {
        if batch.entries.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let table = self.collection_for(&batch.service_name);
        let cutoff = self.retention_cutoff();
        let conn = self.conn.clone();
        let ensured = self.ensured.clone();

        let mut rows = Vec::with_capacity(batch.entries.len());
        for event in &batch.entries {
            let parsed = match &event.parsed {
                Some(map) => Some(serde_json::to_string(map)?),
                None => None,
            };
            rows.push((event_id(event), event.clone(), parsed));
        }

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            Self::ensure_collection(&conn, &ensured, &table, cutoff)?;

            let ingested_at = Utc::now().timestamp_micros();
            let (outcome, failed, first_error) =
                match insert_in_transaction(&mut conn, &table, &rows, ingested_at) {
                    Ok(outcome) => (outcome, 0, None),
                    Err(e) => {
                        tracing::warn!(
                            collection = %table,
                            error = %e,
                            "Batch insert rolled back, storing rows one at a time"
                        );
                        insert_row_by_row(&conn, &table, &rows, ingested_at)?
                    }
                };

            if let Some(e) = first_error {
                tracing::error!(
                    collection = %table,
                    inserted = outcome.inserted,
                    failed,
                    error = %e,
                    "Batch partially stored"
                );
                return Err(StorageError::DuckDb(e));
            }

            tracing::debug!(
                collection = %table,
                inserted = outcome.inserted,
                duplicates = outcome.duplicates,
                "Stored batch"
            );
            Ok(outcome)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let Some(cutoff) = self.retention_cutoff() else {
            return Ok(0);
        };
        let conn = self.conn.clone();
        let prefix = self.prefix.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT table_name FROM information_schema.tables
                 WHERE starts_with(table_name, ?)
                 ORDER BY table_name",
            )?;
            let tables = stmt
                .query_map(duckdb::params![prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut total = 0u64;
            for table in tables {
                let purged = purge_table(&conn, &table, cutoff)?;
                if purged > 0 {
                    tracing::info!(collection = %table, purged, "Purged expired events");
                }
                total += purged as u64;
            }
            Ok::<u64, StorageError>(total)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn count_events(&self, service_name: &str) -> Result<u64, StorageError> {
        let table = self.collection_for(service_name);
        let conn = self.conn.clone();
        let ensured = self.ensured.clone();
        let cutoff = self.retention_cutoff();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            Self::ensure_collection(&conn, &ensured, &table, cutoff)?;
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", table),
                [],
                |row| row.get(0),
            )?;
            Ok::<u64, StorageError>(count.max(0) as u64)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn recent_events(
        &self,
        service_name: &str,
        limit: usize,
    ) -> Result<Vec<LogEvent>, StorageError> {
        let table = self.collection_for(service_name);
        let conn = self.conn.clone();
        let ensured = self.ensured.clone();
        let cutoff = self.retention_cutoff();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            Self::ensure_collection(&conn, &ensured, &table, cutoff)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT service_name, hostname, file_path, line, epoch_us(timestamp), line_number, parsed
                 FROM \"{}\"
                 ORDER BY timestamp DESC, line_number DESC
                 LIMIT ?",
                table
            ))?;

            let rows = stmt.query_map(duckdb::params![limit as i64], |row| {
                let timestamp: DateTime<Utc> = DateTime::from_timestamp_micros(row.get::<_, i64>(4)?)
                    .ok_or_else(|| invalid_timestamp(4))?;
                let line_number: i64 = row.get(5)?;
                let parsed: Option<String> = row.get(6)?;
                Ok((
                    LogEvent {
                        service_name: row.get(0)?,
                        hostname: row.get(1)?,
                        file_path: row.get(2)?,
                        line: row.get(3)?,
                        timestamp,
                        line_number: line_number.max(0) as u64,
                        parsed: None,
                    },
                    parsed,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (mut event, parsed) = row?;
                if let Some(raw) = parsed {
                    event.parsed = Some(serde_json::from_str(&raw)?);
                }
                events.push(event);
            }
            Ok::<Vec<LogEvent>, StorageError>(events)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn close(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute_batch("CHECKPOINT")?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::event::parse_structured;

    fn event(service: &str, n: u64) -> LogEvent {
        LogEvent::new(service, "web-01", "/var/log/app.log", format!("request {}", n), n)
    }

    fn batch(service: &str, range: std::ops::RangeInclusive<u64>) -> LogBatch {
        LogBatch::new(service, range.map(|n| event(service, n)).collect()).unwrap()
    }

    #[test]
    fn test_collection_name_sanitized() {
        assert_eq!(collection_name("logs_", "Web API!"), "logs_web_api_");
        assert_eq!(collection_name("logs_", "billing-worker.v2"), "logs_billing_worker_v2");
        assert_eq!(collection_name("", "already_ok_9"), "already_ok_9");
    }

    #[test]
    fn test_collection_cached() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        assert_eq!(storage.collection_for("Web API!"), "logs_web_api_");
        assert_eq!(storage.collection_for("Web API!"), "logs_web_api_");
        assert_eq!(storage.collections.read().unwrap().len(), 1);
    }

    #[test]
    fn test_event_id_stable_and_distinct() {
        let a = event("api", 1);
        let mut b = a.clone();
        assert_eq!(event_id(&a), event_id(&b));
        assert_eq!(event_id(&a).len(), 64);

        b.line_number = 2;
        assert_ne!(event_id(&a), event_id(&b));
    }

    #[tokio::test]
    async fn test_insert_and_count() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        let outcome = storage.insert_batch(&batch("api", 1..=5)).await.unwrap();
        assert_eq!(outcome, InsertOutcome { inserted: 5, duplicates: 0 });
        assert_eq!(storage.count_events("api").await.unwrap(), 5);
        assert_eq!(storage.count_events("worker").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_batch_is_benign() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        let b = batch("api", 1..=3);

        storage.insert_batch(&b).await.unwrap();
        let second = storage.insert_batch(&b).await.unwrap();
        assert_eq!(second, InsertOutcome { inserted: 0, duplicates: 3 });
        assert_eq!(second.accepted(), 3);
        assert_eq!(storage.count_events("api").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_partial_overlap() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        let first = batch("api", 1..=3);
        storage.insert_batch(&first).await.unwrap();

        let mut entries = first.entries.clone();
        entries.push(event("api", 4));
        let overlap = LogBatch::new("api", entries).unwrap();

        let outcome = storage.insert_batch(&overlap).await.unwrap();
        assert_eq!(outcome, InsertOutcome { inserted: 1, duplicates: 3 });
        assert_eq!(storage.count_events("api").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_large_batch_with_duplicate_in_one_commit() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        storage.insert_batch(&batch("api", 50..=50)).await.unwrap();

        let mut entries: Vec<LogEvent> = (1..=100).map(|n| event("api", n)).collect();
        entries.push(event("api", 7));
        let big = LogBatch::new("api", entries).unwrap();

        let outcome = storage.insert_batch(&big).await.unwrap();
        assert_eq!(outcome, InsertOutcome { inserted: 99, duplicates: 2 });
        assert_eq!(storage.count_events("api").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_bad_row_falls_back_and_keeps_the_rest() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        storage
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE logs_api (
                    event_id VARCHAR PRIMARY KEY,
                    service_name VARCHAR NOT NULL,
                    hostname VARCHAR NOT NULL,
                    file_path VARCHAR NOT NULL,
                    line VARCHAR NOT NULL CHECK (line <> 'request 2'),
                    timestamp TIMESTAMPTZ NOT NULL,
                    line_number BIGINT NOT NULL,
                    parsed VARCHAR,
                    ingested_at TIMESTAMPTZ NOT NULL
                );",
            )
            .unwrap();

        let err = storage.insert_batch(&batch("api", 1..=3)).await.unwrap_err();
        assert!(matches!(err, StorageError::DuckDb(_)));
        assert_eq!(storage.count_events("api").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sources_are_partitioned() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        storage.insert_batch(&batch("Web API!", 1..=2)).await.unwrap();
        storage.insert_batch(&batch("worker", 1..=1)).await.unwrap();

        assert_eq!(storage.count_events("Web API!").await.unwrap(), 2);
        assert_eq!(storage.count_events("worker").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_parsed_payload_round_trip() {
        let storage = DuckDbStorage::in_memory("logs_", 30).unwrap();
        let mut e = LogEvent::new("api", "web-01", "/var/log/app.log", r#"{"level":"warn"}"#, 1);
        e.parsed = parse_structured(&e.line);
        storage
            .insert_batch(&LogBatch::new("api", vec![e, event("api", 2)]).unwrap())
            .await
            .unwrap();

        let events = storage.recent_events("api", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        let structured = events.iter().find(|e| e.line_number == 1).unwrap();
        assert_eq!(structured.parsed.as_ref().unwrap()["level"], "warn");
        let plain = events.iter().find(|e| e.line_number == 2).unwrap();
        assert!(plain.parsed.is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let storage = DuckDbStorage::in_memory("logs_", 7).unwrap();
        let mut old = event("api", 1);
        old.timestamp = Utc::now() - chrono::Duration::days(30);
        let fresh = event("api", 2);
        storage
            .insert_batch(&LogBatch::new("api", vec![old, fresh]).unwrap())
            .await
            .unwrap();

        assert_eq!(storage.purge_expired().await.unwrap(), 1);
        assert_eq!(storage.count_events("api").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_keeps_everything() {
        let storage = DuckDbStorage::in_memory("logs_", 0).unwrap();
        let mut old = event("api", 1);
        old.timestamp = Utc::now() - chrono::Duration::days(3650);
        storage
            .insert_batch(&LogBatch::new("api", vec![old]).unwrap())
            .await
            .unwrap();
        assert_eq!(storage.purge_expired().await.unwrap(), 0);
        assert_eq!(storage.count_events("api").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_storage_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data/logs.duckdb");
        {
            let storage = DuckDbStorage::new(&path, "logs_", 30).unwrap();
            storage.insert_batch(&batch("api", 1..=2)).await.unwrap();
            storage.close().await.unwrap();
        }
        let reopened = DuckDbStorage::new(&path, "logs_", 30).unwrap();
        assert_eq!(reopened.count_events("api").await.unwrap(), 2);
    }
}
