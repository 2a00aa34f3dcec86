//! Alert sinks: where classifications go once the monitor has scored them.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::params;
use rusqlite::types::Type;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Classification, Verdict};
use crate::storage::Pool;

/// Destination for classifications.
///
/// Anomalies go out on the high-severity channel, normal records on the
/// informational one. Errors are reported to the caller, which must not treat
/// them as fatal.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, classification: &Classification) -> Result<()>;
}

/// Writes alerts to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn emit(&self, c: &Classification) -> Result<()> {
        let fields = serde_json::to_string(&c.record)?;
        match c.verdict {
            Verdict::Anomaly => warn!(
                position = c.position,
                score = c.anomaly_score,
                record = %fields,
                "[ALERT] anomaly detected"
            ),
            Verdict::Normal => info!(
                position = c.position,
                score = c.anomaly_score,
                record = %fields,
                "[OK] normal record"
            ),
        }
        Ok(())
    }
}

/// A persisted alert row.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub position: u64,
    pub verdict: Verdict,
    pub score: f64,
    pub record: serde_json::Value,
    pub created_at: String,
}

/// Records anomalies in the `alerts` table.
pub struct SqliteAlertSink {
    pool: Pool,
    stream_id: String,
    include_normal: bool,
}

impl SqliteAlertSink {
    pub fn new(pool: Pool, stream_id: impl Into<String>) -> Self {
        Self {
            pool,
            stream_id: stream_id.into(),
            include_normal: false,
        }
    }

    /// Also persist NORMAL classifications.
    pub fn with_normal(mut self, include_normal: bool) -> Self {
        self.include_normal = include_normal;
        self
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        list_recent(&self.pool, limit)
    }
}

#[async_trait]
impl AlertSink for SqliteAlertSink {
    async fn emit(&self, c: &Classification) -> Result<()> {
        if c.verdict == Verdict::Normal && !self.include_normal {
            return Ok(());
        }
        let pool = self.pool.clone();
        let stream_id = self.stream_id.clone();
        let c = c.clone();

        tokio::task::spawn_blocking(move || insert_alert(&pool, &stream_id, &c))
            .await
            .context("alert insert aborted")?
    }
}

fn insert_alert(pool: &Pool, stream_id: &str, c: &Classification) -> Result<()> {
    let conn = pool.get()?;
    let id = Uuid::new_v4();
    let record_json = serde_json::to_string(&c.record)?;

    conn.execute(
        "INSERT INTO alerts (id, stream_id, position, verdict, score, record_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id.to_string(),
            stream_id,
            c.position as i64,
            c.verdict.to_string(),
            c.anomaly_score,
            record_json,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;

    Ok(())
}

fn conversion_failure(
    column: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, ty, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown verdict '{0}'")]
struct UnknownVerdict(String);

/// Most recent alerts first.
pub fn list_recent(pool: &Pool, limit: usize) -> Result<Vec<AlertRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, position, verdict, score, record_json, created_at
         FROM alerts ORDER BY created_at DESC, position DESC LIMIT ?1",
    )?;

    let rows = stmt.query_map([limit as i64], |row| {
        let id_str: String = row.get(0)?;
        let verdict_str: String = row.get(2)?;
        let record_str: String = row.get(4)?;
        Ok(AlertRecord {
            id: Uuid::parse_str(&id_str).map_err(|e| conversion_failure(0, Type::Text, e))?,
            position: row.get::<_, i64>(1)? as u64,
            verdict: match verdict_str.as_str() {
                "ANOMALY" => Verdict::Anomaly,
                "NORMAL" => Verdict::Normal,
                other => return Err(conversion_failure(2, Type::Text, UnknownVerdict(other.to_string()))),
            },
            score: row.get(3)?,
            record: serde_json::from_str(&record_str).map_err(|e| conversion_failure(4, Type::Text, e))?,
            created_at: row.get(5)?,
        })
    })?;

    let mut alerts = Vec::new();
    for r in rows {
        alerts.push(r?);
    }
    Ok(alerts)
}

/// Keeps every classification in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct MemoryAlertSink {
    emitted: Arc<Mutex<Vec<Classification>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<Classification> {
        self.emitted.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn anomalies(&self) -> Vec<Classification> {
        self.emitted()
            .into_iter()
            .filter(|c| c.verdict == Verdict::Anomaly)
            .collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn emit(&self, c: &Classification) -> Result<()> {
        self.emitted
            .lock()
            .map_err(|_| anyhow::anyhow!("alert buffer poisoned"))?
            .push(c.clone());
        Ok(())
    }
}

/// Sends each classification to every inner sink, reporting the first failure
/// after all of them have been tried.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AlertSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[async_trait]
impl AlertSink for FanoutSink {
    async fn emit(&self, c: &Classification) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(c).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryRecord;

    fn classification(position: u64, verdict: Verdict) -> Classification {
        Classification {
            position,
            record: TelemetryRecord::new(None, [("cpu_usage", 99.0)]),
            anomaly_score: if verdict == Verdict::Anomaly { 0.8 } else { 0.4 },
            verdict,
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn emit(&self, _: &Classification) -> Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[tokio::test]
    async fn test_sqlite_sink_records_anomalies_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = crate::storage::open_pool(&dir.path().join("alerts.db").to_string_lossy())?;
        let sink = SqliteAlertSink::new(pool, "test");

        sink.emit(&classification(0, Verdict::Normal)).await?;
        sink.emit(&classification(1, Verdict::Anomaly)).await?;

        let alerts = sink.list_recent(10)?;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].position, 1);
        assert_eq!(alerts[0].verdict, Verdict::Anomaly);
        assert_eq!(alerts[0].record["cpu_usage"], 99.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_sink_persists_normal_when_asked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = crate::storage::open_pool(&dir.path().join("alerts.db").to_string_lossy())?;
        let sink = SqliteAlertSink::new(pool, "test").with_normal(true);

        sink.emit(&classification(0, Verdict::Normal)).await?;
        let alerts = sink.list_recent(10)?;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].verdict, Verdict::Normal);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_recent_rejects_corrupt_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = crate::storage::open_pool(&dir.path().join("alerts.db").to_string_lossy())?;
        let insert = "INSERT INTO alerts (id, stream_id, position, verdict, score, record_json, created_at)
                      VALUES (?1, 's', 0, ?2, 0.9, ?3, '2026-01-01T00:00:00Z')";
        let good_id = Uuid::new_v4().to_string();

        let cases = [
            ("not-a-uuid", "ANOMALY", r#"{"cpu_usage":1.0}"#),
            (good_id.as_str(), "ANOMALY", "{ truncated"),
            (good_id.as_str(), "MAYBE", r#"{"cpu_usage":1.0}"#),
        ];
        for (id, verdict, record) in cases {
            {
                let conn = pool.get()?;
                conn.execute("DELETE FROM alerts", [])?;
                conn.execute(insert, params![id, verdict, record])?;
            }
            let err = list_recent(&pool, 10).unwrap_err();
            let sql_err = err.downcast_ref::<rusqlite::Error>();
            assert!(
                matches!(sql_err, Some(rusqlite::Error::FromSqlConversionFailure(..))),
                "expected conversion failure for ({}, {}, {}), got {:#}",
                id,
                verdict,
                record,
                err
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_fanout_tries_every_sink() {
        let memory = MemoryAlertSink::new();
        let fanout = FanoutSink::new().with(FailingSink).with(memory.clone());

        assert!(fanout.emit(&classification(3, Verdict::Anomaly)).await.is_err());
        assert_eq!(memory.anomalies().len(), 1);
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        assert!(LogAlertSink.emit(&classification(0, Verdict::Normal)).await.is_ok());
        assert!(LogAlertSink.emit(&classification(1, Verdict::Anomaly)).await.is_ok());
    }
}
