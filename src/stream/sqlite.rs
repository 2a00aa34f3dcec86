//! Telemetry rows in the SQLite `telemetry` table, ordered by insertion id.

use super::{StreamCursor, StreamError, StreamSource};
use crate::storage::{row_to_record, Pool};
use crate::telemetry::TelemetryRecord;

#[derive(Clone)]
pub struct SqliteSource {
    pool: Pool,
    name: String,
}

impl SqliteSource {
    pub fn new(pool: Pool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl StreamSource for SqliteSource {
    fn stream_id(&self) -> String {
        format!("sqlite:{}", self.name)
    }

    async fn fetch_since(&self, cursor: StreamCursor) -> Result<Vec<TelemetryRecord>, StreamError> {
        let pool = self.pool.clone();
        let offset = cursor.position() as i64;

        // Spawn blocking task for DB query
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<TelemetryRecord>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT timestamp, payload_json FROM telemetry ORDER BY id LIMIT -1 OFFSET ?1",
            )?;
            let rows = stmt.query_map([offset], row_to_record)?;

            let mut records = Vec::new();
            for r in rows {
                records.push(r?);
            }
            Ok(records)
        })
        .await
        .map_err(|e| StreamError::Unavailable(format!("telemetry query aborted: {}", e)))?
        .map_err(|e| StreamError::Unavailable(format!("{:#}", e)))
    }
}
