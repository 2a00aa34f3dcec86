//! Telemetry appended to a JSON-lines file by an external writer.

use std::path::PathBuf;

use tracing::debug;

use super::{StreamCursor, StreamError, StreamSource};
use crate::telemetry::dataset::{complete_lines, parse_line};
use crate::telemetry::TelemetryRecord;

/// Each complete, non-blank line is one stream position.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl StreamSource for JsonLinesSource {
    fn stream_id(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    async fn fetch_since(&self, cursor: StreamCursor) -> Result<Vec<TelemetryRecord>, StreamError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            StreamError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let records: Vec<TelemetryRecord> = complete_lines(&content)
            .skip(cursor.position() as usize)
            .map(parse_line)
            .collect();

        debug!(path = %self.path.display(), %cursor, new = records.len(), "read telemetry file");
        Ok(records)
    }
}
