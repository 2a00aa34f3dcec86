//! In-process stream, used to drive the monitor without any storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::{StreamCursor, StreamError, StreamSource};
use crate::telemetry::TelemetryRecord;

/// Shared append-only buffer. Clones observe the same records, so a test can
/// keep one handle for appending while the monitor owns another.
#[derive(Debug, Clone)]
pub struct MemorySource {
    id: String,
    records: Arc<RwLock<Vec<TelemetryRecord>>>,
    available: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            records: Arc::new(RwLock::new(Vec::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn append(&self, records: impl IntoIterator<Item = TelemetryRecord>) {
        if let Ok(mut buf) = self.records.write() {
            buf.extend(records);
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate the stream going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StreamSource for MemorySource {
    fn stream_id(&self) -> String {
        format!("memory:{}", self.id)
    }

    async fn fetch_since(&self, cursor: StreamCursor) -> Result<Vec<TelemetryRecord>, StreamError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StreamError::Unavailable(format!("memory stream '{}' is offline", self.id)));
        }
        let records = self
            .records
            .read()
            .map_err(|_| StreamError::Unavailable("memory stream poisoned".to_string()))?;
        let start = (cursor.position() as usize).min(records.len());
        Ok(records[start..].to_vec())
    }
}
