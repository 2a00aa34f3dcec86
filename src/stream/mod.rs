//! Append-only telemetry streams and the cursor that walks them.
//!
//! A source only ever answers one question: which records exist at or after
//! a given position. Emptiness is a normal answer; failing to read the
//! stream at all is [`StreamError::Unavailable`], which the monitor retries.

pub mod cursor;
pub mod jsonl;
pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::telemetry::TelemetryRecord;

pub use self::cursor::{CursorStore, MemoryCursorStore, SqliteCursorStore, StreamCursor};
pub use self::jsonl::JsonLinesSource;
pub use self::memory::MemorySource;
pub use self::sqlite::SqliteSource;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("telemetry stream unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view over an append-only telemetry stream.
#[async_trait::async_trait]
pub trait StreamSource: Send + Sync {
    /// Stable identity of the stream, used to key persisted cursors.
    fn stream_id(&self) -> String;

    /// All records at or after `cursor`, in arrival order.
    ///
    /// Calling this twice with the same cursor and no appends in between
    /// returns the same records.
    async fn fetch_since(&self, cursor: StreamCursor) -> Result<Vec<TelemetryRecord>, StreamError>;
}
