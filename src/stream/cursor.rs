//! Stream positions and their persistence across monitor restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::storage::Pool;

/// Count of stream records already processed; the next unread offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamCursor(u64);

impl StreamCursor {
    pub const START: StreamCursor = StreamCursor(0);

    pub fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn position(self) -> u64 {
        self.0
    }

    /// Cursor after consuming `n` more records.
    #[must_use]
    pub fn advance(self, n: usize) -> Self {
        Self(self.0 + n as u64)
    }
}

impl std::fmt::Display for StreamCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable home for cursors, keyed by stream identity.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last saved cursor, or [`StreamCursor::START`] if none.
    async fn load(&self, stream_id: &str) -> Result<StreamCursor>;

    /// Persist `cursor`. Moving a cursor backwards is an error.
    async fn save(&self, stream_id: &str, cursor: StreamCursor) -> Result<()>;
}

/// Cursors in the `stream_cursors` table.
#[derive(Clone)]
pub struct SqliteCursorStore {
    pool: Pool,
}

impl SqliteCursorStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, stream_id: &str) -> Result<StreamCursor> {
        let pool = self.pool.clone();
        let stream_id = stream_id.to_string();
        tokio::task::spawn_blocking(move || load_cursor(&pool, &stream_id))
            .await
            .context("cursor load aborted")?
    }

    async fn save(&self, stream_id: &str, cursor: StreamCursor) -> Result<()> {
        let pool = self.pool.clone();
        let stream_id = stream_id.to_string();
        tokio::task::spawn_blocking(move || save_cursor(&pool, &stream_id, cursor))
            .await
            .context("cursor save aborted")?
    }
}

fn load_cursor(pool: &Pool, stream_id: &str) -> Result<StreamCursor> {
    let conn = pool.get()?;
    let position: Option<i64> = conn
        .query_row(
            "SELECT position FROM stream_cursors WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read stream cursor")?;
    Ok(StreamCursor::new(position.unwrap_or(0) as u64))
}

fn save_cursor(pool: &Pool, stream_id: &str, cursor: StreamCursor) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn
        .execute(
            "INSERT INTO stream_cursors (stream_id, position, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(stream_id) DO UPDATE
             SET position = excluded.position, updated_at = excluded.updated_at
             WHERE excluded.position >= stream_cursors.position",
            params![stream_id, cursor.position() as i64],
        )
        .context("Failed to save stream cursor")?;
    if changed == 0 {
        anyhow::bail!("refusing to move cursor for '{}' backwards to {}", stream_id, cursor);
    }
    Ok(())
}

/// Cursors held in process memory; lost on exit.
#[derive(Debug, Default, Clone)]
pub struct MemoryCursorStore {
    cursors: Arc<Mutex<HashMap<String, StreamCursor>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, stream_id: &str) -> Result<StreamCursor> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| anyhow::anyhow!("cursor store poisoned"))?;
        Ok(cursors.get(stream_id).copied().unwrap_or_default())
    }

    async fn save(&self, stream_id: &str, cursor: StreamCursor) -> Result<()> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| anyhow::anyhow!("cursor store poisoned"))?;
        let current = cursors.entry(stream_id.to_string()).or_default();
        if cursor < *current {
            anyhow::bail!("refusing to move cursor for '{}' backwards to {}", stream_id, cursor);
        }
        *current = cursor;
        Ok(())
    }
}
