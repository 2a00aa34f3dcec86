//! SQLite storage layer: schema, telemetry table, and the model artifact store.

pub mod artifact;
pub mod schema;

use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::telemetry::TelemetryRecord;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Append records to the `telemetry` table in order, inside one transaction.
pub fn append_telemetry(pool: &Pool, records: &[TelemetryRecord]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO telemetry (timestamp, payload_json) VALUES (?1, ?2)")?;
        for record in records {
            // The timestamp lives in its own column; the payload keeps only fields.
            let payload = serde_json::to_string(&record.fields)?;
            stmt.execute(params![record.timestamp, payload])?;
        }
    }
    tx.commit()?;
    Ok(records.len())
}

/// Read every telemetry row in arrival order.
pub fn read_telemetry(pool: &Pool) -> Result<Vec<TelemetryRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT timestamp, payload_json FROM telemetry ORDER BY id")?;
    let rows = stmt.query_map([], row_to_record)?;

    let mut records = Vec::new();
    for r in rows {
        records.push(r?);
    }
    Ok(records)
}

pub(crate) fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TelemetryRecord> {
    let timestamp: Option<String> = row.get(0)?;
    let payload: String = row.get(1)?;
    let fields = match serde_json::from_str(&payload) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::warn!(error = %e, "telemetry row has an unreadable payload");
            Default::default()
        }
    };
    Ok(TelemetryRecord { timestamp, fields })
}
