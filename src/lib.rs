//! hostwatch -- host telemetry anomaly detection.
//!
//! This crate provides an isolation-forest anomaly model trained offline on
//! host telemetry (CPU, memory, network I/O), and a streaming monitor that
//! scores newly appended records and raises alerts.

pub mod config;
pub mod detect;
pub mod monitor;
pub mod runner;
pub mod storage;
pub mod stream;
pub mod telemetry;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{HostwatchConfig, StreamKind};
use crate::detect::alert::{FanoutSink, LogAlertSink, SqliteAlertSink};
use crate::monitor::{Monitor, MonitorStats};
use crate::storage::artifact::JsonModelStore;
use crate::stream::{JsonLinesSource, SqliteCursorStore, SqliteSource, StreamSource};

/// Run the monitor until `cancel` fires: load the model, restore the cursor,
/// and poll the configured stream.
pub async fn watch(config: &HostwatchConfig, cancel: CancellationToken) -> Result<MonitorStats> {
    // 1. Initialize Storage
    let db_path = config.storage.db_path.to_string_lossy().into_owned();
    if let Some(parent) = config.storage.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    // 2. Stream source
    let source: Box<dyn StreamSource> = match config.stream.kind {
        StreamKind::Jsonl => Box::new(JsonLinesSource::new(&config.stream.path)),
        StreamKind::Sqlite => Box::new(SqliteSource::new(pool.clone(), &config.stream.name)),
    };

    // 3. Alert sinks
    let sink = FanoutSink::new().with(LogAlertSink).with(
        SqliteAlertSink::new(pool.clone(), source.stream_id())
            .with_normal(config.monitor.persist_normal),
    );

    // 4. Load model and start monitoring
    let store = JsonModelStore::new(&config.model.path);
    let mut monitor = Monitor::init(
        &store,
        source,
        Box::new(sink),
        Box::new(SqliteCursorStore::new(pool)),
        &config.monitor,
    )
    .await?;

    Ok(monitor.run(cancel).await?)
}
