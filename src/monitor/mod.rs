//! Streaming monitor: polls a telemetry stream, scores new records, and
//! raises alerts.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Init -> Poll -> Fetched -> (Score -> Alert)* -> Advance -> Sleep -> Poll
//!              -> Idle -------------------------------------> Sleep
//!              -> FetchError -------------------------------> Sleep (backoff)
//! any state -> Stopped on cancellation
//! ```
//!
//! Cancellation is observed at the top of every poll and while sleeping. A
//! batch that has started is always finished, so the cursor never lands in
//! the middle of one.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::MonitorConfig;
use crate::detect::alert::AlertSink;
use crate::detect::{AnomalyDetector, Classification, Verdict};
use crate::storage::artifact::{ArtifactError, ModelStore};
use crate::stream::{CursorStore, StreamCursor, StreamSource};
use crate::telemetry::{project, Schema, TelemetryRecord};

pub use self::backoff::Backoff;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to load model: {0}")]
    ModelLoad(#[from] ArtifactError),

    #[error("model expects {model} features but its schema lists {schema}")]
    IncompatibleModel { model: usize, schema: usize },

    #[error("invalid monitor configuration: {0:#}")]
    InvalidConfig(anyhow::Error),

    #[error("failed to restore stream cursor: {0:#}")]
    CursorRestore(anyhow::Error),

    #[error("telemetry stream still unavailable after {attempts} consecutive attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    Init,
    Poll,
    Fetched,
    Idle,
    FetchError,
    Score,
    Alert,
    Advance,
    Sleep,
    Stopped,
}

/// What one poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Fetched(BatchSummary),
    Idle,
    FetchError { consecutive: u32 },
}

/// Result of a poll plus how long to sleep before the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub outcome: PollOutcome,
    pub sleep: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub start: StreamCursor,
    pub end: StreamCursor,
    pub anomalies: usize,
    /// Records rejected by projection or scoring. They still advance the cursor.
    pub skipped: usize,
    pub alert_failures: usize,
}

/// Running totals since the monitor started.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub polls: u64,
    pub records: u64,
    pub anomalies: u64,
    pub skipped: u64,
    pub fetch_errors: u64,
    pub alert_failures: u64,
}

pub struct Monitor {
    detector: Arc<dyn AnomalyDetector>,
    schema: Schema,
    source: Box<dyn StreamSource>,
    sink: Box<dyn AlertSink>,
    cursors: Box<dyn CursorStore>,
    stream_id: String,
    cursor: StreamCursor,
    backoff: Backoff,
    poll_interval: Duration,
    max_consecutive_errors: Option<u32>,
    state: MonitorState,
    stats: MonitorStats,
}

impl Monitor {
    /// Load the model artifact and restore the cursor.
    ///
    /// Fails if the artifact cannot be loaded; there is nothing to monitor
    /// with.
    pub async fn init(
        store: &dyn ModelStore,
        source: Box<dyn StreamSource>,
        sink: Box<dyn AlertSink>,
        cursors: Box<dyn CursorStore>,
        config: &MonitorConfig,
    ) -> Result<Self, MonitorError> {
        let artifact = store.load()?;
        Self::new(
            Arc::new(artifact.model),
            artifact.schema,
            source,
            sink,
            cursors,
            config,
        )
        .await
    }

    /// Build a monitor around an already-trained detector.
    pub async fn new(
        detector: Arc<dyn AnomalyDetector>,
        schema: Schema,
        source: Box<dyn StreamSource>,
        sink: Box<dyn AlertSink>,
        cursors: Box<dyn CursorStore>,
        config: &MonitorConfig,
    ) -> Result<Self, MonitorError> {
        if detector.feature_count() != schema.len() {
            return Err(MonitorError::IncompatibleModel {
                model: detector.feature_count(),
                schema: schema.len(),
            });
        }

        config.validate().map_err(MonitorError::InvalidConfig)?;
        let backoff = Backoff::new(
            config.backoff_base().map_err(MonitorError::InvalidConfig)?,
            config.backoff_max().map_err(MonitorError::InvalidConfig)?,
        );
        let poll_interval = config.poll_interval().map_err(MonitorError::InvalidConfig)?;

        let stream_id = source.stream_id();
        let cursor = if config.resume {
            cursors
                .load(&stream_id)
                .await
                .map_err(MonitorError::CursorRestore)?
        } else {
            StreamCursor::START
        };

        info!(
            stream = %stream_id,
            %cursor,
            threshold = detector.threshold(),
            "monitor initialized"
        );

        Ok(Self {
            detector,
            schema,
            source,
            sink,
            cursors,
            stream_id,
            cursor,
            backoff,
            poll_interval,
            max_consecutive_errors: config.max_consecutive_errors,
            state: MonitorState::Init,
            stats: MonitorStats::default(),
        })
    }

    pub fn cursor(&self) -> StreamCursor {
        self.cursor
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    fn transition(&mut self, next: MonitorState) {
        trace!(from = ?self.state, to = ?next, "monitor transition");
        self.state = next;
    }

    /// Poll until `cancel` fires or a fatal error occurs.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<MonitorStats, MonitorError> {
        info!(stream = %self.stream_id, "monitoring telemetry stream");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let cycle = match self.poll_once().await {
                Ok(cycle) => cycle,
                Err(e) => {
                    self.transition(MonitorState::Stopped);
                    return Err(e);
                }
            };

            self.transition(MonitorState::Sleep);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(cycle.sleep) => {}
            }
        }

        self.transition(MonitorState::Stopped);
        info!(
            cursor = %self.cursor,
            records = self.stats.records,
            anomalies = self.stats.anomalies,
            "monitor stopped"
        );
        Ok(self.stats.clone())
    }

    /// Run a single poll: fetch, classify, alert, advance.
    pub async fn poll_once(&mut self) -> Result<Cycle, MonitorError> {
        self.transition(MonitorState::Poll);
        self.stats.polls += 1;

        let batch = match self.source.fetch_since(self.cursor).await {
            Ok(batch) => batch,
            Err(e) => {
                self.transition(MonitorState::FetchError);
                self.stats.fetch_errors += 1;
                let delay = self.backoff.on_failure();
                let consecutive = self.backoff.consecutive_failures();

                if let Some(max) = self.max_consecutive_errors {
                    if consecutive > max {
                        error!(consecutive, error = %e, "giving up on telemetry stream");
                        return Err(MonitorError::RetriesExhausted {
                            attempts: consecutive,
                            last_error: e.to_string(),
                        });
                    }
                }

                warn!(consecutive, retry_in = ?delay, error = %e, "telemetry fetch failed");
                return Ok(Cycle {
                    outcome: PollOutcome::FetchError { consecutive },
                    sleep: delay,
                });
            }
        };

        self.backoff.on_success();

        if batch.is_empty() {
            self.transition(MonitorState::Idle);
            trace!(cursor = %self.cursor, "no new telemetry");
            return Ok(Cycle {
                outcome: PollOutcome::Idle,
                sleep: self.poll_interval,
            });
        }

        self.transition(MonitorState::Fetched);
        let summary = self.process_batch(batch).await;
        Ok(Cycle {
            outcome: PollOutcome::Fetched(summary),
            sleep: self.poll_interval,
        })
    }

    async fn process_batch(&mut self, batch: Vec<TelemetryRecord>) -> BatchSummary {
        let start = self.cursor;
        let count = batch.len();
        let mut summary = BatchSummary {
            start,
            end: start,
            anomalies: 0,
            skipped: 0,
            alert_failures: 0,
        };

        for (offset, record) in batch.into_iter().enumerate() {
            let position = start.position() + offset as u64;

            self.transition(MonitorState::Score);
            let scored = project(&record, &self.schema).and_then(|x| self.detector.classify(&x));
            let (anomaly_score, verdict) = match scored {
                Ok(scored) => scored,
                Err(e) => {
                    warn!(position, error = %e, "skipping record that does not fit the model");
                    summary.skipped += 1;
                    continue;
                }
            };
            if verdict == Verdict::Anomaly {
                summary.anomalies += 1;
            }

            self.transition(MonitorState::Alert);
            let classification = Classification {
                position,
                record,
                anomaly_score,
                verdict,
            };
            if let Err(e) = self.sink.emit(&classification).await {
                summary.alert_failures += 1;
                error!(position, error = %e, "failed to emit alert");
            }
        }

        self.transition(MonitorState::Advance);
        self.cursor = start.advance(count);
        summary.end = self.cursor;
        if let Err(e) = self.cursors.save(&self.stream_id, self.cursor).await {
            warn!(cursor = %self.cursor, error = %e, "failed to persist stream cursor");
        }

        self.stats.records += count as u64;
        self.stats.anomalies += summary.anomalies as u64;
        self.stats.skipped += summary.skipped as u64;
        self.stats.alert_failures += summary.alert_failures as u64;

        debug!(
            from = %summary.start,
            to = %summary.end,
            anomalies = summary.anomalies,
            skipped = summary.skipped,
            "batch processed"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::alert::MemoryAlertSink;
    use crate::detect::DetectError;
    use crate::stream::{MemoryCursorStore, MemorySource};

    /// Flags any record whose first feature exceeds 50.
    struct CutoffDetector;

    impl AnomalyDetector for CutoffDetector {
        fn feature_count(&self) -> usize {
            1
        }

        fn threshold(&self) -> f64 {
            0.5
        }

        fn score(&self, x: &[f64]) -> Result<f64, DetectError> {
            if x.len() != 1 {
                return Err(DetectError::SchemaMismatch("width".to_string()));
            }
            Ok(if x[0] > 50.0 { 0.9 } else { 0.1 })
        }
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl AlertSink for FailingSink {
        async fn emit(&self, _: &Classification) -> anyhow::Result<()> {
            anyhow::bail!("alert channel down")
        }
    }

    fn row(cpu: f64) -> TelemetryRecord {
        TelemetryRecord::new(None, [("cpu_usage", cpu)])
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_secs: 1.0,
            backoff_base_secs: 2.0,
            backoff_max_secs: 60.0,
            ..MonitorConfig::default()
        }
    }

    async fn monitor(
        source: &MemorySource,
        sink: Box<dyn AlertSink>,
        cursors: &MemoryCursorStore,
        config: &MonitorConfig,
    ) -> Monitor {
        Monitor::new(
            Arc::new(CutoffDetector),
            Schema::new(["cpu_usage"]).unwrap(),
            Box::new(source.clone()),
            sink,
            Box::new(cursors.clone()),
            config,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_batch_classified_in_order_and_cursor_persisted() {
        let source = MemorySource::new("t");
        let sink = MemoryAlertSink::new();
        let cursors = MemoryCursorStore::new();
        let mut m = monitor(&source, Box::new(sink.clone()), &cursors, &config()).await;

        let cycle = m.poll_once().await.unwrap();
        assert_eq!(cycle.outcome, PollOutcome::Idle);
        assert_eq!(cycle.sleep, Duration::from_secs(1));
        assert_eq!(m.state(), MonitorState::Idle);

        source.append([row(10.0), row(90.0), row(20.0)]);
        let cycle = m.poll_once().await.unwrap();
        match cycle.outcome {
            PollOutcome::Fetched(summary) => {
                assert_eq!(summary.end.position(), 3);
                assert_eq!(summary.anomalies, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(m.state(), MonitorState::Advance);

        let positions: Vec<u64> = sink.emitted().iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(sink.anomalies()[0].position, 1);
        assert_eq!(cursors.load("memory:t").await.unwrap().position(), 3);
    }

    #[tokio::test]
    async fn test_backoff_on_fetch_errors_then_reset() {
        let source = MemorySource::new("t");
        let cursors = MemoryCursorStore::new();
        let mut m = monitor(&source, Box::new(MemoryAlertSink::new()), &cursors, &config()).await;

        source.set_available(false);
        let mut sleeps = Vec::new();
        for _ in 0..3 {
            let cycle = m.poll_once().await.unwrap();
            assert!(matches!(cycle.outcome, PollOutcome::FetchError { .. }));
            sleeps.push(cycle.sleep.as_secs());
        }
        assert_eq!(sleeps, vec![2, 4, 8]);
        assert_eq!(m.cursor(), StreamCursor::START);

        source.set_available(true);
        assert_eq!(m.poll_once().await.unwrap().outcome, PollOutcome::Idle);

        source.set_available(false);
        assert_eq!(m.poll_once().await.unwrap().sleep, Duration::from_secs(2));
        assert_eq!(m.stats().fetch_errors, 4);
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_fatal() {
        let source = MemorySource::new("t");
        let cfg = MonitorConfig {
            max_consecutive_errors: Some(2),
            ..config()
        };
        let mut m = monitor(&source, Box::new(MemoryAlertSink::new()), &MemoryCursorStore::new(), &cfg).await;

        source.set_available(false);
        assert!(m.poll_once().await.is_ok());
        assert!(m.poll_once().await.is_ok());
        assert!(matches!(
            m.poll_once().await,
            Err(MonitorError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_schema_mismatch_skipped_but_counted() {
        let source = MemorySource::new("t");
        let sink = MemoryAlertSink::new();
        let mut m = monitor(&source, Box::new(sink.clone()), &MemoryCursorStore::new(), &config()).await;

        source.append([
            row(70.0),
            TelemetryRecord::new(None, [("memory_usage", 1.0)]),
            row(5.0),
        ]);
        m.poll_once().await.unwrap();

        assert_eq!(m.cursor().position(), 3);
        assert_eq!(m.stats().skipped, 1);
        let positions: Vec<u64> = sink.emitted().iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_alert_failure_does_not_block_cursor() {
        let source = MemorySource::new("t");
        let mut m = monitor(&source, Box::new(FailingSink), &MemoryCursorStore::new(), &config()).await;

        source.append([row(99.0), row(1.0)]);
        let cycle = m.poll_once().await.unwrap();
        match cycle.outcome {
            PollOutcome::Fetched(summary) => assert_eq!(summary.alert_failures, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(m.cursor().position(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_writes_leave_runtime_free_while_db_is_locked() -> anyhow::Result<()> {
        use crate::detect::alert::{list_recent, SqliteAlertSink};
        use crate::stream::SqliteCursorStore;

        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("locked.db");
        let pool = crate::storage::open_pool(&db_path.to_string_lossy())?;

        let source = MemorySource::new("t");
        let mut m = Monitor::new(
            Arc::new(CutoffDetector),
            Schema::new(["cpu_usage"])?,
            Box::new(source.clone()),
            Box::new(SqliteAlertSink::new(pool.clone(), "memory:t")),
            Box::new(SqliteCursorStore::new(pool.clone())),
            &config(),
        )
        .await?;

        // Another writer holds the database while the batch is processed.
        let locker = rusqlite::Connection::open(&db_path)?;
        locker.execute_batch("BEGIN EXCLUSIVE;")?;
        source.append([row(95.0)]);

        // On a single-threaded runtime the unlock below only gets to run if the
        // inserts wait off the runtime thread; otherwise they hit busy_timeout.
        let (cycle, released) = tokio::join!(m.poll_once(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            locker.execute_batch("COMMIT;")
        });
        released?;

        match cycle?.outcome {
            PollOutcome::Fetched(summary) => {
                assert_eq!(summary.anomalies, 1);
                assert_eq!(summary.alert_failures, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(list_recent(&pool, 10)?.len(), 1);
        assert_eq!(SqliteCursorStore::new(pool).load("memory:t").await?.position(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_restores_cursor() {
        let source = MemorySource::new("t");
        source.append([row(1.0), row(2.0)]);
        let cursors = MemoryCursorStore::new();
        cursors.save("memory:t", StreamCursor::new(1)).await.unwrap();

        let sink = MemoryAlertSink::new();
        let mut m = monitor(&source, Box::new(sink.clone()), &cursors, &config()).await;
        assert_eq!(m.cursor().position(), 1);
        m.poll_once().await.unwrap();
        assert_eq!(sink.emitted().len(), 1);

        let fresh = monitor(
            &source,
            Box::new(MemoryAlertSink::new()),
            &cursors,
            &MonitorConfig { resume: false, ..config() },
        )
        .await;
        assert_eq!(fresh.cursor(), StreamCursor::START);
    }

    #[tokio::test]
    async fn test_incompatible_model_rejected() {
        let result = Monitor::new(
            Arc::new(CutoffDetector),
            Schema::default(),
            Box::new(MemorySource::new("t")),
            Box::new(MemoryAlertSink::new()),
            Box::new(MemoryCursorStore::new()),
            &config(),
        )
        .await;
        assert!(matches!(result, Err(MonitorError::IncompatibleModel { model: 1, schema: 4 })));
    }

    #[tokio::test]
    async fn test_negative_poll_interval_rejected() {
        let result = Monitor::new(
            Arc::new(CutoffDetector),
            Schema::new(["cpu_usage"]).unwrap(),
            Box::new(MemorySource::new("t")),
            Box::new(MemoryAlertSink::new()),
            Box::new(MemoryCursorStore::new()),
            &MonitorConfig {
                poll_interval_secs: -1.0,
                ..config()
            },
        )
        .await;
        assert!(matches!(result, Err(MonitorError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let source = MemorySource::new("t");
        let sink = MemoryAlertSink::new();
        let mut m = monitor(&source, Box::new(sink.clone()), &MemoryCursorStore::new(), &config()).await;
        source.append([row(80.0)]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let stats = m.run(cancel).await.unwrap();
        assert_eq!(m.state(), MonitorState::Stopped);
        assert_eq!(stats.records, 1);
        assert_eq!(stats.anomalies, 1);
        assert!(stats.polls >= 2);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_cancelled() {
        let source = MemorySource::new("t");
        source.append([row(80.0)]);
        let sink = MemoryAlertSink::new();
        let mut m = monitor(&source, Box::new(sink.clone()), &MemoryCursorStore::new(), &config()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = m.run(cancel).await.unwrap();
        assert_eq!(stats.polls, 0);
        assert!(sink.emitted().is_empty());
        assert_eq!(m.state(), MonitorState::Stopped);
    }
}
