//! Train on synthetic telemetry, then stream the extreme rows through the
//! monitor and check which alerts come out.

use std::sync::Arc;

use anyhow::Result;
use hostwatch::config::MonitorConfig;
use hostwatch::detect::alert::MemoryAlertSink;
use hostwatch::detect::{AnomalyDetector, ForestParams, Verdict};
use hostwatch::monitor::{Monitor, PollOutcome};
use hostwatch::runner;
use hostwatch::storage::artifact::{JsonModelStore, ModelStore};
use hostwatch::stream::{JsonLinesSource, MemoryCursorStore, MemorySource, SqliteCursorStore, StreamCursor};
use hostwatch::telemetry::dataset::append_jsonl;
use hostwatch::telemetry::synth::{generate, SynthSpec};
use hostwatch::telemetry::{project, Schema};
use tokio_test::assert_ok;

fn dataset() -> Vec<hostwatch::telemetry::TelemetryRecord> {
    generate(&SynthSpec {
        normal: 500,
        anomalies: 10,
        seed: 42,
        ..SynthSpec::default()
    })
}

fn params() -> ForestParams {
    ForestParams {
        tree_count: 100,
        subsample_size: 256,
        contamination_rate: 0.02,
        seed: 42,
    }
}

#[tokio::test]
async fn test_train_then_stream_extreme_rows() -> Result<()> {
    let records = dataset();
    let (artifact, _) = runner::train(&records, Schema::default(), &params())?;
    let extremes = records[500..].to_vec();

    // Offline: at least 9 of the 10 extreme rows sit above the threshold.
    let expected: Vec<u64> = extremes
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            let x = project(r, &artifact.schema).unwrap();
            artifact.model.score(&x).unwrap() > artifact.model.threshold()
        })
        .map(|(i, _)| i as u64)
        .collect();
    assert!(expected.len() >= 9, "only {} extreme rows above threshold", expected.len());

    // Online: empty stream, then two batches of five.
    let source = MemorySource::new("e2e");
    let sink = MemoryAlertSink::new();
    let mut monitor = Monitor::new(
        Arc::new(artifact.model.clone()),
        artifact.schema.clone(),
        Box::new(source.clone()),
        Box::new(sink.clone()),
        Box::new(MemoryCursorStore::new()),
        &MonitorConfig::default(),
    )
    .await?;

    assert_eq!(assert_ok!(monitor.poll_once().await).outcome, PollOutcome::Idle);
    assert_eq!(monitor.cursor(), StreamCursor::START);

    source.append(extremes[..5].to_vec());
    assert_ok!(monitor.poll_once().await);
    assert_eq!(monitor.cursor().position(), 5);

    source.append(extremes[5..].to_vec());
    assert_ok!(monitor.poll_once().await);
    assert_eq!(monitor.cursor().position(), 10);

    let emitted = sink.emitted();
    let all: Vec<u64> = emitted.iter().map(|c| c.position).collect();
    assert_eq!(all, (0..10).collect::<Vec<_>>());

    let alerted: Vec<u64> = emitted
        .iter()
        .filter(|c| c.verdict == Verdict::Anomaly)
        .map(|c| c.position)
        .collect();
    assert_eq!(alerted, expected);
    Ok(())
}

#[tokio::test]
async fn test_watch_file_stream_resumes_after_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("model.json");
    let stream_path = dir.path().join("stream.jsonl");
    let db_path = dir.path().join("hostwatch.db");

    let records = dataset();
    let (artifact, _) = runner::train(&records, Schema::default(), &params())?;
    let store = JsonModelStore::new(&model_path);
    store.save(&artifact)?;

    std::fs::write(&stream_path, "")?;
    append_jsonl(&stream_path, &records[495..505])?;

    let pool = hostwatch::storage::open_pool(&db_path.to_string_lossy())?;
    let config = MonitorConfig::default();

    let first = MemoryAlertSink::new();
    let mut monitor = Monitor::init(
        &store,
        Box::new(JsonLinesSource::new(&stream_path)),
        Box::new(first.clone()),
        Box::new(SqliteCursorStore::new(pool.clone())),
        &config,
    )
    .await?;
    assert_ok!(monitor.poll_once().await);
    assert_eq!(monitor.cursor().position(), 10);
    assert_eq!(first.emitted().len(), 10);
    drop(monitor);

    // A restarted monitor only sees what was appended since.
    append_jsonl(&stream_path, &records[505..])?;
    let second = MemoryAlertSink::new();
    let mut monitor = Monitor::init(
        &store,
        Box::new(JsonLinesSource::new(&stream_path)),
        Box::new(second.clone()),
        Box::new(SqliteCursorStore::new(pool)),
        &config,
    )
    .await?;
    assert_eq!(monitor.cursor().position(), 10);
    assert_ok!(monitor.poll_once().await);

    let positions: Vec<u64> = second.emitted().iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![10, 11, 12, 13, 14]);
    assert!(second.anomalies().len() >= 4);
    Ok(())
}

#[tokio::test]
async fn test_missing_model_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonModelStore::new(dir.path().join("absent.json"));
    let result = Monitor::init(
        &store,
        Box::new(MemorySource::new("x")),
        Box::new(MemoryAlertSink::new()),
        Box::new(MemoryCursorStore::new()),
        &MonitorConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(hostwatch::monitor::MonitorError::ModelLoad(_))));
}
