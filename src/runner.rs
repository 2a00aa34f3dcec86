//! Offline pipelines: train a model from a dataset, and score a dataset with
//! a trained model.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::detect::{AnomalyDetector, Classification, ForestParams, IsolationForest, Trainable, Verdict};
use crate::storage::artifact::ModelArtifact;
use crate::telemetry::{project, Schema, TelemetryRecord};

/// Summary of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub rows: usize,
    pub trees: usize,
    pub subsample_size: usize,
    pub threshold: f64,
    /// Training rows scoring above the threshold.
    pub flagged: usize,
}

/// Train an isolation forest on `records` projected through `schema`.
///
/// Every training row must match the schema; a dataset with foreign rows is
/// rejected rather than silently thinned.
pub fn train(records: &[TelemetryRecord], schema: Schema, params: &ForestParams) -> Result<(ModelArtifact, TrainingReport)> {
    info!(rows = records.len(), features = schema.len(), "Training isolation forest");

    let features = records
        .iter()
        .enumerate()
        .map(|(row, r)| project(r, &schema).with_context(|| format!("training row {}", row)))
        .collect::<Result<Vec<_>>>()?;

    let model = IsolationForest::fit(&features, params).context("Failed to train model")?;
    let flagged = model
        .score_all(&features)?
        .into_iter()
        .filter(|&s| s > model.threshold())
        .count();

    let report = TrainingReport {
        rows: features.len(),
        trees: model.trees().len(),
        subsample_size: model.subsample_size(),
        threshold: model.threshold(),
        flagged,
    };
    info!(threshold = report.threshold, flagged = report.flagged, "Training complete");

    Ok((ModelArtifact::new(schema, params.clone(), features.len(), model), report))
}

/// Result of scoring a whole dataset.
#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub classifications: Vec<Classification>,
    /// Positions of rows that did not fit the model's schema.
    pub skipped: Vec<u64>,
}

impl DetectionReport {
    pub fn anomalies(&self) -> impl Iterator<Item = &Classification> {
        self.classifications
            .iter()
            .filter(|c| c.verdict == Verdict::Anomaly)
    }
}

/// Classify every record with a trained artifact.
pub fn detect(artifact: &ModelArtifact, records: Vec<TelemetryRecord>) -> DetectionReport {
    let mut report = DetectionReport::default();
    for (position, record) in records.into_iter().enumerate() {
        let position = position as u64;
        let scored = project(&record, &artifact.schema).and_then(|x| artifact.model.classify(&x));
        match scored {
            Ok((anomaly_score, verdict)) => report.classifications.push(Classification {
                position,
                record,
                anomaly_score,
                verdict,
            }),
            Err(e) => {
                warn!(position, error = %e, "skipping row that does not fit the model");
                report.skipped.push(position);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::synth::{generate, SynthSpec};

    #[test]
    fn test_train_then_detect() {
        let records = generate(&SynthSpec::default());
        let (artifact, report) = train(&records, Schema::default(), &ForestParams::default()).unwrap();
        assert_eq!(report.rows, 510);
        assert_eq!(report.trees, 100);
        assert!(report.flagged >= 10 && report.flagged <= 11);

        let detection = detect(&artifact, records);
        assert!(detection.skipped.is_empty());
        let extreme = detection.anomalies().filter(|c| c.position >= 500).count();
        assert!(extreme >= 9);
    }

    #[test]
    fn test_train_rejects_foreign_rows() {
        let mut records = generate(&SynthSpec {
            normal: 20,
            anomalies: 0,
            ..SynthSpec::default()
        });
        records[3].fields.remove("cpu_usage");
        let err = train(&records, Schema::default(), &ForestParams::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("training row 3"));
    }

    #[test]
    fn test_train_empty_dataset() {
        let err = train(&[], Schema::default(), &ForestParams::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("empty dataset"));
    }

    #[test]
    fn test_detect_skips_mismatched_rows() {
        let records = generate(&SynthSpec {
            normal: 40,
            anomalies: 0,
            ..SynthSpec::default()
        });
        let (artifact, _) = train(&records, Schema::default(), &ForestParams::default()).unwrap();

        let mut sample = records[..3].to_vec();
        sample[1].fields.insert("gpu_usage".to_string(), serde_json::json!(3.0));
        let report = detect(&artifact, sample);
        assert_eq!(report.skipped, vec![1]);
        assert_eq!(report.classifications.len(), 2);
    }
}
