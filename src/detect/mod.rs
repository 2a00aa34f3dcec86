//! Anomaly scoring and alert routing.

pub mod alert;
pub mod forest;
pub mod tree;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::{FeatureVector, TelemetryRecord};

pub use self::forest::{ForestParams, IsolationForest};

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("cannot train on an empty dataset")]
    EmptyDataset,

    #[error("invalid training parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),
}

/// Outcome of classifying a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Normal,
    Anomaly,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Normal => f.pad("NORMAL"),
            Verdict::Anomaly => f.pad("ANOMALY"),
        }
    }
}

/// A scored record, produced per new stream entry and handed to the alert sinks.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    /// Zero-based position of the record in its stream.
    pub position: u64,
    pub record: TelemetryRecord,
    pub anomaly_score: f64,
    pub verdict: Verdict,
}

/// Capability shared by every scoring algorithm the monitor can drive.
pub trait AnomalyDetector: Send + Sync {
    /// Number of features every scored vector must carry.
    fn feature_count(&self) -> usize;

    /// Decision boundary; scores strictly above it are anomalous.
    fn threshold(&self) -> f64;

    fn score(&self, x: &[f64]) -> Result<f64, DetectError>;

    fn classify(&self, x: &[f64]) -> Result<(f64, Verdict), DetectError> {
        let score = self.score(x)?;
        let verdict = if score > self.threshold() {
            Verdict::Anomaly
        } else {
            Verdict::Normal
        };
        Ok((score, verdict))
    }
}

/// Detectors that can be trained offline from a feature matrix.
pub trait Trainable: AnomalyDetector + Sized {
    type Params;

    fn fit(features: &[FeatureVector], params: &Self::Params) -> Result<Self, DetectError>;
}
