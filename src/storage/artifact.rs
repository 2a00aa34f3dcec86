//! Persisted model artifacts.
//!
//! An artifact is written once by `train` and read by every `watch` or
//! `detect` run afterwards. It bundles the trained forest with the schema the
//! features were projected from, so the monitor can project stream records
//! the same way.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detect::{AnomalyDetector, DetectError, ForestParams, IsolationForest};
use crate::telemetry::Schema;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to access model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model artifact is corrupt: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported model artifact version {found} (expected {expected})", expected = FORMAT_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("model artifact is invalid: {0}")]
    Invalid(#[from] DetectError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub trained_at: DateTime<Utc>,
    pub training_rows: usize,
    pub params: ForestParams,
    pub schema: Schema,
    pub model: IsolationForest,
}

impl ModelArtifact {
    pub fn new(schema: Schema, params: ForestParams, training_rows: usize, model: IsolationForest) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            trained_at: Utc::now(),
            training_rows,
            params,
            schema,
            model,
        }
    }
}

/// Load/save contract for model artifacts.
pub trait ModelStore: Send + Sync {
    fn load(&self) -> Result<ModelArtifact, ArtifactError>;
    fn save(&self, artifact: &ModelArtifact) -> Result<(), ArtifactError>;
}

/// Stores the artifact as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonModelStore {
    path: PathBuf,
}

impl JsonModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ModelStore for JsonModelStore {
    fn load(&self) -> Result<ModelArtifact, ArtifactError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;

        // Check the version before decoding the body so an old artifact reports
        // a version error rather than a shape error.
        #[derive(Deserialize)]
        struct Header {
            format_version: u32,
        }
        let header: Header = serde_json::from_str(&content)?;
        if header.format_version != FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: header.format_version,
            });
        }

        let artifact: ModelArtifact = serde_json::from_str(&content)?;
        artifact.model.validate()?;
        if artifact.schema.len() != artifact.model.feature_count() {
            return Err(ArtifactError::Invalid(DetectError::InvalidModel(format!(
                "schema lists {} fields but the model expects {} features",
                artifact.schema.len(),
                artifact.model.feature_count()
            ))));
        }

        info!(
            path = %self.path.display(),
            trees = artifact.model.trees().len(),
            features = artifact.schema.len(),
            "loaded model artifact"
        );
        Ok(artifact)
    }

    fn save(&self, artifact: &ModelArtifact) -> Result<(), ArtifactError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let json = serde_json::to_string_pretty(artifact)?;

        // Write then rename so readers never observe a half-written artifact.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;

        info!(path = %self.path.display(), "saved model artifact");
        Ok(())
    }
}
