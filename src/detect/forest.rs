//! Isolation forest ensemble: training, scoring, and threshold calibration.
//!
//! Anomalies are few and different, so random axis-aligned splits separate
//! them from the rest of the data after only a handful of cuts. The score of a
//! vector is derived from its mean isolation depth across the ensemble,
//! normalized by the expected depth for a sample of the same size:
//!
//! ```text
//! score(x) = 2^(-E[h(x)] / c(subsample_size))
//! ```
//!
//! Scores near 1 mean short paths (anomalous), scores near 0.5 mean paths of
//! the length expected for uniformly spread data.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tree::{average_path_length, IsolationTree};
use super::{AnomalyDetector, DetectError, Trainable};
use crate::telemetry::FeatureVector;

/// Training parameters for [`IsolationForest::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    /// Number of trees in the ensemble.
    pub tree_count: usize,
    /// Rows drawn (with replacement) to grow each tree.
    pub subsample_size: usize,
    /// Expected fraction of anomalous rows in the training data, in (0, 1).
    pub contamination_rate: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            tree_count: 100,
            subsample_size: 256,
            contamination_rate: 0.02,
            seed: 42,
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.tree_count == 0 {
            return Err(DetectError::InvalidParameter(
                "tree_count must be at least 1".to_string(),
            ));
        }
        if self.subsample_size < 2 {
            return Err(DetectError::InvalidParameter(
                "subsample_size must be at least 2".to_string(),
            ));
        }
        if !(self.contamination_rate > 0.0 && self.contamination_rate < 1.0) {
            return Err(DetectError::InvalidParameter(format!(
                "contamination_rate must lie in (0, 1), got {}",
                self.contamination_rate
            )));
        }
        Ok(())
    }

    /// Depth limit for each tree: `ceil(log2(subsample_size))`.
    pub fn max_depth(&self) -> usize {
        (self.subsample_size as f64).log2().ceil() as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
    feature_count: usize,
    threshold: f64,
}

impl IsolationForest {
    pub fn trees(&self) -> &[IsolationTree] {
        &self.trees
    }

    pub fn subsample_size(&self) -> usize {
        self.subsample_size
    }

    /// Mean isolation depth of `x` across all trees.
    fn mean_path_length(&self, x: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        total / self.trees.len() as f64
    }

    /// Check that the forest can score any vector of `feature_count` values.
    ///
    /// `fit` always produces a valid forest; this is for forests decoded from
    /// disk.
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.trees.is_empty() {
            return Err(DetectError::InvalidModel("forest has no trees".to_string()));
        }
        if self.subsample_size < 2 {
            return Err(DetectError::InvalidModel(format!(
                "subsample_size must be at least 2, got {}",
                self.subsample_size
            )));
        }
        if self.feature_count == 0 {
            return Err(DetectError::InvalidModel("feature_count must be at least 1".to_string()));
        }
        if !self.threshold.is_finite() {
            return Err(DetectError::InvalidModel(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            if let Some(feature) = tree.max_split_feature().filter(|&f| f >= self.feature_count) {
                return Err(DetectError::InvalidModel(format!(
                    "tree {} splits on feature {} but the model has {} features",
                    i, feature, self.feature_count
                )));
            }
        }
        Ok(())
    }

    /// Score every vector, failing on the first one of the wrong width.
    pub fn score_all(&self, features: &[FeatureVector]) -> Result<Vec<f64>, DetectError> {
        features.iter().map(|x| self.score(x)).collect()
    }
}

impl AnomalyDetector for IsolationForest {
    fn feature_count(&self) -> usize {
        self.feature_count
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, x: &[f64]) -> Result<f64, DetectError> {
        if x.len() != self.feature_count {
            return Err(DetectError::SchemaMismatch(format!(
                "expected {} features, got {}",
                self.feature_count,
                x.len()
            )));
        }
        let normalizer = average_path_length(self.subsample_size);
        Ok(2f64.powf(-self.mean_path_length(x) / normalizer))
    }
}

impl Trainable for IsolationForest {
    type Params = ForestParams;

    fn fit(features: &[FeatureVector], params: &ForestParams) -> Result<Self, DetectError> {
        params.validate()?;
        let first = features.first().ok_or(DetectError::EmptyDataset)?;
        let feature_count = first.len();
        if feature_count == 0 {
            return Err(DetectError::InvalidParameter(
                "feature vectors must not be empty".to_string(),
            ));
        }
        for (row, x) in features.iter().enumerate() {
            if x.len() != feature_count {
                return Err(DetectError::SchemaMismatch(format!(
                    "row {} has {} features, expected {}",
                    row,
                    x.len(),
                    feature_count
                )));
            }
            if x.iter().any(|v| !v.is_finite()) {
                return Err(DetectError::InvalidParameter(format!(
                    "row {} contains a non-finite value",
                    row
                )));
            }
        }

        let max_depth = params.max_depth();
        let mut seeds = StdRng::seed_from_u64(params.seed);
        let trees: Vec<IsolationTree> = (0..params.tree_count)
            .map(|_| {
                let mut rng = StdRng::seed_from_u64(seeds.gen());
                let sample: Vec<usize> = (0..params.subsample_size)
                    .map(|_| rng.gen_range(0..features.len()))
                    .collect();
                IsolationTree::grow(features, sample, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            subsample_size: params.subsample_size,
            feature_count,
            threshold: 0.0,
        };

        let mut scores = forest.score_all(features)?;
        scores.sort_by(f64::total_cmp);
        forest.threshold = quantile(&scores, 1.0 - params.contamination_rate);

        debug!(
            trees = params.tree_count,
            subsample_size = params.subsample_size,
            max_depth,
            threshold = forest.threshold,
            "isolation forest trained"
        );

        Ok(forest)
    }
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
