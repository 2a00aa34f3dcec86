//! Telemetry records, training schema, and feature projection.

pub mod dataset;
pub mod synth;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detect::DetectError;

/// Ordered numeric features derived from a [`TelemetryRecord`].
pub type FeatureVector = Vec<f64>;

/// Field names of the default host telemetry schema, in training order.
pub const HOST_FIELDS: [&str; 4] = ["cpu_usage", "memory_usage", "network_in", "network_out"];

/// One row of host telemetry.
///
/// The timestamp is carried through untouched and never scored; every other
/// key is a candidate feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl TelemetryRecord {
    pub fn new<I, K>(timestamp: Option<String>, values: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let fields = values
            .into_iter()
            .map(|(k, v)| (k.into(), Value::from(v)))
            .collect();
        Self { timestamp, fields }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }
}

/// Ordered list of numeric fields a model was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<String>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            fields: HOST_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Result<Self, DetectError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(DetectError::InvalidParameter(
                "schema must name at least one field".to_string(),
            ));
        }
        for (i, f) in fields.iter().enumerate() {
            if f == "timestamp" {
                return Err(DetectError::InvalidParameter(
                    "'timestamp' cannot be a feature".to_string(),
                ));
            }
            if fields[..i].contains(f) {
                return Err(DetectError::InvalidParameter(format!(
                    "duplicate schema field '{}'",
                    f
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Project every record, failing on the first mismatch.
    pub fn project_all(&self, records: &[TelemetryRecord]) -> Result<Vec<FeatureVector>, DetectError> {
        records.iter().map(|r| project(r, self)).collect()
    }
}

/// Map a record onto the schema's feature order.
///
/// The record must carry exactly the schema's fields (plus an optional
/// timestamp), each holding a finite number.
pub fn project(record: &TelemetryRecord, schema: &Schema) -> Result<FeatureVector, DetectError> {
    let mut vector = Vec::with_capacity(schema.len());
    for name in schema.fields() {
        let value = record
            .fields
            .get(name)
            .ok_or_else(|| DetectError::SchemaMismatch(format!("missing field '{}'", name)))?;
        let number = value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                DetectError::SchemaMismatch(format!("field '{}' is not numeric: {}", name, value))
            })?;
        vector.push(number);
    }

    if record.fields.len() != schema.len() {
        let unexpected: Vec<&str> = record
            .fields
            .keys()
            .filter(|k| !schema.fields.contains(k))
            .map(String::as_str)
            .collect();
        return Err(DetectError::SchemaMismatch(format!(
            "unexpected fields: {}",
            unexpected.join(", ")
        )));
    }

    Ok(vector)
}
