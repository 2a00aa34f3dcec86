//! Seeded synthetic host telemetry.
//!
//! Normal rows are uniform over the usual operating range; injected anomalies
//! pin CPU and memory near saturation and push network traffic well above
//! anything normal rows produce.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::TelemetryRecord;

#[derive(Debug, Clone)]
pub struct SynthSpec {
    pub normal: usize,
    pub anomalies: usize,
    pub seed: u64,
    pub include_timestamps: bool,
    pub start: DateTime<Utc>,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            normal: 500,
            anomalies: 10,
            seed: 42,
            include_timestamps: true,
            start: Utc::now(),
        }
    }
}

const CPU_NORMAL: (f64, f64) = (0.0, 100.0);
const MEMORY_NORMAL: (f64, f64) = (0.0, 100.0);
const NET_NORMAL: (f64, f64) = (0.0, 1000.0);

const CPU_ANOMALY: (f64, f64) = (90.0, 100.0);
const MEMORY_ANOMALY: (f64, f64) = (90.0, 100.0);
const NET_ANOMALY: (f64, f64) = (2000.0, 3000.0);

fn draw(rng: &mut StdRng, (lo, hi): (f64, f64)) -> f64 {
    (rng.gen_range(lo..=hi) * 100.0).round() / 100.0
}

/// Generate `spec.normal` normal rows followed by `spec.anomalies` extreme rows.
pub fn generate(spec: &SynthSpec) -> Vec<TelemetryRecord> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let total = spec.normal + spec.anomalies;
    let mut records = Vec::with_capacity(total);

    for i in 0..total {
        let (cpu, mem, net) = if i < spec.normal {
            (CPU_NORMAL, MEMORY_NORMAL, NET_NORMAL)
        } else {
            (CPU_ANOMALY, MEMORY_ANOMALY, NET_ANOMALY)
        };
        let timestamp = spec.include_timestamps.then(|| {
            (spec.start + Duration::seconds(i as i64))
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string()
        });
        records.push(TelemetryRecord::new(
            timestamp,
            [
                ("cpu_usage", draw(&mut rng, cpu)),
                ("memory_usage", draw(&mut rng, mem)),
                ("network_in", draw(&mut rng, net)),
                ("network_out", draw(&mut rng, net)),
            ],
        ));
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_counts_and_ranges() {
        let spec = SynthSpec {
            normal: 50,
            anomalies: 5,
            ..SynthSpec::default()
        };
        let rows = generate(&spec);
        assert_eq!(rows.len(), 55);
        for r in &rows[..50] {
            assert!(r.get("network_in").unwrap() <= 1000.0);
        }
        for r in &rows[50..] {
            assert!(r.get("cpu_usage").unwrap() >= 90.0);
            assert!(r.get("network_out").unwrap() >= 2000.0);
        }
    }

    #[test]
    fn test_generate_is_seeded() {
        let spec = SynthSpec {
            normal: 20,
            anomalies: 2,
            include_timestamps: false,
            ..SynthSpec::default()
        };
        assert_eq!(generate(&spec), generate(&spec));
        assert!(generate(&spec)[0].timestamp.is_none());
    }
}
