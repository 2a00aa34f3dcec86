//! JSON-lines telemetry files: one record object per line.

use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use super::TelemetryRecord;

/// Decode one line of a telemetry file.
///
/// Lines that are not JSON objects still stand for one stream position; they
/// decode to an empty record, which projection later rejects.
pub fn parse_line(line: &str) -> TelemetryRecord {
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "telemetry line has an invalid shape");
                TelemetryRecord::default()
            }
        },
        Ok(_) => {
            warn!("telemetry line is not a JSON object");
            TelemetryRecord::default()
        }
        Err(e) => {
            warn!(error = %e, "telemetry line is not valid JSON");
            TelemetryRecord::default()
        }
    }
}

/// Split file content into complete, non-blank lines.
///
/// A trailing fragment without a newline is a write still in progress and is
/// left out.
pub fn complete_lines(content: &str) -> impl Iterator<Item = &str> {
    let complete = match content.rfind('\n') {
        Some(idx) => &content[..=idx],
        None => "",
    };
    complete.lines().filter(|l| !l.trim().is_empty())
}

/// Read every complete record from a JSON-lines file.
pub fn read_jsonl(path: &Path) -> Result<Vec<TelemetryRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read telemetry file: {}", path.display()))?;
    Ok(complete_lines(&content).map(parse_line).collect())
}

/// Write records as JSON lines, replacing the file.
pub fn write_jsonl(path: &Path, records: &[TelemetryRecord]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create telemetry file: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Append records to a JSON-lines file, creating it if needed.
pub fn append_jsonl(path: &Path, records: &[TelemetryRecord]) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open telemetry file: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
