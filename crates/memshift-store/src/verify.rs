use memshift_types::VerificationReport;
use serde_json::Value;
use tracing::warn;

use crate::{MemoryBackend, SqliteSource, StoreResult};

/// How many of the earliest source rows get content-checked against the
/// target.
pub const SAMPLE_SIZE: u64 = 5;

/// Count both sides and content-check a small sample. Never fails; internal
/// errors are logged and reported as a non-matching sample.
pub fn verify_migration<B: MemoryBackend + ?Sized>(
    source: &SqliteSource,
    backend: &B,
) -> VerificationReport {
    let mut report = VerificationReport {
        source_count: 0,
        target_count: 0,
        counts_match: false,
        sample_verification: false,
    };

    report.source_count = match source.count() {
        Ok(count) => count,
        Err(err) => {
            warn!(%err, "source count failed during verification");
            return report;
        }
    };
    report.target_count = match backend.count_entries() {
        Ok(count) => count,
        Err(err) => {
            warn!(%err, "target count failed during verification");
            return report;
        }
    };
    report.counts_match = report.source_count == report.target_count;

    report.sample_verification = match sample_matches(source, backend) {
        Ok(matched) => matched,
        Err(err) => {
            warn!(%err, "sample verification errored");
            false
        }
    };
    report
}

fn sample_matches<B: MemoryBackend + ?Sized>(
    source: &SqliteSource,
    backend: &B,
) -> StoreResult<bool> {
    let rows = source.page(SAMPLE_SIZE, 0)?;
    for raw in &rows {
        let id = match text_field(&raw.id) {
            Some(id) => id,
            None => {
                warn!("sampled source row has no usable id");
                return Ok(false);
            }
        };
        let entry = match backend.retrieve(&id)? {
            Some(entry) => entry,
            None => {
                warn!(%id, "sampled row missing from target");
                return Ok(false);
            }
        };
        let checks = [
            ("agent_id", text_field(&raw.agent_id), &entry.agent_id),
            ("session_id", text_field(&raw.session_id), &entry.session_id),
            ("content", text_field(&raw.content), &entry.content),
        ];
        for (field, expected, actual) in checks {
            if expected.as_deref() != Some(actual.as_str()) {
                warn!(%id, field, "sampled row differs from target");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn text_field(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => Some(text.clone()),
        _ => None,
    }
}
