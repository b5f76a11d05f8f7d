use crate::error::EstimatorError;
use crate::models::TrainingRecord;
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Reads a JSON-lines export of training records. Blank lines are skipped; a malformed line
/// fails the whole load with its line number.
pub fn load_training_records(path: &Path) -> Result<Vec<TrainingRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open training data {}", path.display()))?;
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut duplicates = 0usize;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line =
            line.with_context(|| format!("Failed to read {} line {}", path.display(), line_no))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: TrainingRecord = serde_json::from_str(trimmed).map_err(|err| {
            EstimatorError::InvalidDataset(format!(
                "{} line {}: {}",
                path.display(),
                line_no,
                err
            ))
        })?;
        if record.isbn.trim().is_empty() {
            return Err(EstimatorError::InvalidDataset(format!(
                "{} line {}: record has an empty isbn",
                path.display(),
                line_no
            ))
            .into());
        }
        if !seen.insert(record.isbn.clone()) {
            duplicates += 1;
        }
        records.push(record);
    }

    if duplicates > 0 {
        warn!(
            "{} contains {} repeated ISBN row(s); grouped splits keep them together",
            path.display(),
            duplicates
        );
    }
    info!(
        "Loaded {} training record(s) covering {} ISBN(s) from {}",
        records.len(),
        seen.len(),
        path.display()
    );
    Ok(records)
}

pub fn save_training_records(path: &Path, records: &[TrainingRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create training data {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)
            .with_context(|| format!("Failed to serialize record {}", record.isbn))?;
        out.write_all(b"\n")?;
    }
    out.flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}
