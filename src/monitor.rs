use crate::models::Platform;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model_name: String,
    pub platform: Option<Platform>,
    pub prediction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_value: Option<f64>,
    pub latency_ms: f64,
    pub features: BTreeMap<String, f64>,
}

impl PredictionRecord {
    /// Prediction minus truth, once both are known.
    pub fn error(&self) -> Option<f64> {
        Some(self.prediction? - self.true_value?)
    }
}

/// A realised price reported after the fact for one logged prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthRecord {
    pub prediction_id: Uuid,
    pub true_value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Best-effort sink for served predictions. Implementations must not block or fail the caller.
pub trait PredictionLogger: Send + Sync {
    fn log(&self, record: PredictionRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPredictionLogger;

impl PredictionLogger for NoopPredictionLogger {
    fn log(&self, _record: PredictionRecord) {}
}

/// Appends records to a JSON-lines file from a background thread. Records are dropped, not
/// queued without bound, when the writer falls behind.
pub struct JsonlPredictionLogger {
    sender: Sender<PredictionRecord>,
    dropped: AtomicU64,
    writer: Option<JoinHandle<()>>,
}

impl JsonlPredictionLogger {
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open prediction log {}", path.display()))?;
        let (sender, receiver) = bounded(capacity.max(1));
        let writer = std::thread::Builder::new()
            .name("prediction-log".to_string())
            .spawn(move || write_records(receiver, BufWriter::new(file)))
            .context("Failed to start prediction log writer")?;
        Ok(Self {
            sender,
            dropped: AtomicU64::new(0),
            writer: Some(writer),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flushes queued records and stops the writer thread.
    pub fn close(self) {
        let Self { sender, writer, .. } = self;
        drop(sender);
        if let Some(handle) = writer {
            if handle.join().is_err() {
                warn!("Prediction log writer panicked");
            }
        }
    }
}

impl PredictionLogger for JsonlPredictionLogger {
    fn log(&self, record: PredictionRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    debug!("Prediction log full; {} record(s) dropped so far", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn write_records<W: Write>(receiver: Receiver<PredictionRecord>, mut out: W) {
    for record in receiver {
        let written = serde_json::to_writer(&mut out, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"));
        if let Err(err) = written {
            warn!("Failed to write prediction log record: {err}");
        }
    }
    if let Err(err) = out.flush() {
        warn!("Failed to flush prediction log: {err}");
    }
}

/// Reads a JSON-lines file written by this crate. A missing file is empty; lines that fail to
/// parse (a record cut off by a crash) are skipped with a warning.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to open {}", path.display()));
        }
    };
    let mut items = Vec::new();
    let mut skipped = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {} line {}", path.display(), idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(item) => items.push(item),
            Err(err) => {
                skipped += 1;
                debug!("{} line {} skipped: {err}", path.display(), idx + 1);
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} unreadable line(s) in {}", skipped, path.display());
    }
    Ok(items)
}

pub fn append_json_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for item in items {
        serde_json::to_writer(&mut out, item)
            .with_context(|| format!("Failed to serialize a record for {}", path.display()))?;
        out.write_all(b"\n")?;
    }
    out.flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

pub fn read_prediction_log(path: &Path) -> Result<Vec<PredictionRecord>> {
    read_json_lines(path)
}

/// Appends the realised price for `prediction_id` to the ground-truth file.
pub fn record_ground_truth(path: &Path, prediction_id: Uuid, true_value: f64) -> Result<GroundTruthRecord> {
    if !true_value.is_finite() || true_value < 0.0 {
        bail!("Ground truth must be a non-negative price, got {}", true_value);
    }
    let record = GroundTruthRecord {
        prediction_id,
        true_value,
        recorded_at: Utc::now(),
    };
    append_json_lines(path, std::slice::from_ref(&record))?;
    Ok(record)
}

/// Joins reported prices onto logged predictions by id; the latest report for an id wins.
/// Returns how many records gained a true value.
pub fn apply_ground_truth(records: &mut [PredictionRecord], truths: &[GroundTruthRecord]) -> usize {
    let mut latest: HashMap<Uuid, &GroundTruthRecord> = HashMap::new();
    for truth in truths {
        match latest.get(&truth.prediction_id) {
            Some(existing) if existing.recorded_at > truth.recorded_at => {}
            _ => {
                latest.insert(truth.prediction_id, truth);
            }
        }
    }
    let mut matched = 0usize;
    for record in records.iter_mut() {
        if let Some(truth) = latest.get(&record.id) {
            record.true_value = Some(truth.true_value);
            matched += 1;
        }
    }
    if matched < latest.len() {
        info!(
            "{} ground-truth report(s) refer to predictions outside the log",
            latest.len() - matched
        );
    }
    matched
}
