use anyhow::Result;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// `numerator / denominator`, or `None` when nothing was counted.
pub fn guarded_ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator > 0.0 {
        Some(numerator / denominator)
    } else {
        None
    }
}

/// Per-phase accumulators, reset at the start of every train / validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMetrics {
    /// Sum of per-batch mean losses
    pub loss_sum: f64,
    pub correct: u64,
    pub tokens: u64,
    pub batches: u64,
}

impl RunningMetrics {
    pub fn record(&mut self, loss: f64, correct: u64, tokens: u64) {
        self.loss_sum += loss;
        self.correct += correct;
        self.tokens += tokens;
        self.batches += 1;
    }

    pub fn accuracy(&self) -> Option<f64> {
        guarded_ratio(self.correct as f64, self.tokens as f64)
    }

    pub fn mean_batch_loss(&self) -> Option<f64> {
        guarded_ratio(self.loss_sum, self.batches as f64)
    }

    pub fn to_array(&self) -> [f64; 4] {
        [
            self.loss_sum,
            self.correct as f64,
            self.tokens as f64,
            self.batches as f64,
        ]
    }

    pub fn from_array(values: &[f64]) -> Self {
        let get = |i: usize| values.get(i).copied().unwrap_or(0.0);
        Self {
            loss_sum: get(0),
            correct: get(1).round() as u64,
            tokens: get(2).round() as u64,
            batches: get(3).round() as u64,
        }
    }
}

/// One structured record per epoch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: Option<f64>,
    pub val_loss: f64,
    pub val_accuracy: Option<f64>,
}

impl EpochRecord {
    pub fn new(epoch: usize, train: &RunningMetrics, val: &RunningMetrics) -> Self {
        Self {
            epoch,
            train_loss: train.loss_sum,
            train_accuracy: train.accuracy(),
            val_loss: val.loss_sum,
            val_accuracy: val.accuracy(),
        }
    }
}

/// Run metadata written once before the first epoch.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub project: String,
    pub architecture: &'static str,
    pub dataset: String,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub ff_hidden_layer: usize,
    pub dropout: f64,
    pub num_layers: usize,
}

/// Destination for per-epoch metrics.
pub trait MetricsSink {
    fn log_run(&mut self, run: &RunRecord) -> Result<()>;

    fn log_epoch(&mut self, record: &EpochRecord) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Run(&'a RunRecord),
    Epoch(&'a EpochRecord),
}

/// Appends JSON lines to a file.
pub struct JsonlMetricsSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetricsSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn log_run(&mut self, run: &RunRecord) -> Result<()> {
        self.write_line(&Line::Run(run))
    }

    fn log_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        self.write_line(&Line::Epoch(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_ratio() {
        assert_eq!(guarded_ratio(3.0, 4.0), Some(0.75));
        assert_eq!(guarded_ratio(0.0, 0.0), None);
    }

    #[test]
    fn test_running_metrics() {
        let mut metrics = RunningMetrics::default();
        assert_eq!(metrics.accuracy(), None);
        metrics.record(1.5, 3, 4);
        metrics.record(0.5, 1, 4);
        assert_eq!(metrics.loss_sum, 2.0);
        assert_eq!(metrics.accuracy(), Some(0.5));
        assert_eq!(metrics.mean_batch_loss(), Some(1.0));
        assert_eq!(RunningMetrics::from_array(&metrics.to_array()), metrics);
    }

    #[test]
    fn test_jsonl_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics").join("run.jsonl");
        let mut sink = JsonlMetricsSink::create(&path).unwrap();

        let mut train = RunningMetrics::default();
        train.record(2.0, 1, 2);
        let val = RunningMetrics::default();
        sink.log_epoch(&EpochRecord::new(1, &train, &val)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["kind"], "epoch");
        assert_eq!(line["epoch"], 1);
        assert_eq!(line["train_accuracy"], 0.5);
        assert!(line["val_accuracy"].is_null());
    }
}
