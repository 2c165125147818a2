//! Per-epoch training history

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, TrainerError};

/// Metrics of one completed epoch. Accuracies are fractions in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// One-based epoch number
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub duration_secs: f64,
    /// Training images left out under the skip policy
    pub skipped_images: usize,
}

/// Ordered record of every epoch of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Epoch with the highest validation accuracy (earliest on ties)
    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs.iter().fold(None, |best, m| match best {
            Some(b) if b.val_accuracy >= m.val_accuracy => Some(b),
            _ => Some(m),
        })
    }

    pub fn to_csv(&self) -> String {
        let mut out =
            String::from("epoch,loss,accuracy,val_loss,val_accuracy,duration_secs,skipped_images\n");
        for m in &self.epochs {
            let _ = writeln!(
                out,
                "{},{:.6},{:.6},{:.6},{:.6},{:.3},{}",
                m.epoch,
                m.loss,
                m.accuracy,
                m.val_loss,
                m.val_accuracy,
                m.duration_secs,
                m.skipped_images
            );
        }
        out
    }

    /// Write the CSV rendering, creating parent directories as needed
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TrainerError::write(parent, e))?;
        }
        std::fs::write(path, self.to_csv()).map_err(|e| TrainerError::write(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics(epoch: usize, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss: 1.0 / epoch as f64,
            accuracy: 0.5,
            val_loss: 0.9,
            val_accuracy,
            duration_secs: 2.0,
            skipped_images: 0,
        }
    }

    #[test]
    fn test_best_epoch() {
        let mut history = TrainingHistory::new();
        assert!(history.best().is_none());

        history.push(metrics(1, 0.4));
        history.push(metrics(2, 0.7));
        history.push(metrics(3, 0.7));
        history.push(metrics(4, 0.6));

        assert_eq!(history.best().unwrap().epoch, 2);
        assert_eq!(history.last().unwrap().epoch, 4);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_csv_export() {
        let mut history = TrainingHistory::new();
        history.push(metrics(1, 0.25));
        history.push(metrics(2, 0.5));

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reports").join("history.csv");
        history.save_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,loss,accuracy"));
        assert!(lines[1].starts_with("1,1.000000,0.500000,0.900000,0.250000"));
        assert!(lines[2].starts_with("2,0.500000"));
    }
}
