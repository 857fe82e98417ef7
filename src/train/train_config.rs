use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::mpsc;
use std::sync::{atomic::AtomicBool, Arc};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::loss::loss_type::LossType;
use crate::train::epoch_stats::EpochStats;

/// Serializable part of a training run, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSpec {
    pub epochs: usize,
    pub batch_size: usize,
    pub loss_type: LossType,
    /// Seed for mini-batch shuffling.
    #[serde(default)]
    pub seed: u64,
    /// Save the network to `<runner name>.bin` after every epoch.
    #[serde(default)]
    pub file_write: bool,
}

impl TrainSpec {
    pub fn load_json(path: &str) -> Result<TrainSpec> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }

    pub fn save_json(&self, path: &str) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Configuration for a [`Runner::fitting`](super::Runner::fitting) run.
///
/// # Fields
/// - `spec`: epochs, batch size, loss, seed and file output
/// - `progress_tx`: optional channel sender; one `EpochStats` is sent per
///   completed epoch. If the receiver is dropped the run ends early.
/// - `stop_flag`: optional atomic flag; when set to `true` from another
///   thread the run ends after the current epoch.
#[derive(Debug)]
pub struct TrainConfig {
    pub spec: TrainSpec,
    pub progress_tx: Option<mpsc::Sender<EpochStats>>,
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl TrainConfig {
    /// Creates a minimal `TrainConfig` with no progress channel and no stop flag.
    pub fn new(epochs: usize, batch_size: usize, loss_type: LossType) -> Self {
        TrainConfig::from_spec(TrainSpec {
            epochs,
            batch_size,
            loss_type,
            seed: 1,
            file_write: false,
        })
    }

    pub fn from_spec(spec: TrainSpec) -> Self {
        TrainConfig {
            spec,
            progress_tx: None,
            stop_flag: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.spec.seed = seed;
        self
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<EpochStats>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: TrainSpec =
            serde_json::from_str(r#"{"epochs": 3, "batch_size": 16, "loss_type": "cross_entropy"}"#)
                .unwrap();
        assert_eq!(spec.loss_type, LossType::CrossEntropy);
        assert_eq!(spec.seed, 0);
        assert!(!spec.file_write);
    }

    #[test]
    fn test_spec_json_file_round_trip() {
        let path = std::env::temp_dir().join("bitbrain_train_spec.json");
        let path = path.to_str().unwrap();
        let config = TrainConfig::new(5, 8, LossType::Mse).with_seed(42);
        config.spec.save_json(path).unwrap();
        assert_eq!(TrainSpec::load_json(path).unwrap(), config.spec);
        std::fs::remove_file(path).ok();
    }
}
