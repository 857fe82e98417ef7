use serde::{Serialize, Deserialize};

/// Per-epoch training statistics emitted by the [`Runner`](super::Runner).
///
/// When a `progress_tx` channel is configured in `TrainConfig`, one value is
/// sent at the end of every completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Total epochs requested for this run.
    pub total_epochs: usize,
    /// Mean training loss per frame over this epoch.
    pub train_loss: f64,
    /// Training metric (categorical accuracy) over this epoch.
    pub train_accuracy: f64,
    /// Loss on the test split, if one was provided.
    pub test_loss: Option<f64>,
    pub test_accuracy: Option<f64>,
    /// Wall-clock duration of this single epoch in milliseconds.
    pub elapsed_ms: u64,
}
