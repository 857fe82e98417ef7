pub mod data;
pub mod epoch_stats;
pub mod runner;
pub mod train_config;

pub use data::TrainData;
pub use epoch_stats::EpochStats;
pub use runner::Runner;
pub use train_config::{TrainConfig, TrainSpec};
