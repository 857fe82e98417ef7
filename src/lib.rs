pub mod activation;
pub mod buffer;
pub mod error;
pub mod layers;
pub mod loss;
pub mod math;
pub mod metrics;
pub mod model;
pub mod network;
pub mod optim;
pub mod train;
pub mod variables;

// Convenience re-exports
pub use activation::ActivationFunction;
pub use buffer::{DataType, FrameBuffer};
pub use error::{Error, Result};
pub use loss::{LossFunction, LossType};
pub use metrics::MetricsFunction;
pub use model::{Filter2d, Model, ModelRef};
pub use network::Sequential;
pub use optim::{Adam, Optimizer, Sgd};
pub use train::{EpochStats, Runner, TrainConfig, TrainData};
pub use variables::{Tensor, TensorRef, Variables};
