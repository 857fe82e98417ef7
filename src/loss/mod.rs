pub mod cross_entropy;
pub mod loss_function;
pub mod loss_type;
pub mod mse;

pub use cross_entropy::LossCrossEntropyWithSoftmax;
pub use loss_function::LossFunction;
pub use loss_type::LossType;
pub use mse::LossMeanSquaredError;
