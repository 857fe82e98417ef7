pub mod accuracy;
pub mod metrics_function;

pub use accuracy::{argmax, MetricsCategoricalAccuracy};
pub use metrics_function::MetricsFunction;
