pub mod activation;
pub mod batch_norm;
pub mod binary_conversion;
pub mod binary_lut;
pub mod convolution;
pub mod dense;
pub mod depthwise;
pub mod lowering;
pub mod micro_mlp;
pub mod pooling;
pub(crate) mod rows;
pub mod sparse;
pub mod stochastic_lut;

pub use activation::ActivationLayer;
pub use batch_norm::BatchNormalization;
pub use binary_conversion::{BinaryToReal, RealToBinary};
pub use binary_lut::{BinaryLut, BinaryLut6, LutLayerData, LutNodeData};
pub use convolution::Convolution;
pub use dense::DenseAffine;
pub use depthwise::DepthwiseDenseAffine;
pub use lowering::LoweringConvolution;
pub use micro_mlp::{MicroMlp, MicroMlp6, MicroMlpAffine};
pub use pooling::MaxPooling;
pub use sparse::SparseModel;
pub use stochastic_lut::{StochasticLut, StochasticLut6};
