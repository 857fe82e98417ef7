pub mod tensor;
pub mod variables;

pub use tensor::Tensor;
pub use variables::{tensor_ref, TensorRef, Variables};
