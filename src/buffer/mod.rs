pub mod accessor;
pub mod data_type;
pub mod frame_buffer;
pub mod shape;

pub use accessor::{FrameAccessor, FrameAccessorMut};
pub use data_type::{DataType, Element, Fixed16};
pub use frame_buffer::FrameBuffer;
pub use shape::{linear_index, shape_size, unravel_index};
