pub mod command;
pub mod filter2d;
pub mod model;
pub mod serialize;

pub use command::SEND_TO_ALL;
pub use filter2d::Filter2d;
pub use model::{Model, ModelRef};
