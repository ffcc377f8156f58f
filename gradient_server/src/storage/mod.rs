mod buffer;
mod warehouse;

pub use buffer::VectorBuffer;
pub use warehouse::{Applied, Checkpoint, GradientWarehouse};
