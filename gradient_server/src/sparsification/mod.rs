mod codec;
mod filter;
mod rate;

pub use codec::{SparseCodec, SparseVector, decode};
pub use filter::{MagnitudeMass, SparseFilter, TopK};
pub use rate::RetentionRate;
