pub mod error;
pub mod initialization;
pub mod service;
pub mod sparsification;
pub mod storage;
pub mod tracking;

mod test;

pub use error::{Result, ServerErr};
