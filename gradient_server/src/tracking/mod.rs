mod policy;
mod tracker;

pub use policy::CheckpointPolicy;
pub use tracker::{SyncMode, WorkerState, WorkerSyncTracker};
