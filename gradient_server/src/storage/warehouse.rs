use std::collections::HashMap;

use parking_lot::Mutex;

use super::VectorBuffer;
use crate::error::Result;

/// The state guarded by the warehouse lock.
///
/// The model and the snapshot live behind the same lock so an update can never land between
/// the read of the model and the write of the snapshot during a checkpoint.
#[derive(Debug)]
struct WarehouseState {
    global_model: VectorBuffer,
    synced_snapshot: VectorBuffer,
    max_version: u64,
    versions: HashMap<usize, u64>,
}

impl WarehouseState {
    fn apply(&mut self, rank: usize, version: u64, update: &[f32]) -> Result<()> {
        self.global_model.sub(update)?;
        self.max_version = self.max_version.max(version);

        let last = self.versions.entry(rank).or_default();
        *last = (*last).max(version);
        Ok(())
    }

    fn residual(&self) -> Result<VectorBuffer> {
        VectorBuffer::difference(&self.global_model, &self.synced_snapshot)
    }
}

/// The outcome of applying an update to the warehouse.
#[derive(Debug)]
pub struct Applied {
    /// Everything accumulated into the model since the last checkpoint.
    pub residual: VectorBuffer,
    /// The highest version seen from any rank, this update included.
    pub max_version: u64,
}

/// The outcome of a checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    /// A copy of the new synced snapshot.
    pub snapshot: VectorBuffer,
    /// The new snapshot minus the previous one.
    pub shift: VectorBuffer,
}

/// Owns the authoritative global model together with the snapshot taken at the last checkpoint.
///
/// Updates are applied unconditionally and in arrival order, every operation is a short
/// critical section over a single lock.
#[derive(Debug)]
pub struct GradientWarehouse {
    params: usize,
    state: Mutex<WarehouseState>,
}

impl GradientWarehouse {
    /// Creates a new `GradientWarehouse`.
    ///
    /// # Arguments
    /// * `initial` - The initial model, also used as the first synced snapshot.
    ///
    /// # Returns
    /// A new `GradientWarehouse` instance.
    pub fn new(initial: VectorBuffer) -> Self {
        let state = WarehouseState {
            synced_snapshot: initial.clone(),
            global_model: initial,
            max_version: 0,
            versions: HashMap::new(),
        };

        Self {
            params: state.global_model.len(),
            state: Mutex::new(state),
        }
    }

    /// Returns the amount of parameters in the model.
    pub fn len(&self) -> usize {
        self.params
    }

    /// Applies a descent step, `global_model -= update`.
    ///
    /// # Arguments
    /// * `rank` - The rank of the worker that sent the update.
    /// * `version` - The worker's version tag for this update.
    /// * `update` - The already scaled update.
    ///
    /// # Returns
    /// The residual against the synced snapshot at the same instant the update was applied,
    /// or a `DimensionMismatch` error leaving the model untouched.
    pub fn apply_update(&self, rank: usize, version: u64, update: &[f32]) -> Result<Applied> {
        let mut state = self.state.lock();
        state.apply(rank, version, update)?;

        Ok(Applied {
            residual: state.residual()?,
            max_version: state.max_version,
        })
    }

    /// Same as `apply_update` but also returns a copy of the resulting global model.
    ///
    /// # Arguments
    /// * `rank` - The rank of the worker that sent the update.
    /// * `version` - The worker's version tag for this update.
    /// * `update` - The already scaled update.
    ///
    /// # Returns
    /// The applied outcome and the model it belongs to.
    pub fn apply_update_and_pull(
        &self,
        rank: usize,
        version: u64,
        update: &[f32],
    ) -> Result<(Applied, VectorBuffer)> {
        let mut state = self.state.lock();
        state.apply(rank, version, update)?;

        let applied = Applied {
            residual: state.residual()?,
            max_version: state.max_version,
        };

        Ok((applied, state.global_model.clone()))
    }

    /// Copies the global model into the synced snapshot.
    ///
    /// # Returns
    /// The new snapshot and how far it moved from the previous one, or a `DimensionMismatch`
    /// error if the two buffers ever disagree in length.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        let mut state = self.state.lock();
        let shift = state.residual()?;

        let WarehouseState {
            global_model,
            synced_snapshot,
            ..
        } = &mut *state;
        synced_snapshot.copy_from(global_model)?;

        Ok(Checkpoint {
            snapshot: synced_snapshot.clone(),
            shift,
        })
    }

    /// Returns a copy of the synced snapshot.
    pub fn snapshot(&self) -> VectorBuffer {
        self.state.lock().synced_snapshot.clone()
    }

    /// Returns a copy of the global model.
    pub fn global_model(&self) -> VectorBuffer {
        self.state.lock().global_model.clone()
    }

    /// Returns the highest version seen so far.
    pub fn max_version(&self) -> u64 {
        self.state.lock().max_version
    }

    /// Returns the highest version applied from `rank`, if any.
    pub fn version_of(&self, rank: usize) -> Option<u64> {
        self.state.lock().versions.get(&rank).copied()
    }
}
