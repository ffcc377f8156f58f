use std::num::NonZeroU64;

use comms::specs::server::CheckpointSpec;

use crate::error::{Result, ServerErr};

/// The periodic schedule deciding when the warehouse takes a new snapshot.
///
/// Skipping a checkpoint never corrupts state, it only lengthens the time workers keep
/// streaming residuals against an older snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    primary_rank: usize,
    period: NonZeroU64,
    phase: u64,
    warmup: u64,
}

impl CheckpointPolicy {
    /// Creates a new `CheckpointPolicy` from its specification.
    ///
    /// # Arguments
    /// * `spec` - The checkpoint specification.
    /// * `workers` - The world size, the primary rank must be a worker rank in `1..workers`.
    ///
    /// # Returns
    /// A new `CheckpointPolicy` or an `InvalidSpec` error.
    pub fn new(spec: &CheckpointSpec, workers: usize) -> Result<Self> {
        let Some(period) = NonZeroU64::new(spec.period) else {
            return Err(ServerErr::InvalidSpec(
                "checkpoint period must be at least 1".into(),
            ));
        };

        if spec.phase >= spec.period {
            return Err(ServerErr::InvalidSpec(format!(
                "checkpoint phase {} must be lower than the period {}",
                spec.phase, spec.period
            )));
        }

        if !(1..workers).contains(&spec.primary_rank) {
            return Err(ServerErr::InvalidSpec(format!(
                "primary rank {} is not a worker rank in 1..{workers}",
                spec.primary_rank
            )));
        }

        Ok(Self {
            primary_rank: spec.primary_rank,
            period,
            phase: spec.phase,
            warmup: spec.warmup,
        })
    }

    /// Returns the only rank allowed to trigger checkpoints and set the learning rate.
    pub fn primary_rank(&self) -> usize {
        self.primary_rank
    }

    /// Decides whether the message just applied must trigger a checkpoint.
    ///
    /// # Arguments
    /// * `sender` - The rank that sent the message.
    /// * `max_version` - The highest version seen after applying the message.
    /// * `version` - The message's own version.
    pub fn should_checkpoint(&self, sender: usize, max_version: u64, version: u64) -> bool {
        sender == self.primary_rank
            && max_version % self.period.get() == self.phase
            && version > self.warmup
    }
}
