use std::sync::atomic::{AtomicU32, Ordering};

use comms::msg::{Msg, Payload};
use log::{debug, info};

use crate::{
    error::{Result, ServerErr},
    sparsification::{self, RetentionRate, SparseCodec, SparseFilter, SparseVector},
    storage::{Applied, Checkpoint, GradientWarehouse, VectorBuffer},
    tracking::{CheckpointPolicy, WorkerSyncTracker},
};

/// The rank the server uses as sender on its replies.
pub const SERVER_RANK: u32 = 0;

/// What the server sends back to a worker.
#[derive(Debug, PartialEq)]
pub enum Reply {
    /// A full model, either the global model or the synced snapshot.
    Model { version: u64, params: VectorBuffer },
    /// A sparse residual together with the current learning rate.
    Sparse {
        version: u64,
        lr: f32,
        sparse: SparseVector,
    },
}

impl Reply {
    /// Borrows this reply as a wire message.
    pub fn as_msg(&self) -> Msg<'_> {
        match self {
            Reply::Model { version, params } => Msg::Data {
                sender: SERVER_RANK,
                version: *version,
                payload: Payload::Model(params),
            },
            Reply::Sparse {
                version,
                lr,
                sparse,
            } => Msg::Data {
                sender: SERVER_RANK,
                version: *version,
                payload: Payload::SparseGradient {
                    lr: *lr,
                    indices: &sparse.indices,
                    values: &sparse.values,
                },
            },
        }
    }
}

/// Drives the warehouse and the tracker for every inbound worker message.
///
/// It's shared between all the worker sessions, every method takes `&self`.
pub struct GradientServer<F: SparseFilter> {
    warehouse: GradientWarehouse,
    tracker: WorkerSyncTracker,
    policy: CheckpointPolicy,
    codec: SparseCodec<F>,
    rate: RetentionRate,
    lr: AtomicU32,
}

impl<F: SparseFilter> GradientServer<F> {
    /// Creates a new `GradientServer`.
    ///
    /// # Arguments
    /// * `warehouse` - The store of the global model.
    /// * `workers` - The world size, workers hold ranks `1..workers`.
    /// * `policy` - The checkpoint schedule.
    /// * `filter` - The policy used to sparsify outbound residuals.
    /// * `rate` - The fraction of each residual to send.
    /// * `lr` - The initial learning rate.
    ///
    /// # Returns
    /// A new `GradientServer` instance.
    pub fn new(
        warehouse: GradientWarehouse,
        workers: usize,
        policy: CheckpointPolicy,
        filter: F,
        rate: RetentionRate,
        lr: f32,
    ) -> Self {
        Self {
            tracker: WorkerSyncTracker::new(warehouse.len(), workers),
            warehouse,
            policy,
            codec: SparseCodec::new(filter),
            rate,
            lr: AtomicU32::new(lr.to_bits()),
        }
    }

    pub fn warehouse(&self) -> &GradientWarehouse {
        &self.warehouse
    }

    pub fn tracker(&self) -> &WorkerSyncTracker {
        &self.tracker
    }

    /// Returns the current global learning rate.
    pub fn learning_rate(&self) -> f32 {
        f32::from_bits(self.lr.load(Ordering::Acquire))
    }

    /// Returns the model every worker gets as soon as its session opens.
    ///
    /// A rank's accumulator is zero until its first message, so handing it the synced snapshot
    /// keeps it consistent whether or not a checkpoint lands before that message.
    pub fn opening_model(&self) -> Reply {
        Reply::Model {
            version: 0,
            params: self.warehouse.snapshot(),
        }
    }

    /// Handles a single data message from a worker.
    ///
    /// # Arguments
    /// * `sender` - The rank of the worker.
    /// * `version` - The worker's version tag.
    /// * `payload` - The message's payload.
    ///
    /// # Returns
    /// The reply to send back if there is one, or the reason the message was dropped.
    pub fn handle(&self, sender: usize, version: u64, payload: Payload<'_>) -> Result<Option<Reply>> {
        match payload {
            Payload::Gradient(grad) => self.on_gradient(sender, version, grad).map(Some),
            Payload::SparseGradient {
                indices, values, ..
            } => self
                .on_sparse_gradient(sender, version, indices, values)
                .map(Some),
            Payload::LearningRate(lr) => {
                self.set_learning_rate(sender, lr)?;
                Ok(None)
            }
            other => Err(ServerErr::UnsupportedMessageKind { kind: other.kind() }),
        }
    }

    /// Applies a dense gradient and replies with the whole global model.
    fn on_gradient(&self, sender: usize, version: u64, grad: &[f32]) -> Result<Reply> {
        let state = self.tracker.state(sender)?;
        let mut state = state.lock();

        let (applied, params) = self.warehouse.apply_update_and_pull(sender, version, grad)?;
        self.log_applied(sender, version, &applied, "dense");

        state.align(&applied.residual)?;
        Ok(Reply::Model { version, params })
    }

    /// Applies a sparse gradient and replies with either the synced snapshot or a sparse residual.
    fn on_sparse_gradient(
        &self,
        sender: usize,
        version: u64,
        indices: &[u32],
        values: &[f32],
    ) -> Result<Reply> {
        let state = self.tracker.state(sender)?;
        let update = sparsification::decode(indices, values, self.warehouse.len())?;

        let mut state = state.lock();
        let applied = self.warehouse.apply_update(sender, version, &update)?;
        self.log_applied(sender, version, &applied, "sparse");

        let checkpoint = if self
            .policy
            .should_checkpoint(sender, applied.max_version, version)
        {
            Some(self.checkpoint(sender, applied.max_version)?)
        } else {
            None
        };

        if self.tracker.take_full_sync(sender) {
            state.reset();

            let params = match checkpoint {
                Some(checkpoint) => checkpoint.snapshot,
                None => self.warehouse.snapshot(),
            };

            debug!(sender = sender, version = version; "replying with the synced snapshot");
            return Ok(Reply::Model { version, params });
        }

        let sparse = state.stream(&applied.residual, &self.codec, self.rate)?;

        if let Some(checkpoint) = checkpoint {
            state.rebase(&checkpoint.shift)?;
        }

        debug!(sender = sender, version = version, pairs = sparse.len(); "replying with a sparse residual");

        Ok(Reply::Sparse {
            version,
            lr: self.learning_rate(),
            sparse,
        })
    }

    /// Rebases every worker onto a fresh snapshot.
    fn checkpoint(&self, trigger: usize, max_version: u64) -> Result<Checkpoint> {
        let checkpoint = self
            .tracker
            .checkpoint_with(trigger, || self.warehouse.checkpoint())?;

        info!(trigger = trigger, max_version = max_version; "checkpoint taken");
        Ok(checkpoint)
    }

    /// Replaces the global learning rate, only the primary rank may do so.
    fn set_learning_rate(&self, sender: usize, lr: f32) -> Result<()> {
        self.tracker.check_rank(sender)?;

        if sender != self.policy.primary_rank() {
            return Err(ServerErr::UnauthorizedLearningRate { rank: sender });
        }

        self.lr.store(lr.to_bits(), Ordering::Release);
        info!(sender = sender, lr = lr; "learning rate updated");
        Ok(())
    }

    fn log_applied(&self, sender: usize, version: u64, applied: &Applied, kind: &str) {
        debug!(
            sender = sender,
            version = version,
            staleness = applied.max_version.saturating_sub(version);
            "applied {kind} gradient"
        );
    }
}
