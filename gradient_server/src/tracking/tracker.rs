use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    error::{Result, ServerErr},
    sparsification::{RetentionRate, SparseCodec, SparseFilter, SparseVector},
    storage::VectorBuffer,
};

/// The reply mode a worker is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// The worker receives sparse residuals.
    Streaming,
    /// The worker's next reply must be the full synced snapshot.
    PendingFullSync,
}

/// The send side bookkeeping of a single worker.
///
/// Invariant: the worker's local model equals the synced snapshot plus `accumulated_sent`.
#[derive(Debug)]
pub struct WorkerState {
    accumulated_sent: VectorBuffer,
}

impl WorkerState {
    fn new(params: usize) -> Self {
        Self {
            accumulated_sent: VectorBuffer::zeros(params),
        }
    }

    /// Returns everything pushed to this worker since its last full sync.
    pub fn accumulated_sent(&self) -> &[f32] {
        &self.accumulated_sent
    }

    /// Forgets everything sent, used right after the worker receives the full snapshot.
    pub fn reset(&mut self) {
        self.accumulated_sent.zero();
    }

    /// Computes the next sparse payload for this worker.
    ///
    /// Sends what is still owed, `residual - accumulated_sent`, and advances the accumulator
    /// only by what survived sparsification so dropped coordinates are carried to later rounds.
    ///
    /// # Arguments
    /// * `residual` - The global model minus the synced snapshot.
    /// * `codec` - The codec used to sparsify the payload.
    /// * `rate` - The fraction of coordinates to keep.
    ///
    /// # Returns
    /// The sparse payload or a `DimensionMismatch` error.
    pub fn stream<F: SparseFilter>(
        &mut self,
        residual: &[f32],
        codec: &SparseCodec<F>,
        rate: RetentionRate,
    ) -> Result<SparseVector> {
        let mut to_send = VectorBuffer::difference(residual, &self.accumulated_sent)?;
        let sparse = codec.encode(to_send.as_mut_slice(), rate);
        self.accumulated_sent.add(&to_send, 1.)?;
        Ok(sparse)
    }

    /// Moves the accumulator to a new snapshot, `accumulated_sent -= shift`.
    ///
    /// # Arguments
    /// * `shift` - The new snapshot minus the old one.
    pub fn rebase(&mut self, shift: &[f32]) -> Result<()> {
        self.accumulated_sent.sub(shift)
    }

    /// Records that the worker was handed the full global model.
    ///
    /// # Arguments
    /// * `residual` - The global model that was sent minus the synced snapshot.
    pub fn align(&mut self, residual: &[f32]) -> Result<()> {
        self.accumulated_sent.copy_from(residual)
    }
}

/// Tracks, per worker rank, whether it must be resynchronized and what was already sent to it.
///
/// Ranks are validated against `1..workers` and their state is created on first contact.
/// The pending set has its own lock, separate from the per rank states, so marking every rank
/// at checkpoint time is atomic with respect to any single rank checking its own flag.
#[derive(Debug)]
pub struct WorkerSyncTracker {
    params: usize,
    workers: usize,
    unsynced: Mutex<HashSet<usize>>,
    states: RwLock<HashMap<usize, Arc<Mutex<WorkerState>>>>,
}

impl WorkerSyncTracker {
    /// Creates a new `WorkerSyncTracker`.
    ///
    /// # Arguments
    /// * `params` - The amount of parameters of the model.
    /// * `workers` - The world size, workers hold ranks `1..workers`.
    ///
    /// # Returns
    /// A new `WorkerSyncTracker` instance.
    pub fn new(params: usize, workers: usize) -> Self {
        Self {
            params,
            workers,
            unsynced: Mutex::new(HashSet::new()),
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Checks that `rank` is a worker rank.
    ///
    /// # Returns
    /// An `UnknownSender` error if `rank` is outside `1..workers`.
    pub fn check_rank(&self, rank: usize) -> Result<()> {
        if !(1..self.workers).contains(&rank) {
            return Err(ServerErr::UnknownSender {
                rank,
                workers: self.workers,
            });
        }

        Ok(())
    }

    /// Returns the state of `rank`, creating it on first contact.
    ///
    /// # Arguments
    /// * `rank` - The worker's rank.
    ///
    /// # Returns
    /// The shared state or an `UnknownSender` error.
    pub fn state(&self, rank: usize) -> Result<Arc<Mutex<WorkerState>>> {
        self.check_rank(rank)?;

        if let Some(state) = self.states.read().get(&rank) {
            return Ok(Arc::clone(state));
        }

        let mut states = self.states.write();
        let state = states
            .entry(rank)
            .or_insert_with(|| Arc::new(Mutex::new(WorkerState::new(self.params))));

        Ok(Arc::clone(state))
    }

    /// Returns the current reply mode of `rank`.
    pub fn mode(&self, rank: usize) -> SyncMode {
        if self.unsynced.lock().contains(&rank) {
            SyncMode::PendingFullSync
        } else {
            SyncMode::Streaming
        }
    }

    /// Takes a checkpoint and marks every worker rank except `trigger` under the pending set lock.
    ///
    /// A rank that applies its update after `checkpoint` ran can only check its own flag once
    /// the marks are in, so it never streams a residual taken against the new snapshot.
    /// Ranks that were already pending stay pending, `trigger` included. Nothing is marked if
    /// `checkpoint` fails.
    ///
    /// # Arguments
    /// * `trigger` - The rank whose message triggered the checkpoint.
    /// * `checkpoint` - Replaces the synced snapshot.
    ///
    /// # Returns
    /// Whatever `checkpoint` returned.
    pub fn checkpoint_with<T>(
        &self,
        trigger: usize,
        checkpoint: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let mut unsynced = self.unsynced.lock();
        let out = checkpoint()?;
        unsynced.extend((1..self.workers).filter(|&rank| rank != trigger));
        Ok(out)
    }

    /// Leaves the pending state if `rank` is in it.
    ///
    /// # Returns
    /// Whether `rank` was pending, the caller must then send the full snapshot.
    pub fn take_full_sync(&self, rank: usize) -> bool {
        self.unsynced.lock().remove(&rank)
    }

    /// Returns the pending ranks in ascending order.
    pub fn unsynced(&self) -> Vec<usize> {
        let mut ranks: Vec<_> = self.unsynced.lock().iter().copied().collect();
        ranks.sort_unstable();
        ranks
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::sparsification::TopK;

    #[test]
    fn test_unknown_sender() {
        let tracker = WorkerSyncTracker::new(2, 4);

        assert!(tracker.state(1).is_ok());
        assert!(tracker.state(3).is_ok());
        assert!(matches!(
            tracker.state(0),
            Err(ServerErr::UnknownSender { rank: 0, workers: 4 })
        ));
        assert!(tracker.state(4).is_err());
    }

    #[test]
    fn test_state_is_created_once() {
        let tracker = WorkerSyncTracker::new(2, 3);

        let state = tracker.state(2).unwrap();
        state.lock().align(&[1., 2.]).unwrap();

        let again = tracker.state(2).unwrap();
        assert!(Arc::ptr_eq(&state, &again));
        assert_eq!(again.lock().accumulated_sent(), [1., 2.]);
    }

    #[test]
    fn test_invalidate_and_take() {
        let tracker = WorkerSyncTracker::new(1, 5);

        tracker.checkpoint_with(1, || Ok(())).unwrap();
        assert_eq!(tracker.unsynced(), vec![2, 3, 4]);
        assert_eq!(tracker.mode(1), SyncMode::Streaming);
        assert_eq!(tracker.mode(3), SyncMode::PendingFullSync);

        assert!(tracker.take_full_sync(3));
        assert!(!tracker.take_full_sync(3));
        assert_eq!(tracker.mode(3), SyncMode::Streaming);

        tracker.checkpoint_with(2, || Ok(())).unwrap();
        assert_eq!(tracker.unsynced(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_checkpoint_marks_before_releasing() {
        let tracker = WorkerSyncTracker::new(1, 4);

        let (mode_tx, mode_rx) = mpsc::channel();
        let out = thread::scope(|s| {
            let marked = tracker
                .checkpoint_with(1, || {
                    let tracker = &tracker;
                    let mode_tx = mode_tx.clone();
                    s.spawn(move || mode_tx.send(tracker.take_full_sync(2)).unwrap());

                    thread::sleep(Duration::from_millis(50));
                    assert!(mode_rx.try_recv().is_err());
                    Ok(7)
                })
                .unwrap();

            assert!(mode_rx.recv().unwrap());
            marked
        });

        assert_eq!(out, 7);
        assert_eq!(tracker.unsynced(), vec![3]);

        let err = tracker.checkpoint_with(2, || -> Result<()> {
            Err(ServerErr::InvalidSpec("no snapshot".into()))
        });
        assert!(err.is_err());
        assert_eq!(tracker.unsynced(), vec![3]);
    }

    #[test]
    fn test_stream_tracks_only_what_was_sent() {
        let codec = SparseCodec::new(TopK);
        let rate = RetentionRate::new(0.5).unwrap();
        let mut state = WorkerState::new(4);

        let residual = [4., -3., 2., 1.];

        let sent = state.stream(&residual, &codec, rate).unwrap();
        assert_eq!(sent.indices, vec![0, 1]);
        assert_eq!(state.accumulated_sent(), [4., -3., 0., 0.]);

        let sent = state.stream(&residual, &codec, rate).unwrap();
        assert_eq!(sent.indices, vec![2, 3]);
        assert_eq!(state.accumulated_sent(), residual);

        let sent = state.stream(&residual, &codec, rate).unwrap();
        assert!(sent.is_empty());
    }

    #[test]
    fn test_reset_and_rebase() {
        let mut state = WorkerState::new(2);
        state.align(&[3., 3.]).unwrap();

        state.rebase(&[1., 2.]).unwrap();
        assert_eq!(state.accumulated_sent(), [2., 1.]);

        state.reset();
        assert_eq!(state.accumulated_sent(), [0., 0.]);

        assert!(state.rebase(&[1.]).is_err());
    }
}
