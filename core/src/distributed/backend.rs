use crate::tensor::{Tensor, TensorElem, TensorError};
use std::fmt;
use thiserror::Error;

/// Failures of a collective operation.
///
/// None of these are retried: a collective that failed on one rank has usually left its peers
/// blocked or desynchronised, and recovering requires coordination outside the group.
#[derive(Error, Debug)]
pub enum CollectiveError {
    #[error("process group must have at least one rank")]
    EmptyGroup,
    /// A peer's end of the ring went away (its backend was dropped or its thread exited).
    #[error("rank {rank} disconnected from the ring")]
    Disconnected { rank: usize },
    /// The local communication worker stopped before completing a collective.
    #[error("communication worker of rank {rank} has shut down")]
    Shutdown { rank: usize },
    /// The peer sent a payload of a different type; the ranks issued different collectives.
    #[error("rank {rank} received a payload from a different collective; ranks are out of sync")]
    PayloadMismatch { rank: usize },
    #[error("rank {rank} received {got} elements, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
    #[error("broadcast root {root} is not a rank of a group of size {world_size}")]
    InvalidRoot { root: usize, world_size: usize },
    #[error("failed to spawn communication worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, CollectiveError>;

/// Abstraction for a distributed communication backend: the process group handle.
///
/// Every collective must be issued by every rank of the group, in the same order and with
/// matching shapes. A rank that skips or reorders a collective leaves its peers blocked; there is
/// no timeout.
///
/// Implementations:
/// - [`CpuBackend`](super::cpu_backend::CpuBackend): ranks are threads of one process connected
///   in a ring by channels.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Issues an element-wise sum across ranks and returns without waiting for it.
    ///
    /// The reduced tensor is only available through [`PendingReduce::wait`]. Collectives issued
    /// after this one are queued behind it.
    fn all_reduce_sum_async<T: TensorElem, const RANK: usize>(
        &self,
        tensor: Tensor<T, RANK>,
    ) -> Result<PendingReduce<T, RANK>>;

    /// Element-wise sum across ranks. The result is bit-identical on every rank.
    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        self.all_reduce_sum_async(tensor.clone())?.wait()
    }

    /// Concatenates every rank's tensor along `dim`, in rank order.
    fn all_gather<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        dim: usize,
    ) -> Result<Tensor<T, RANK>>;

    /// Returns `root`'s tensor on every rank. Non-root ranks pass a tensor of the same shape,
    /// whose values are ignored.
    fn broadcast<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        root: usize,
    ) -> Result<Tensor<T, RANK>>;
}

type WaitFn<T, const RANK: usize> = Box<dyn FnOnce() -> Result<Tensor<T, RANK>> + Send>;

/// Handle to an in-flight all-reduce.
///
/// Dropping it without waiting does not cancel the collective, it only discards the result.
#[must_use = "the reduced tensor is only available through `wait`"]
pub struct PendingReduce<T: TensorElem, const RANK: usize> {
    wait: WaitFn<T, RANK>,
}

impl<T: TensorElem, const RANK: usize> PendingReduce<T, RANK> {
    /// Wraps the function that blocks until the collective completes.
    pub fn deferred<F>(wait: F) -> Self
    where
        F: FnOnce() -> Result<Tensor<T, RANK>> + Send + 'static,
    {
        Self {
            wait: Box::new(wait),
        }
    }

    /// A handle whose result is already known (e.g. a group of one).
    pub fn ready(tensor: Tensor<T, RANK>) -> Self {
        Self::deferred(move || Ok(tensor))
    }

    /// Blocks until the reduction has completed and returns the reduced tensor.
    pub fn wait(self) -> Result<Tensor<T, RANK>> {
        (self.wait)()
    }
}

impl<T: TensorElem, const RANK: usize> fmt::Debug for PendingReduce<T, RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReduce").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_ready() {
        let t = Tensor::<f32, 1>::ones([3]);
        let pending = PendingReduce::ready(t.clone());
        assert_eq!(pending.wait().unwrap(), t);
    }

    #[test]
    fn test_pending_deferred_runs_on_wait() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let pending = PendingReduce::<f64, 1>::deferred(move || {
            rx.recv().map_err(|_| CollectiveError::Shutdown { rank: 0 })
        });
        tx.send(Tensor::full([2], 4.0)).unwrap();
        assert_eq!(pending.wait().unwrap().data(), &[4.0, 4.0]);
    }

    #[test]
    fn test_pending_propagates_error() {
        let pending =
            PendingReduce::<f32, 2>::deferred(|| Err(CollectiveError::Disconnected { rank: 1 }));
        assert!(matches!(
            pending.wait(),
            Err(CollectiveError::Disconnected { rank: 1 })
        ));
    }

    #[test]
    fn test_error_display() {
        let err = CollectiveError::InvalidRoot {
            root: 4,
            world_size: 2,
        };
        assert_eq!(
            err.to_string(),
            "broadcast root 4 is not a rank of a group of size 2"
        );
    }
}
