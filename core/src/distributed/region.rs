use super::backend::CollectiveBackend;
use super::comm::{all_gather, reduce_sum, split};
use super::error::Result;
use crate::tensor::{Tensor, TensorElem};

/// Boundaries between replicated and sharded activations, with the collective each one costs
/// in the forward and in the backward direction.
///
/// | region    | forward          | backward         |
/// |-----------|------------------|------------------|
/// | `Copy`    | identity         | all-reduce       |
/// | `Reduce`  | all-reduce       | identity         |
/// | `Scatter` | split last dim   | all-gather       |
/// | `Gather`  | all-gather       | split last dim   |
///
/// The backward of each region is the forward of its [`adjoint`](ParallelRegion::adjoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelRegion {
    /// Entering a column-parallel layer: every rank consumes the same replicated input.
    Copy,
    /// Leaving a row-parallel layer: partial sums become a replicated output.
    Reduce,
    /// Entering a row-parallel layer with a replicated input.
    Scatter,
    /// Leaving a column-parallel layer with a replicated output.
    Gather,
}

impl ParallelRegion {
    pub fn adjoint(self) -> Self {
        match self {
            ParallelRegion::Copy => ParallelRegion::Reduce,
            ParallelRegion::Reduce => ParallelRegion::Copy,
            ParallelRegion::Scatter => ParallelRegion::Gather,
            ParallelRegion::Gather => ParallelRegion::Scatter,
        }
    }

    /// Whether the forward direction communicates.
    pub fn is_collective(self) -> bool {
        matches!(self, ParallelRegion::Reduce | ParallelRegion::Gather)
    }

    pub fn forward<B, T, const RANK: usize>(
        self,
        group: &B,
        x: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>>
    where
        B: CollectiveBackend,
        T: TensorElem,
    {
        let last = RANK.saturating_sub(1);
        match self {
            ParallelRegion::Copy => Ok(x.clone()),
            ParallelRegion::Reduce => reduce_sum(group, x),
            ParallelRegion::Scatter => split(group, x, last),
            ParallelRegion::Gather => all_gather(group, x, last),
        }
    }

    pub fn backward<B, T, const RANK: usize>(
        self,
        group: &B,
        grad: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>>
    where
        B: CollectiveBackend,
        T: TensorElem,
    {
        self.adjoint().forward(group, grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::cpu_backend::launch;

    #[test]
    fn test_adjoint_is_involution() {
        for r in [
            ParallelRegion::Copy,
            ParallelRegion::Reduce,
            ParallelRegion::Scatter,
            ParallelRegion::Gather,
        ] {
            assert_eq!(r.adjoint().adjoint(), r);
            assert_ne!(r.is_collective(), r.adjoint().is_collective());
        }
    }

    #[test]
    fn test_copy_backward_reduces() {
        let results = launch(2, |g| {
            let grad = Tensor::<f32, 2>::full([1, 2], (g.rank() + 1) as f32);
            let fwd = ParallelRegion::Copy.forward(g, &grad).unwrap();
            let bwd = ParallelRegion::Copy.backward(g, &grad).unwrap();
            (fwd, bwd)
        })
        .unwrap();
        assert_eq!(results[0].0.data(), &[1.0, 1.0]);
        assert_eq!(results[1].0.data(), &[2.0, 2.0]);
        assert!(results.iter().all(|(_, b)| b.data() == &[3.0, 3.0]));
    }

    #[test]
    fn test_gather_backward_splits() {
        let results = launch(2, |g| {
            let shard = Tensor::<f32, 2>::full([1, 2], g.rank() as f32);
            let full = ParallelRegion::Gather.forward(g, &shard).unwrap();
            let back = ParallelRegion::Gather.backward(g, &full).unwrap();
            (full, back == shard)
        })
        .unwrap();
        for (full, ok) in results {
            assert_eq!(full.data(), &[0.0, 0.0, 1.0, 1.0]);
            assert!(ok);
        }
    }
}
