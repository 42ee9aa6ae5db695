//! Optimisers.
//!
//! A tensor-parallel layer's shards are only ever mutated by its initialiser at construction and
//! by an [`Optimizer`] afterwards. Layers hand their shards to the optimiser through
//! `apply_gradients`, one parameter at a time.

pub mod sgd;
pub use sgd::Sgd;

use crate::tensor::{Result, Tensor, TensorElem};

/// Updates one parameter tensor from its gradient.
///
/// The update is purely local: every rank applies it to its own shard, so a sharded parameter
/// stays consistent with its logical tensor as long as the gradients are.
pub trait Optimizer<T: TensorElem> {
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `param` and `grad` differ in shape.
    fn update<const RANK: usize>(
        &self,
        param: &mut Tensor<T, RANK>,
        grad: &Tensor<T, RANK>,
    ) -> Result<()>;
}
