use crate::tensor::TensorElem;
use std::fmt::Debug;

/// Common capability of every layer in this crate.
///
/// Layers are exclusively owned by one rank's control thread but must be `Send` so a rank thread
/// can be handed one, and `Sync` so a read-only layer can be shared with kernel worker threads.
pub trait Module<T: TensorElem>: Debug + Send + Sync {
    /// Number of parameter elements held *locally*.
    ///
    /// For a sharded layer this is the size of this rank's shards, not of the logical layer.
    fn num_parameters(&self) -> usize;
}
