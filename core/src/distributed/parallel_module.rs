use super::backend::CollectiveBackend;
use super::error::{ParallelError, Result};
use crate::nn::{Linear, LinearGrads, Module};
use crate::tensor::{Tensor, TensorElem};
use tracing::warn;

/// Shared capability of the column- and row-parallel layers.
///
/// The process group is passed to every call that may communicate; a layer only remembers which
/// `(rank, world_size)` it was built for and rejects calls made with any other group.
pub trait ParallelModule<T: TensorElem>: Module<T> + Sized {
    type Config;

    /// Shards a dense layer, keeping its trained values.
    ///
    /// Returns [`Conversion::Unsharded`] with `dense` untouched when the sharded dimension is
    /// smaller than the world size.
    fn from_dense<B: CollectiveBackend>(
        dense: Linear<T>,
        group: &B,
        config: Self::Config,
    ) -> Result<Conversion<Self, T>>;

    /// Re-draws this rank's shards from the layer's initialisers.
    fn reset_parameters<B: CollectiveBackend>(&mut self, group: &B) -> Result<()>;

    fn forward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
    ) -> Result<ParallelOutput<T, RANK>>;

    /// Gradients of [`forward`](ParallelModule::forward) at `input`.
    ///
    /// `grad_output` has the layout of the forward output. The returned input gradient has the
    /// layout of the forward input; the weight and bias gradients are local to this rank's shards.
    fn backward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
        grad_output: &Tensor<T, RANK>,
    ) -> Result<LinearGrads<T, RANK>>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }
}

/// Outcome of [`ParallelModule::from_dense`].
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion<P, T: TensorElem> {
    Parallel(P),
    /// The layer was too narrow to shard and is returned as it was given.
    Unsharded(Linear<T>),
}

impl<P, T: TensorElem> Conversion<P, T> {
    pub(crate) fn fallback(dense: Linear<T>, layer: &'static str, size: usize, world_size: usize) -> Self {
        warn!(
            layer,
            size, world_size, "feature count below world size; keeping the dense layer unsharded"
        );
        Conversion::Unsharded(dense)
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Conversion::Parallel(_))
    }

    pub fn parallel(self) -> Option<P> {
        match self {
            Conversion::Parallel(p) => Some(p),
            Conversion::Unsharded(_) => None,
        }
    }

    pub fn unsharded(self) -> Option<Linear<T>> {
        match self {
            Conversion::Parallel(_) => None,
            Conversion::Unsharded(l) => Some(l),
        }
    }
}

impl<P: ParallelModule<T>, T: TensorElem> Conversion<P, T> {
    /// Runs whichever layer the conversion produced.
    ///
    /// An unsharded layer computes the full dense output locally on every rank and never defers
    /// its bias.
    pub fn forward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
    ) -> Result<ParallelOutput<T, RANK>> {
        match self {
            Conversion::Parallel(p) => p.forward(group, input),
            Conversion::Unsharded(dense) => Ok(ParallelOutput::new(dense.forward(input)?, None)),
        }
    }
}

/// Output of a parallel layer's forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelOutput<T: TensorElem, const RANK: usize> {
    pub output: Tensor<T, RANK>,
    /// The bias left for the caller to add; `Some` exactly when the layer skips its bias addition.
    pub bias: Option<Tensor<T, 1>>,
}

impl<T: TensorElem, const RANK: usize> ParallelOutput<T, RANK> {
    pub fn new(output: Tensor<T, RANK>, bias: Option<Tensor<T, 1>>) -> Self {
        Self { output, bias }
    }

    pub fn into_output(self) -> Tensor<T, RANK> {
        self.output
    }

    pub fn into_parts(self) -> (Tensor<T, RANK>, Option<Tensor<T, 1>>) {
        (self.output, self.bias)
    }

    /// Adds a deferred bias, if any, and returns the output.
    pub fn with_bias_added(self) -> Result<Tensor<T, RANK>> {
        match &self.bias {
            Some(b) => Ok(self.output.add_bias(b)?),
            None => Ok(self.output),
        }
    }
}

pub(crate) fn check_group<B: CollectiveBackend>(
    group: &B,
    expected_rank: usize,
    expected_world: usize,
) -> Result<()> {
    if group.rank() != expected_rank || group.world_size() != expected_world {
        return Err(ParallelError::GroupMismatch {
            expected_rank,
            expected_world,
            rank: group.rank(),
            world_size: group.world_size(),
        });
    }
    Ok(())
}

pub(crate) fn check_input<T: TensorElem, const RANK: usize>(
    layer: &'static str,
    input: &Tensor<T, RANK>,
    weight: &Tensor<T, 2>,
    expected: usize,
) -> Result<()> {
    if RANK == 0 || input.last_dim() != expected {
        return Err(ParallelError::InputShape {
            layer,
            input: input.shape().to_vec(),
            weight: weight.shape().to_vec(),
            expected,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_parts() {
        let out = ParallelOutput::new(
            Tensor::<f32, 2>::ones([2, 2]),
            Some(Tensor::<f32, 1>::full([2], 0.5)),
        );
        let (o, b) = out.clone().into_parts();
        assert_eq!(o.shape(), &[2, 2]);
        assert!(b.is_some());
        assert_eq!(out.with_bias_added().unwrap().data(), &[1.5; 4]);
    }

    #[test]
    fn test_output_without_bias() {
        let out = ParallelOutput::new(Tensor::<f32, 1>::ones([3]), None);
        assert_eq!(out.clone().with_bias_added().unwrap(), out.into_output());
    }

    #[test]
    fn test_conversion_accessors() {
        let dense = Linear::<f32>::new(Tensor::zeros([1, 4]), None).unwrap();
        let conv: Conversion<(), f32> = Conversion::fallback(dense.clone(), "test", 1, 2);
        assert!(!conv.is_parallel());
        assert_eq!(conv.clone().unsharded(), Some(dense));
        assert_eq!(conv.parallel(), None);
    }

    #[test]
    fn test_check_input() {
        let w = Tensor::<f32, 2>::zeros([2, 3]);
        assert!(check_input("L", &Tensor::<f32, 2>::zeros([1, 3]), &w, 3).is_ok());
        let err = check_input("L", &Tensor::<f32, 2>::zeros([1, 4]), &w, 3).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[1, 4]") && msg.contains("[2, 3]") && msg.contains('3'));
    }
}
