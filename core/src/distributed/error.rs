use super::backend::CollectiveError;
use crate::tensor::TensorError;
use thiserror::Error;

/// Errors raised by the tensor-parallel layers and the sharding helpers.
///
/// Configuration errors are raised locally, before a constructor issues its first collective,
/// so a misconfigured rank fails cleanly instead of leaving its peers blocked.
#[derive(Error, Debug)]
pub enum ParallelError {
    #[error("cannot skip bias addition if bias is None")]
    SkipBiasWithoutBias,
    #[error(
        "the size of {name}:{size} is not an integer multiple of tensor parallel size: {world_size}"
    )]
    NotDivisible {
        name: &'static str,
        size: usize,
        world_size: usize,
    },
    #[error(
        "invalid shapes in {layer} forward: input={input:?}, weight={weight:?}; expected last dim of input to be {expected}"
    )]
    InputShape {
        layer: &'static str,
        input: Vec<usize>,
        weight: Vec<usize>,
        expected: usize,
    },
    #[error("chunked streaming is inference-only; use chunk count 1 for training")]
    ChunkedTraining,
    #[error("stream chunk count must be between 1 and {out_features}, got {chunks}")]
    InvalidChunkCount { chunks: usize, out_features: usize },
    #[error("parameter {name} has shape {got:?}, expected {expected:?}")]
    ParameterShape {
        name: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("layer configured with bias={configured} but a bias was {}", presence(.supplied))]
    BiasMismatch { configured: bool, supplied: bool },
    #[error(
        "layer built for rank {expected_rank} of {expected_world} called with rank {rank} of {world_size}"
    )]
    GroupMismatch {
        expected_rank: usize,
        expected_world: usize,
        rank: usize,
        world_size: usize,
    },
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, ParallelError>;

fn presence(supplied: &bool) -> &'static str {
    if *supplied {
        "supplied"
    } else {
        "not supplied"
    }
}
