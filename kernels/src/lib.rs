//! Row-major CPU kernels for `tp-linear`.
//!
//! Every kernel works on flat slices plus explicit extents so the tensor crate can hand over a
//! contiguous *block* of a buffer (for example a range of weight rows) without copying it first.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_linear;
pub mod cpu_matmul;
pub mod cpu_slice;
pub mod cpu_transpose;

pub use cpu_linear::cpu_linear;
pub use cpu_matmul::cpu_matmul;
pub use cpu_slice::{cpu_concat, cpu_narrow};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num
    + NumAssign
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + FromPrimitive
    + ToPrimitive
    + PartialOrd
    + 'static
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
        + 'static
{
}

pub(crate) fn check_len(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(KernelError::ShapeMismatch {
            expected: vec![expected],
            got: vec![got],
        });
    }
    Ok(())
}
