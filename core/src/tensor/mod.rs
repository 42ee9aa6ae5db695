//! Core Tensor implementation.
//!
//! A [`Tensor`] here is the *local* value a rank holds: a weight shard, a bias replica, or an
//! activation. Whether that value is replicated or one slice of a larger logical tensor is
//! tracked by the caller (see [`crate::distributed::sharding::Layout`]), never by the tensor.
//!
//! Tensors are defined by:
//! 1. **Data**: a flat, contiguous `Vec<T>` in row-major order.
//! 2. **Shape**: a `[usize; RANK]` array, with the rank fixed at compile time.
//! 3. **Strides**: derived from the shape; the last dimension is always contiguous.
//!
//! ```rust
//! use tp_linear::tensor::Tensor;
//!
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::<f32, 2>::new(data, [2, 3]).unwrap();
//!
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod ops;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

impl From<tp_linear_kernels::KernelError> for TensorError {
    fn from(e: tp_linear_kernels::KernelError) -> Self {
        match e {
            tp_linear_kernels::KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            tp_linear_kernels::KernelError::IndexOutOfBounds { index, shape } => {
                TensorError::IndexOutOfBounds { index, shape }
            }
        }
    }
}

/// Trait bound for elements that can be stored in a Tensor.
///
/// `'static` is required because tensors travel between rank threads as type-erased
/// payloads and are checked with a downcast on arrival.
pub trait TensorElem:
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

impl<T> TensorElem for T where
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

/// The core Tensor struct.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
/// - `RANK`: The number of dimensions (const generic).
///
/// The rank lives in the type, the extents do not: a linear layer accepts `[batch, features]`
/// and `[batch, seq, features]` inputs through the same generic `forward`, and shape mismatches
/// are reported at runtime as [`TensorError::ShapeMismatch`].
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    /// Creates a new Tensor whose element at flat (row-major) index `i` is `f(i)`.
    pub fn from_fn<F>(shape: [usize; RANK], f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: (0..size).map(f).collect(),
        }
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the total number of elements in `new_shape`
    /// does not match the current size of the tensor.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let current_size = self.size();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
        })
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns the size of the last dimension (the feature dimension of an activation).
    ///
    /// Rank-0 tensors report 1.
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor and returns its flat data.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements in the tensor.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }
}

/// Computes the row-major strides for a given shape.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let tensor = Tensor::<f32, 2>::new(data.clone(), [2, 2]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.data(), &data[..]);

        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zeros_ones_full() {
        assert_eq!(Tensor::<f32, 2>::zeros([2, 3]).data(), &[0.0; 6]);
        assert_eq!(Tensor::<f32, 2>::ones([2, 3]).data(), &[1.0; 6]);
        assert_eq!(Tensor::<f64, 1>::full([2], 7.5).data(), &[7.5, 7.5]);
    }

    #[test]
    fn test_from_fn() {
        let t = Tensor::<f32, 2>::from_fn([2, 2], |i| i as f32 * 2.0);
        assert_eq!(t.data(), &[0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_reshape() {
        let tensor = Tensor::<f32, 2>::zeros([2, 3]);
        let reshaped = tensor.reshape([3, 2]).unwrap();
        assert_eq!(reshaped.shape(), &[3, 2]);

        let err = reshaped.clone().reshape([4, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_accessors() {
        let mut t = Tensor::<f32, 3>::zeros([2, 3, 4]);
        assert_eq!(t.size(), 24);
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.last_dim(), 4);

        t.data_mut()[0] = 1.0;
        assert_eq!(t.data()[0], 1.0);
        assert_eq!(t.into_data().len(), 24);
    }

    #[test]
    fn test_scalar_last_dim() {
        let t = Tensor::<f32, 0>::new(vec![3.0], []).unwrap();
        assert_eq!(t.last_dim(), 1);
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn test_tensor_error_display() {
        let err = TensorError::ShapeMismatch {
            expected: vec![2, 2],
            got: vec![4],
        };
        assert_eq!(
            format!("{}", err),
            "Shape mismatch: expected [2, 2], got [4]"
        );

        let err = TensorError::Unsupported("foo".to_string());
        assert_eq!(format!("{}", err), "Unsupported operation: foo");
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: TensorError = tp_linear_kernels::KernelError::IndexOutOfBounds {
            index: vec![3],
            shape: vec![2],
        }
        .into();
        assert!(matches!(err, TensorError::IndexOutOfBounds { .. }));
    }

    #[test]
    fn test_tensor_debug() {
        let t = Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap();
        let debug_str = format!("{:?}", t);
        assert!(debug_str.contains("Tensor"));
        assert!(debug_str.contains("shape"));
    }
}
