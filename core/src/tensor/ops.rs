//! Tensor operations.
//!
//! # Overview
//!
//! The operations a tensor-parallel linear layer needs, and nothing more:
//! - **Element-wise Arithmetic**: `+`, `-`, `*`, `/` on tensors of identical shape.
//! - **Matrix Multiplication**: 2-D matmul and transpose, used by the backward passes.
//! - **Slicing**: [`Tensor::narrow`] and [`Tensor::cat`] along any dimension, which is all that
//!   sharding and the gather/split collectives are made of.
//! - **Feature-axis helpers**: flattening leading dimensions, broadcasting a bias over the last
//!   dimension and reducing over the leading ones.
//!
//! > [!NOTE]
//! > Shape checking is strict. Element-wise operations require exactly matching shapes; the only
//! > broadcast supported is [`Tensor::add_bias`] over the last dimension.
//!
//! # Parallelism
//!
//! Element-wise operations are parallelised using `rayon`; the heavier kernels live in
//! `tp-linear-kernels`.
//!
//! # Examples
//!
//! ```rust
//! use tp_linear::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// Checks that both shapes match, then applies the operation element-wise in parallel.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .as_mut_slice()
                    .par_iter_mut()
                    .zip(self.data.as_slice().par_iter())
                    .zip(rhs.data.as_slice().par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise, returning a new tensor of the same shape.
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = self.clone();
        out.data.par_iter_mut().for_each(|x| *x = f(*x));
        out
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Copies `[start, start + len)` along `dim` into a new tensor.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if `dim` is not a valid axis or the range runs
    /// past the end of that axis.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let data = tp_linear_kernels::cpu_narrow(&self.data, &self.shape, dim, start, len)?;
        let mut shape = self.shape;
        shape[dim] = len;
        Tensor::new(data, shape)
    }

    /// Concatenates `parts` along `dim`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `parts` is empty or the parts disagree on any
    /// dimension other than `dim`.
    pub fn cat(parts: &[Self], dim: usize) -> Result<Self> {
        let views: Vec<(&[T], &[usize])> = parts
            .iter()
            .map(|p| (p.data.as_slice(), p.shape.as_slice()))
            .collect();
        let (data, out_shape) = tp_linear_kernels::cpu_concat(&views, dim)?;

        let shape: [usize; RANK] =
            out_shape
                .as_slice()
                .try_into()
                .map_err(|_| TensorError::ShapeMismatch {
                    expected: vec![RANK],
                    got: vec![out_shape.len()],
                })?;
        Tensor::new(data, shape)
    }

    /// Views the tensor as `[rows, last_dim]`, folding every leading dimension into `rows`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` for rank-0 tensors.
    pub fn flatten_rows(self) -> Result<Tensor<T, 2>> {
        if RANK == 0 {
            return Err(TensorError::Unsupported(
                "flatten_rows on a rank-0 tensor".to_string(),
            ));
        }
        let cols = self.last_dim();
        let rows = self.shape[..RANK.saturating_sub(1)].iter().product();
        self.reshape([rows, cols])
    }

    /// Returns this tensor's shape with the last dimension replaced by `last`.
    pub fn shape_with_last_dim(&self, last: usize) -> [usize; RANK] {
        let mut shape = self.shape;
        if let Some(d) = shape.last_mut() {
            *d = last;
        }
        shape
    }

    /// Adds `bias` to every row, broadcasting it over all leading dimensions.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the bias length differs from the last dimension.
    pub fn add_bias(&self, bias: &Tensor<T, 1>) -> Result<Self> {
        let cols = self.last_dim();
        if bias.shape[0] != cols {
            return Err(TensorError::ShapeMismatch {
                expected: vec![cols],
                got: bias.shape.to_vec(),
            });
        }

        let mut out = self.clone();
        if cols == 0 {
            return Ok(out);
        }
        out.data.par_chunks_mut(cols).for_each(|row| {
            for (x, &b) in row.iter_mut().zip(bias.data.iter()) {
                *x += b;
            }
        });
        Ok(out)
    }

    /// Sums over every leading dimension, leaving a `[last_dim]` vector.
    ///
    /// This is the bias gradient of a linear layer.
    pub fn sum_rows(&self) -> Tensor<T, 1> {
        let cols = self.last_dim();
        let mut acc = vec![T::zero(); cols];
        if cols > 0 {
            for row in self.data.chunks(cols) {
                for (a, &x) in acc.iter_mut().zip(row) {
                    *a += x;
                }
            }
        }
        Tensor {
            shape: [cols],
            strides: [1],
            data: acc,
        }
    }

    /// Largest absolute element-wise difference, or `None` if the shapes differ.
    pub fn max_abs_diff(&self, other: &Self) -> Option<f64> {
        if self.shape != other.shape {
            return None;
        }
        let diff = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| {
                let a = a.to_f64().unwrap_or(f64::NAN);
                let b = b.to_f64().unwrap_or(f64::NAN);
                (a - b).abs()
            })
            .fold(0.0_f64, f64::max);
        Some(diff)
    }

    /// Returns true if the shapes match and `|a - b| <= atol + rtol * |b|` for every element.
    pub fn allclose(&self, other: &Self, rtol: f64, atol: f64) -> bool {
        if self.shape != other.shape {
            return false;
        }
        self.data.iter().zip(other.data.iter()).all(|(a, b)| {
            match (a.to_f64(), b.to_f64()) {
                (Some(a), Some(b)) => (a - b).abs() <= atol + rtol * b.abs(),
                _ => false,
            }
        })
    }
}

impl<T> Tensor<T, 2>
where
    T: TensorElem,
{
    /// Matrix multiplication `[M, K] x [K, N] -> [M, N]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the inner dimensions differ.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let data = tp_linear_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        Tensor::new(data, [self.shape[0], rhs.shape[1]])
    }

    /// Transposes a 2-D tensor.
    pub fn transpose(&self) -> Result<Self> {
        let data = tp_linear_kernels::cpu_transpose(&self.data, &self.shape)?;
        Tensor::new(data, [self.shape[1], self.shape[0]])
    }
}
