use crate::random::Randomizer;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use std::ops::Range;

use super::init::{Initializer, BIAS_STREAM, WEIGHT_STREAM};
use super::module::Module;

/// Constants for Linear Layer
const WEIGHT_RANK: usize = 2;
const BIAS_RANK: usize = 1;

/// Linear Layer: `y = xA^T + b`
///
/// The dense layer is both the numerical reference for the parallel layers and the source they
/// are converted from.
///
/// - **Weights ($A$):** `[out_features, in_features]`.
/// - **Bias ($b$):** `[out_features]`.
///
/// Inputs may have any rank ≥ 1; the last dimension holds the features and every leading
/// dimension is treated as batch.
///
/// # Examples
/// ```rust
/// use tp_linear::nn::Linear;
/// use tp_linear::tensor::Tensor;
///
/// let layer = Linear::<f32>::new(Tensor::zeros([5, 10]), Some(Tensor::zeros([5]))).unwrap();
/// let y = layer.forward(&Tensor::<f32, 3>::ones([2, 7, 10])).unwrap();
/// assert_eq!(y.shape(), &[2, 7, 5]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Linear<T: TensorElem> {
    /// - Shape: `[out_features, in_features]`
    pub weight: Tensor<T, WEIGHT_RANK>,

    /// - Shape: `[out_features]`
    pub bias: Option<Tensor<T, BIAS_RANK>>,
}

/// Gradients of a linear map with respect to its input and parameters.
#[derive(Debug, Clone)]
pub struct LinearGrads<T: TensorElem, const RANK: usize> {
    pub input: Tensor<T, RANK>,
    pub weight: Tensor<T, WEIGHT_RANK>,
    /// `None` when the layer has no bias, or when the bias addition was left to the caller.
    pub bias: Option<Tensor<T, BIAS_RANK>>,
}

impl<T: TensorElem> Linear<T> {
    /// Creates a new Linear layer.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the bias length differs from `out_features`.
    pub fn new(
        weight: Tensor<T, WEIGHT_RANK>,
        bias: Option<Tensor<T, BIAS_RANK>>,
    ) -> Result<Self> {
        if let Some(b) = &bias {
            if b.shape()[0] != weight.shape()[0] {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![weight.shape()[0]],
                    got: b.shape().to_vec(),
                });
            }
        }
        Ok(Self { weight, bias })
    }

    /// Creates a layer with default-initialised parameters drawn from `seed`.
    ///
    /// Uses the same keyed streams as the parallel layers, so a parallel layer built from the
    /// same seed reassembles to exactly this layer.
    pub fn random(in_features: usize, out_features: usize, bias: bool, seed: u64) -> Result<Self> {
        let randomizer = Randomizer::new(seed);
        let weight = Initializer::default_weight().fill_block(
            &randomizer,
            WEIGHT_STREAM,
            in_features,
            0..out_features,
            0..in_features,
            in_features,
            Some(out_features),
        )?;
        let weight = Tensor::new(weight, [out_features, in_features])?;

        let bias = if bias {
            let data = Initializer::default_bias().fill_block(
                &randomizer,
                BIAS_STREAM,
                out_features,
                0..1,
                0..out_features,
                in_features,
                None,
            )?;
            Some(Tensor::new(data, [out_features])?)
        } else {
            None
        };

        Self::new(weight, bias)
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Performs the forward pass `x · Wᵀ + b`.
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        linear(x, &self.weight, self.bias.as_ref())
    }

    /// Computes the gradients of the forward pass at `x` given the output gradient.
    pub fn backward<const RANK: usize>(
        &self,
        x: &Tensor<T, RANK>,
        grad_output: &Tensor<T, RANK>,
    ) -> Result<LinearGrads<T, RANK>> {
        Ok(LinearGrads {
            input: input_grad(grad_output, &self.weight)?,
            weight: weight_grad(x, grad_output)?,
            bias: self.bias.as_ref().map(|_| grad_output.sum_rows()),
        })
    }

    pub fn into_parts(self) -> (Tensor<T, WEIGHT_RANK>, Option<Tensor<T, BIAS_RANK>>) {
        (self.weight, self.bias)
    }
}

impl<T: TensorElem> Module<T> for Linear<T> {
    fn num_parameters(&self) -> usize {
        self.weight.size() + self.bias.as_ref().map_or(0, Tensor::size)
    }
}

/// `x · Wᵀ + b` for any input rank ≥ 1.
pub fn linear<T: TensorElem, const RANK: usize>(
    x: &Tensor<T, RANK>,
    weight: &Tensor<T, WEIGHT_RANK>,
    bias: Option<&Tensor<T, BIAS_RANK>>,
) -> Result<Tensor<T, RANK>> {
    linear_rows(x, weight, 0..weight.shape()[0], bias)
}

/// `x · W[rows]ᵀ + b` using only the weight rows in `rows`.
///
/// The rows are read in place, so a contiguous block of output features can be computed without
/// copying the weight.
pub fn linear_rows<T: TensorElem, const RANK: usize>(
    x: &Tensor<T, RANK>,
    weight: &Tensor<T, WEIGHT_RANK>,
    rows: Range<usize>,
    bias: Option<&Tensor<T, BIAS_RANK>>,
) -> Result<Tensor<T, RANK>> {
    if RANK == 0 {
        return Err(TensorError::Unsupported(
            "linear on a rank-0 tensor".to_string(),
        ));
    }
    let [out_features, in_features] = *weight.shape();
    if x.last_dim() != in_features {
        return Err(TensorError::ShapeMismatch {
            expected: vec![in_features],
            got: x.shape().to_vec(),
        });
    }
    if rows.start > rows.end || rows.end > out_features {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![rows.start, rows.end],
            shape: weight.shape().to_vec(),
        });
    }

    let block = &weight.data()[rows.start * in_features..rows.end * in_features];
    let batch = if in_features == 0 {
        x.shape()[..RANK.saturating_sub(1)].iter().product()
    } else {
        x.size() / in_features
    };
    let data = tp_linear_kernels::cpu_linear(
        x.data(),
        block,
        bias.map(Tensor::data),
        batch,
        in_features,
        rows.len(),
    )?;
    Tensor::new(data, x.shape_with_last_dim(rows.len()))
}

/// `Gᵀ · X`, the weight gradient of `x · Wᵀ`, folded over every batch dimension.
pub fn weight_grad<T: TensorElem, const RANK: usize>(
    x: &Tensor<T, RANK>,
    grad_output: &Tensor<T, RANK>,
) -> Result<Tensor<T, WEIGHT_RANK>> {
    let x = x.clone().flatten_rows()?;
    let g = grad_output.clone().flatten_rows()?;
    g.transpose()?.matmul(&x)
}

/// `G · W`, the input gradient of `x · Wᵀ`, shaped like the input.
pub fn input_grad<T: TensorElem, const RANK: usize>(
    grad_output: &Tensor<T, RANK>,
    weight: &Tensor<T, WEIGHT_RANK>,
) -> Result<Tensor<T, RANK>> {
    let shape = grad_output.shape_with_last_dim(weight.shape()[1]);
    let g = grad_output.clone().flatten_rows()?;
    g.matmul(weight)?.reshape(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_new() {
        let layer = Linear::new(Tensor::<f32, 2>::zeros([5, 10]), Some(Tensor::zeros([5]))).unwrap();
        assert!(layer.bias.is_some());
        assert_eq!(layer.in_features(), 10);
        assert_eq!(layer.out_features(), 5);
        assert_eq!(layer.num_parameters(), 55);
    }

    #[test]
    fn test_linear_new_bias_mismatch() {
        let res = Linear::new(Tensor::<f32, 2>::zeros([5, 10]), Some(Tensor::zeros([4])));
        assert!(matches!(res, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_linear_forward_rank2() {
        let input = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();

        let weight_data = vec![
            1.0, 0.0, 0.0, // 1st neuron
            0.0, 1.0, 0.0, // 2nd neuron
            0.0, 0.0, 1.0, // 3rd neuron
            1.0, 1.0, 1.0, // 4th neuron
        ];
        let weight = Tensor::<f32, 2>::new(weight_data, [4, 3]).unwrap();
        let bias = Tensor::<f32, 1>::new(vec![0.1, 0.2, 0.3, 0.4], [4]).unwrap();

        let layer = Linear::new(weight, Some(bias)).unwrap();
        let output = layer.forward(&input).unwrap();

        assert_eq!(output.shape(), &[2, 4]);
        let out_data = output.data();
        assert!((out_data[0] - 1.1).abs() < 1e-6);
        assert!((out_data[1] - 2.2).abs() < 1e-6);
        assert!((out_data[2] - 3.3).abs() < 1e-6);
        assert!((out_data[3] - 6.4).abs() < 1e-6);
    }

    #[test]
    fn test_linear_forward_rank3() {
        // Batch=1, Seq=2, In=3
        let input = Tensor::<f32, 3>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [1, 2, 3]).unwrap();
        let weight = Tensor::<f32, 2>::new(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0], [2, 3]).unwrap();

        let layer = Linear::new(weight, None).unwrap();
        let output = layer.forward(&input).unwrap();

        assert_eq!(output.shape(), &[1, 2, 2]);
        assert_eq!(output.data(), &[6.0, 12.0, 15.0, 30.0]);
    }

    #[test]
    fn test_linear_input_mismatch() {
        let layer = Linear::<f32>::new(Tensor::zeros([5, 10]), None).unwrap();
        let res = layer.forward(&Tensor::<f32, 2>::zeros([2, 9]));
        assert!(matches!(res, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_linear_rows_matches_narrowed_weight() {
        let layer = Linear::<f64>::random(3, 6, true, 5).unwrap();
        let x = Tensor::<f64, 2>::from_fn([2, 3], |i| i as f64 - 2.0);
        let full = layer.forward(&x).unwrap();

        let block = linear_rows(&x, &layer.weight, 2..5, None).unwrap();
        let bias_block = layer.bias.as_ref().unwrap().narrow(0, 2, 3).unwrap();
        let block = block.add_bias(&bias_block).unwrap();
        assert!(block.allclose(&full.narrow(1, 2, 3).unwrap(), 1e-12, 1e-12));

        assert!(linear_rows(&x, &layer.weight, 4..7, None).is_err());
    }

    #[test]
    fn test_random_is_seeded() {
        let a = Linear::<f32>::random(4, 3, true, 1).unwrap();
        let b = Linear::<f32>::random(4, 3, true, 1).unwrap();
        let c = Linear::<f32>::random(4, 3, true, 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.weight.data().iter().all(|w| w.abs() <= 0.5));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let layer = Linear::<f64>::random(3, 2, true, 9).unwrap();
        let x = Tensor::<f64, 2>::from_fn([4, 3], |i| (i as f64 * 0.37).sin());
        // loss = sum(y), so dL/dy = 1
        let grad = Tensor::<f64, 2>::ones([4, 2]);
        let grads = layer.backward(&x, &grad).unwrap();

        let eps = 1e-6;
        let loss = |l: &Linear<f64>| l.forward(&x).unwrap().data().iter().sum::<f64>();
        let mut bumped = layer.clone();
        bumped.weight.data_mut()[1] += eps;
        let numeric = (loss(&bumped) - loss(&layer)) / eps;
        assert!((numeric - grads.weight.data()[1]).abs() < 1e-4);

        assert_eq!(grads.input.shape(), &[4, 3]);
        assert_eq!(grads.bias.unwrap().data(), &[4.0, 4.0]);
    }

    #[test]
    fn test_into_parts() {
        let layer = Linear::<f32>::new(Tensor::ones([2, 2]), None).unwrap();
        let (w, b) = layer.into_parts();
        assert_eq!(w.data(), &[1.0; 4]);
        assert!(b.is_none());
    }
}
