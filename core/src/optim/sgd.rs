use super::Optimizer;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;

/// Stochastic Gradient Descent (SGD) optimizer with optional L2 weight decay.
///
/// Updates parameters using the rule:
/// `param = param - learning_rate * (grad + weight_decay * param)`
#[derive(Debug, Clone, Copy)]
pub struct Sgd<T: TensorElem> {
    pub learning_rate: T,
    pub weight_decay: T,
}

impl<T: TensorElem> Sgd<T> {
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            weight_decay: T::zero(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: T) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl<T: TensorElem> Optimizer<T> for Sgd<T> {
    fn update<const RANK: usize>(
        &self,
        param: &mut Tensor<T, RANK>,
        grad: &Tensor<T, RANK>,
    ) -> Result<()> {
        if param.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: param.shape().to_vec(),
                got: grad.shape().to_vec(),
            });
        }

        let lr = self.learning_rate;
        let wd = self.weight_decay;

        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .for_each(|(p, g)| {
                *p = *p - lr * (*g + wd * *p);
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_sgd_new() {
        let sgd = Sgd::new(0.1);
        assert_eq!(sgd.learning_rate, 0.1);
        assert_eq!(sgd.weight_decay, 0.0);
    }

    #[test]
    fn test_sgd_update() {
        let sgd = Sgd::new(0.1);
        let mut param = Tensor::new(vec![1.0, 2.0], [2]).unwrap();
        let grad = Tensor::new(vec![0.5, -0.5], [2]).unwrap();

        sgd.update(&mut param, &grad).unwrap();

        assert!((param.data()[0] - 0.95f64).abs() < 1e-6);
        assert!((param.data()[1] - 2.05f64).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let sgd = Sgd::new(0.5).with_weight_decay(0.1);
        let mut param = Tensor::new(vec![2.0, 2.0], [1, 2]).unwrap();
        let grad = Tensor::zeros([1, 2]);

        sgd.update(&mut param, &grad).unwrap();

        // 2.0 - 0.5 * (0.1 * 2.0)
        assert!((param.data()[0] - 1.9f64).abs() < 1e-9);
    }

    #[test]
    fn test_sgd_update_shape_mismatch() {
        let sgd = Sgd::new(0.1);
        let mut param = Tensor::new(vec![1.0, 2.0], [2]).unwrap();
        let grad = Tensor::new(vec![0.5], [1]).unwrap();

        let result = sgd.update(&mut param, &grad);
        assert!(result.is_err());
    }
}
