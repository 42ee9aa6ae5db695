//! Parameter initialisers.
//!
//! All initialisers draw from a uniform distribution whose bound depends on the fan of the
//! *logical* parameter, never on the shard a rank holds, so a sharded layer is initialised from
//! the same distribution as its dense counterpart.

use crate::random::{with_rng, Randomizer};
use crate::tensor::{Result, TensorElem, TensorError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Random stream of a layer's weight.
pub const WEIGHT_STREAM: u64 = 0;
/// Random stream of a layer's bias.
pub const BIAS_STREAM: u64 = 1;

/// How a parameter is filled at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    /// `U(-b, b)` with `b = √3 · √(2 / ((1 + a²) · fan_in))`.
    KaimingUniform { a: f64 },
    /// `U(-b, b)` with `b = a · gain · √(scale / (fan_in + fan_out))`.
    ///
    /// `fan_out` is left out of the denominator for parameters without one (biases).
    XavierUniform { a: f64, scale: f64, gain: f64 },
    Uniform { low: f64, high: f64 },
    Zeros,
}

impl Initializer {
    /// Weight default: Kaiming uniform with `a = √5`, i.e. `U(-1/√fan_in, 1/√fan_in)`.
    pub fn default_weight() -> Self {
        Initializer::KaimingUniform { a: 5f64.sqrt() }
    }

    /// Bias default: Xavier uniform with `a = scale = gain = 1`.
    pub fn default_bias() -> Self {
        Initializer::XavierUniform {
            a: 1.0,
            scale: 1.0,
            gain: 1.0,
        }
    }

    /// The `[low, high)` range values are drawn from.
    pub fn range(&self, fan_in: usize, fan_out: Option<usize>) -> (f64, f64) {
        let symmetric = |bound: f64| {
            if bound.is_finite() && bound > 0.0 {
                (-bound, bound)
            } else {
                (0.0, 0.0)
            }
        };
        match *self {
            Initializer::KaimingUniform { a } => {
                let gain = (2.0 / (1.0 + a * a)).sqrt();
                symmetric(3f64.sqrt() * gain / (fan_in as f64).sqrt())
            }
            Initializer::XavierUniform { a, scale, gain } => {
                let fan = (fan_in + fan_out.unwrap_or(0)) as f64;
                symmetric(a * gain * (scale / fan).sqrt())
            }
            Initializer::Uniform { low, high } => (low, high),
            Initializer::Zeros => (0.0, 0.0),
        }
    }

    /// Draws `n` values from this initialiser's distribution using `rng`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        n: usize,
        fan_in: usize,
        fan_out: Option<usize>,
    ) -> Vec<f64> {
        let (low, high) = self.range(fan_in, fan_out);
        if low < high {
            (0..n).map(|_| rng.random_range(low..high)).collect()
        } else {
            vec![low; n]
        }
    }

    /// Fills the block `rows × cols` of a logical `[_, full_cols]` parameter.
    ///
    /// Runs inside a fork of the ambient generator. Each global row in `rows` re-keys the
    /// generator and draws a full row of `full_cols` values, of which the `cols` slice is kept,
    /// so the values of a block do not depend on how the parameter is partitioned.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_block<T: TensorElem>(
        &self,
        randomizer: &Randomizer,
        stream: u64,
        full_cols: usize,
        rows: Range<usize>,
        cols: Range<usize>,
        fan_in: usize,
        fan_out: Option<usize>,
    ) -> Result<Vec<T>> {
        if cols.end > full_cols {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![cols.end],
                shape: vec![full_cols],
            });
        }

        let _fork = randomizer.fork();
        let mut out = Vec::with_capacity(rows.len() * cols.len());
        for row in rows {
            randomizer.rekey(stream, row as u64);
            let values = with_rng(|rng| self.sample(rng, full_cols, fan_in, fan_out));
            for &v in &values[cols.clone()] {
                let v = T::from_f64(v).ok_or_else(|| {
                    TensorError::Unsupported(format!("initial value {v} not representable"))
                })?;
                out.push(v);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{manual_seed, rng_state, set_rng_state};

    #[test]
    fn test_default_bounds() {
        let (low, high) = Initializer::default_weight().range(16, Some(8));
        assert!((high - 0.25).abs() < 1e-12);
        assert!((low + 0.25).abs() < 1e-12);

        let (_, high) = Initializer::default_bias().range(4, None);
        assert!((high - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_bounds() {
        assert_eq!(Initializer::Zeros.range(4, None), (0.0, 0.0));
        assert_eq!(Initializer::default_weight().range(0, None), (0.0, 0.0));
    }

    #[test]
    fn test_samples_within_range() {
        let init = Initializer::Uniform {
            low: -2.0,
            high: 3.0,
        };
        let values = with_rng(|rng| init.sample(rng, 1000, 1, None));
        assert!(values.iter().all(|&v| (-2.0..3.0).contains(&v)));
    }

    #[test]
    fn test_block_independent_of_partition() {
        let r = Randomizer::new(77);
        let init = Initializer::default_weight();
        let full: Vec<f32> = init
            .fill_block(&r, WEIGHT_STREAM, 6, 0..4, 0..6, 6, Some(4))
            .unwrap();

        let rows_1_3: Vec<f32> = init
            .fill_block(&r, WEIGHT_STREAM, 6, 1..3, 0..6, 6, Some(4))
            .unwrap();
        assert_eq!(&rows_1_3[..], &full[6..18]);

        let cols_2_4: Vec<f32> = init
            .fill_block(&r, WEIGHT_STREAM, 6, 0..4, 2..4, 6, Some(4))
            .unwrap();
        let expected: Vec<f32> = (0..4).flat_map(|row| full[row * 6 + 2..row * 6 + 4].to_vec()).collect();
        assert_eq!(cols_2_4, expected);
    }

    #[test]
    fn test_fill_does_not_touch_ambient() {
        manual_seed(1234);
        let snapshot = rng_state();
        let _: Vec<f64> = Initializer::default_bias()
            .fill_block(&Randomizer::new(1), BIAS_STREAM, 8, 0..1, 0..8, 8, None)
            .unwrap();
        let after = rng_state();
        set_rng_state(snapshot);
        let a: u64 = with_rng(|rng| rng.random());
        set_rng_state(after);
        let b: u64 = with_rng(|rng| rng.random());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fill_rejects_column_overflow() {
        let r = Randomizer::new(0);
        let res: Result<Vec<f32>> = Initializer::Zeros.fill_block(&r, 0, 4, 0..1, 2..6, 4, None);
        assert!(matches!(res, Err(TensorError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_string(&Initializer::Zeros).unwrap();
        assert_eq!(json, r#"{"kind":"zeros"}"#);
        let back: Initializer =
            serde_json::from_str(r#"{"kind":"kaiming_uniform","a":0.0}"#).unwrap();
        assert_eq!(back, Initializer::KaimingUniform { a: 0.0 });
    }
}
