use crate::{KernelElem, Result, check_len};
use rayon::prelude::*;

/// Applies `y = x · Wᵀ + b` for a row-major input block and a row-major weight block.
///
/// * `input` is `[rows, in_features]`.
/// * `weight` is `[out_features, in_features]`, i.e. the *untransposed* layout of a linear layer.
///   Because each output element is the dot product of an input row with a weight row, both
///   operands are walked sequentially and no transpose is materialised.
/// * `bias`, when present, is `[out_features]`.
///
/// The weight may be a sub-range of rows of a larger matrix, which is how streamed inference
/// computes one output block at a time.
pub fn cpu_linear<T>(
    input: &[T],
    weight: &[T],
    bias: Option<&[T]>,
    rows: usize,
    in_features: usize,
    out_features: usize,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_len(input.len(), rows * in_features)?;
    check_len(weight.len(), out_features * in_features)?;
    if let Some(bias) = bias {
        check_len(bias.len(), out_features)?;
    }

    let mut out = vec![T::zero(); rows * out_features];
    if out_features == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(out_features)
        .enumerate()
        .for_each(|(row, out_row)| {
            let x = &input[row * in_features..(row + 1) * in_features];
            for (o, out_elem) in out_row.iter_mut().enumerate() {
                let w = &weight[o * in_features..(o + 1) * in_features];
                let mut sum = T::zero();
                for (&a, &b) in x.iter().zip(w.iter()) {
                    sum += a * b;
                }
                if let Some(bias) = bias {
                    sum += bias[o];
                }
                *out_elem = sum;
            }
        });

    Ok(out)
}
