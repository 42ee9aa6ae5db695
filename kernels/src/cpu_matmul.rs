use crate::{KernelElem, KernelError, Result, check_len};
use rayon::prelude::*;

/// CPU matrix multiplication `[M, K] x [K, N] -> [M, N]`.
///
/// The right-hand side is transposed once so that the inner loop reads both operands
/// sequentially. Rows of the output are computed in parallel.
///
/// Used by the backward passes (`Gᵀ · X` and `G · W`); the forward pass goes through
/// [`cpu_linear`](crate::cpu_linear), which never needs the transpose.
pub fn cpu_matmul<T>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; 2],
    rhs_shape: &[usize; 2],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [m, k] = *lhs_shape;
    let [k2, n] = *rhs_shape;

    if k != k2 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![k2],
        });
    }
    check_len(lhs_data.len(), m * k)?;
    check_len(rhs_data.len(), k * n)?;

    let mut out_data = vec![T::zero(); m * n];
    if n == 0 {
        return Ok(out_data);
    }

    let rhs_t = crate::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, out_row)| {
            let a = &lhs_data[row * k..(row + 1) * k];
            for (col, out_elem) in out_row.iter_mut().enumerate() {
                let b = &rhs_t[col * k..(col + 1) * k];
                let mut sum = T::zero();
                for (&x, &y) in a.iter().zip(b.iter()) {
                    sum += x * y;
                }
                *out_elem = sum;
            }
        });

    Ok(out_data)
}
