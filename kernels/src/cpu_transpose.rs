use crate::{KernelElem, Result, check_len};
use rayon::prelude::*;

/// Transposes a row-major `[M, N]` matrix into `[N, M]`.
///
/// Parallelised over the rows of the output, each of which gathers one input column.
pub fn cpu_transpose<T>(data: &[T], shape: &[usize; 2]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [m, n] = *shape;
    check_len(data.len(), m * n)?;

    let mut out_data = vec![T::zero(); m * n];
    if m == 0 {
        return Ok(out_data);
    }

    out_data
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(col, out_row)| {
            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[r * n + col];
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelError;

    #[test]
    fn test_transpose_simple() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let result = cpu_transpose(&data, &[2, 3]).unwrap();
        // [1, 4]
        // [2, 5]
        // [3, 6]
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_column_vector() {
        let data = vec![1.0, 2.0, 3.0];
        let result = cpu_transpose(&data, &[3, 1]).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn test_transpose_len_mismatch() {
        let err = cpu_transpose(&[1.0, 2.0], &[2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
