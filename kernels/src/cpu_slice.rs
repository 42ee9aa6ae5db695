//! Contiguous slicing and concatenation along one dimension of a row-major buffer.
//!
//! A row-major tensor of shape `[d0, .., dk, .., dn]` viewed along dimension `k` is `outer`
//! repetitions of a `dk * inner` block, where `outer = d0 * .. * d(k-1)` and
//! `inner = d(k+1) * .. * dn`. Narrowing copies a sub-block out of every repetition;
//! concatenation interleaves the blocks of each part in order.

use crate::{KernelElem, KernelError, Result, check_len};

fn outer_inner(shape: &[usize], dim: usize) -> (usize, usize) {
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    (outer, inner)
}

fn check_dim(shape: &[usize], dim: usize) -> Result<()> {
    if dim >= shape.len() {
        return Err(KernelError::IndexOutOfBounds {
            index: vec![dim],
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// Copies `[start, start + len)` along `dim` out of `data`.
pub fn cpu_narrow<T>(
    data: &[T],
    shape: &[usize],
    dim: usize,
    start: usize,
    len: usize,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    check_dim(shape, dim)?;
    check_len(data.len(), shape.iter().product())?;
    if start + len > shape[dim] {
        return Err(KernelError::IndexOutOfBounds {
            index: vec![start + len],
            shape: shape.to_vec(),
        });
    }

    let (outer, inner) = outer_inner(shape, dim);
    let block = shape[dim] * inner;
    let mut out = Vec::with_capacity(outer * len * inner);
    for o in 0..outer {
        let from = o * block + start * inner;
        out.extend_from_slice(&data[from..from + len * inner]);
    }
    Ok(out)
}

/// Concatenates `parts` along `dim`, returning the data and the resulting shape.
///
/// All parts must have the same rank and agree on every dimension except `dim`.
pub fn cpu_concat<T>(parts: &[(&[T], &[usize])], dim: usize) -> Result<(Vec<T>, Vec<usize>)>
where
    T: KernelElem,
{
    let Some(&(_, first_shape)) = parts.first() else {
        return Err(KernelError::ShapeMismatch {
            expected: vec![1],
            got: vec![0],
        });
    };
    check_dim(first_shape, dim)?;

    let mut out_shape = first_shape.to_vec();
    out_shape[dim] = 0;
    for &(data, shape) in parts {
        let compatible = shape.len() == first_shape.len()
            && shape
                .iter()
                .zip(first_shape)
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !compatible {
            return Err(KernelError::ShapeMismatch {
                expected: first_shape.to_vec(),
                got: shape.to_vec(),
            });
        }
        check_len(data.len(), shape.iter().product())?;
        out_shape[dim] += shape[dim];
    }

    let (outer, inner) = outer_inner(&out_shape, dim);
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for o in 0..outer {
        for &(data, shape) in parts {
            let block = shape[dim] * inner;
            out.extend_from_slice(&data[o * block..(o + 1) * block]);
        }
    }
    Ok((out, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_last_dim() {
        // [2, 4]
        let data = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let out = cpu_narrow(&data, &[2, 4], 1, 2, 2).unwrap();
        assert_eq!(out, vec![2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn test_narrow_first_dim() {
        let data = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let out = cpu_narrow(&data, &[3, 2], 0, 1, 2).unwrap();
        assert_eq!(out, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let data = vec![0.0; 4];
        assert!(matches!(
            cpu_narrow(&data, &[2, 2], 1, 1, 2),
            Err(KernelError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            cpu_narrow(&data, &[2, 2], 2, 0, 1),
            Err(KernelError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_concat_middle_dim() {
        // a: [2, 1, 2], b: [2, 2, 2]
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![10.0, 11.0, 12.0, 13.0, 20.0, 21.0, 22.0, 23.0];
        let a_shape = [2, 1, 2];
        let b_shape = [2, 2, 2];
        let parts: [(&[f64], &[usize]); 2] = [(&a, &a_shape), (&b, &b_shape)];
        let (out, shape) = cpu_concat(&parts, 1).unwrap();
        assert_eq!(shape, vec![2, 3, 2]);
        assert_eq!(
            out,
            vec![1.0, 2.0, 10.0, 11.0, 12.0, 13.0, 3.0, 4.0, 20.0, 21.0, 22.0, 23.0]
        );
    }

    #[test]
    fn test_concat_inverts_narrow() {
        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let shape = [3, 4];
        let left = cpu_narrow(&data, &shape, 1, 0, 1).unwrap();
        let right = cpu_narrow(&data, &shape, 1, 1, 3).unwrap();
        let parts: [(&[f32], &[usize]); 2] = [(&left, &[3, 1]), (&right, &[3, 3])];
        let (out, out_shape) = cpu_concat(&parts, 1).unwrap();
        assert_eq!(out_shape, shape.to_vec());
        assert_eq!(out, data);
    }

    #[test]
    fn test_concat_incompatible() {
        let a = vec![1.0; 4];
        let b = vec![1.0; 6];
        let parts: [(&[f64], &[usize]); 2] = [(&a, &[2, 2]), (&b, &[3, 2])];
        let err = cpu_concat(&parts, 1);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_concat_empty() {
        let err = cpu_concat::<f32>(&[], 0);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
