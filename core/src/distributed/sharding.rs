//! Mapping logical tensors to per-rank shards and back.
//!
//! A shard is the contiguous block `[rank · n/P, (rank + 1) · n/P)` of one dimension of the
//! logical tensor. Concatenating every rank's shard in rank order along that dimension gives the
//! logical tensor back bit for bit, since both directions only copy.

use super::backend::CollectiveBackend;
use super::error::{ParallelError, Result};
use crate::tensor::{Tensor, TensorElem};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// `size / world_size`, or [`ParallelError::NotDivisible`] naming `name`.
pub fn divide(size: usize, world_size: usize, name: &'static str) -> Result<usize> {
    if world_size == 0 || size % world_size != 0 {
        return Err(ParallelError::NotDivisible {
            name,
            size,
            world_size,
        });
    }
    Ok(size / world_size)
}

/// Which block of which dimension a rank owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub dim: usize,
    pub rank: usize,
    pub world_size: usize,
}

impl Shard {
    /// The shard of `dim` owned by the calling rank of `group`.
    pub fn of<B: CollectiveBackend>(group: &B, dim: usize) -> Self {
        Self {
            dim,
            rank: group.rank(),
            world_size: group.world_size(),
        }
    }

    /// The indices of a dimension of length `size` this shard covers.
    pub fn range(&self, size: usize, name: &'static str) -> Result<Range<usize>> {
        let len = divide(size, self.world_size, name)?;
        Ok(self.rank * len..(self.rank + 1) * len)
    }
}

/// Copies `shard`'s block out of a logical tensor.
pub fn shard_tensor<T: TensorElem, const RANK: usize>(
    tensor: &Tensor<T, RANK>,
    shard: Shard,
    name: &'static str,
) -> Result<Tensor<T, RANK>> {
    let size = tensor.shape().get(shard.dim).copied().ok_or_else(|| {
        crate::tensor::TensorError::IndexOutOfBounds {
            index: vec![shard.dim],
            shape: tensor.shape().to_vec(),
        }
    })?;
    let range = shard.range(size, name)?;
    Ok(tensor.narrow(shard.dim, range.start, range.len())?)
}

/// Keeps the calling rank's block of dimension 0.
pub fn shard_rowwise<B: CollectiveBackend, T: TensorElem, const RANK: usize>(
    tensor: &Tensor<T, RANK>,
    group: &B,
) -> Result<Tensor<T, RANK>> {
    shard_tensor(tensor, Shard::of(group, 0), "dim 0")
}

/// Keeps the calling rank's block of dimension 1, or of the only dimension of a 1-D tensor.
pub fn shard_colwise<B: CollectiveBackend, T: TensorElem, const RANK: usize>(
    tensor: &Tensor<T, RANK>,
    group: &B,
) -> Result<Tensor<T, RANK>> {
    let dim = if RANK == 1 { 0 } else { 1 };
    shard_tensor(tensor, Shard::of(group, dim), "dim 1")
}

/// Reassembles a logical tensor from all of its shards, given in rank order.
pub fn unshard_tensor<T: TensorElem, const RANK: usize>(
    shards: &[Tensor<T, RANK>],
    dim: usize,
) -> Result<Tensor<T, RANK>> {
    Ok(Tensor::cat(shards, dim)?)
}

/// Reassembles the logical tensor on every rank with an all-gather.
pub fn gather_full<B: CollectiveBackend, T: TensorElem, const RANK: usize>(
    group: &B,
    shard: &Tensor<T, RANK>,
    dim: usize,
) -> Result<Tensor<T, RANK>> {
    Ok(group.all_gather(shard, dim)?)
}

/// How a tensor is distributed over the ranks of a group.
///
/// Tensors do not carry this; it describes what a layer produces or expects so that callers can
/// check that chained layers agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Bit-identical on every rank.
    Replicated,
    /// Disjoint rank-ordered blocks of `dim`.
    Sharded { dim: usize },
}

impl Layout {
    /// The local extent of a dimension whose logical extent is `size`.
    pub fn local_extent(&self, dim: usize, size: usize, world_size: usize) -> usize {
        match *self {
            Layout::Sharded { dim: d } if d == dim && world_size > 0 => size / world_size,
            _ => size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divide() {
        assert_eq!(divide(8, 2, "out_features").unwrap(), 4);
        let err = divide(10, 3, "in_features").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("10") && msg.contains('3'));
        assert!(divide(4, 0, "x").is_err());
    }

    #[test]
    fn test_shard_range() {
        let shard = Shard {
            dim: 0,
            rank: 2,
            world_size: 4,
        };
        assert_eq!(shard.range(8, "rows").unwrap(), 4..6);
    }

    #[test]
    fn test_shards_reassemble_bit_exact() {
        let t = Tensor::<f32, 2>::from_fn([4, 6], |i| (i as f32).sqrt());
        for dim in 0..2 {
            let shards: Vec<_> = (0..2)
                .map(|rank| {
                    shard_tensor(
                        &t,
                        Shard {
                            dim,
                            rank,
                            world_size: 2,
                        },
                        "t",
                    )
                    .unwrap()
                })
                .collect();
            assert_eq!(unshard_tensor(&shards, dim).unwrap(), t);
        }
    }

    #[test]
    fn test_shard_tensor_bad_dim() {
        let t = Tensor::<f32, 1>::zeros([4]);
        let shard = Shard {
            dim: 1,
            rank: 0,
            world_size: 2,
        };
        assert!(matches!(
            shard_tensor(&t, shard, "t"),
            Err(ParallelError::Tensor(_))
        ));
    }

    #[test]
    fn test_layout_local_extent() {
        let sharded = Layout::Sharded { dim: 1 };
        assert_eq!(sharded.local_extent(1, 8, 4), 2);
        assert_eq!(sharded.local_extent(0, 8, 4), 8);
        assert_eq!(Layout::Replicated.local_extent(1, 8, 4), 8);
    }
}
