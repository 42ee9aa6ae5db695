//! Collective primitives used by the parallel layers.
//!
//! Every function takes the process group explicitly. Apart from [`split`], which is purely
//! local, each one is a collective: all ranks of `group` must call it, in the same order.

use super::backend::{CollectiveBackend, PendingReduce};
use super::error::Result;
use super::sharding::{shard_tensor, Shard};
use crate::tensor::{Tensor, TensorElem};
use tracing::trace;

/// Concatenates every rank's `tensor` along `dim` in rank order; replicated on every rank.
pub fn all_gather<B, T, const RANK: usize>(
    group: &B,
    tensor: &Tensor<T, RANK>,
    dim: usize,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if group.world_size() == 1 {
        return Ok(tensor.clone());
    }
    trace!(rank = group.rank(), dim, shape = ?tensor.shape(), "all_gather");
    Ok(group.all_gather(tensor, dim)?)
}

/// Keeps the calling rank's contiguous block of `dim`. Issues no communication.
pub fn split<B, T, const RANK: usize>(
    group: &B,
    tensor: &Tensor<T, RANK>,
    dim: usize,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if group.world_size() == 1 {
        return Ok(tensor.clone());
    }
    shard_tensor(tensor, Shard::of(group, dim), "split dimension")
}

/// Element-wise sum over ranks; replicated on every rank.
pub fn reduce_sum<B, T, const RANK: usize>(
    group: &B,
    tensor: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if group.world_size() == 1 {
        return Ok(tensor.clone());
    }
    trace!(rank = group.rank(), shape = ?tensor.shape(), "reduce_sum");
    Ok(group.all_reduce_sum(tensor)?)
}

/// Issues [`reduce_sum`] without waiting; call [`PendingReduce::wait`] before using the result.
pub fn reduce_sum_async<B, T, const RANK: usize>(
    group: &B,
    tensor: Tensor<T, RANK>,
) -> Result<PendingReduce<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if group.world_size() == 1 {
        return Ok(PendingReduce::ready(tensor));
    }
    trace!(rank = group.rank(), shape = ?tensor.shape(), "reduce_sum_async");
    Ok(group.all_reduce_sum_async(tensor)?)
}

/// Replaces `tensor` with `root`'s value on every rank.
pub fn broadcast<B, T, const RANK: usize>(
    group: &B,
    tensor: &Tensor<T, RANK>,
    root: usize,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    trace!(rank = group.rank(), root, "broadcast");
    Ok(group.broadcast(tensor, root)?)
}
