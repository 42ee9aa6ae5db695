//! # Tensor-Parallel Linear Layers
//!
//! Tensor parallelism splits the *weights* of a layer across ranks instead of the data. A linear
//! layer `y = xAᵀ + b` with `A: [out, in]` can be split two ways:
//!
//! *   **Column-parallel** ([`ColumnParallelLinear`]): each rank owns a block of *output* rows of
//!     `A`. Given the full input, a rank computes its slice of the output features.
//! *   **Row-parallel** ([`RowParallelLinear`]): each rank owns a block of *input* columns of `A`.
//!     Given its slice of the input features, a rank computes a partial sum of the full output;
//!     an all-reduce adds the partial sums up.
//!
//! Chaining a column-parallel layer (output left sharded) into a row-parallel layer (input
//! expected sharded) costs a single all-reduce per pair of layers:
//!
//! ```text
//! x (replicated) ─▶ Column ─▶ h (sharded) ─▶ act ─▶ Row ─▶ all-reduce ─▶ y (replicated)
//! ```
//!
//! ## Module Contents
//!
//! *   [`CollectiveBackend`]: the process group handle, and [`CpuBackend`], an in-process ring of
//!     rank threads.
//! *   [`comm`]: the collective primitives `all_gather`, `split`, `reduce_sum`,
//!     `reduce_sum_async` and `broadcast`.
//! *   [`ParallelRegion`]: where collectives sit in the forward and backward pass.
//! *   [`sharding`]: how logical tensors map to per-rank shards.
//! *   [`ParallelModule`]: the capability shared by both layers, including conversion from a
//!     dense [`Linear`](crate::nn::Linear).
//!
//! The process group is always passed explicitly. Every rank must issue the same collectives in
//! the same order, which in practice means building identical layers with identical
//! configurations on every rank and calling them in the same sequence.

pub mod backend;
pub mod column;
pub mod comm;
pub mod cpu_backend;
pub mod error;
pub mod parallel_module;
pub mod region;
pub mod row;
pub mod sharding;

pub use backend::{CollectiveBackend, CollectiveError, PendingReduce};
pub use column::{ColumnParallelConfig, ColumnParallelLinear};
pub use cpu_backend::{launch, CpuBackend};
pub use error::ParallelError;
pub use parallel_module::{Conversion, ParallelModule, ParallelOutput};
pub use region::ParallelRegion;
pub use row::{RowParallelConfig, RowParallelLinear};
pub use sharding::{Layout, Shard};
