//! # tp-linear
//!
//! `tp-linear` is a pure Rust implementation of tensor-parallel linear layers: a dense weight
//! matrix is sliced across a group of cooperating ranks so that no rank holds the full matrix,
//! while the composed operation stays numerically equivalent to the dense `y = xAᵀ + b`.
//!
//! It runs on **CPU only**. Ranks are threads wired into a ring by
//! [`distributed::CpuBackend`], but the layers only see the [`distributed::CollectiveBackend`]
//! trait and so do not care how the group is realised.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Row-major N-dimensional tensor with a const-generic rank.
//! - [`nn`]: The dense [`nn::Linear`] layer and parameter initialisers.
//! - [`random`]: Ambient per-thread RNG and the scoped fork used for deterministic sharded init.
//! - [`distributed`]: Collectives, sharding helpers and the two parallel layers.
//! - [`optim`]: Optimisers that update layer shards in place.
//!
//! ## Example
//!
//! ```rust
//! use tp_linear::distributed::{launch, ColumnParallelConfig, ColumnParallelLinear, ParallelModule};
//! use tp_linear::tensor::Tensor;
//!
//! let outputs = launch(2, |group| {
//!     let config = ColumnParallelConfig { gather_output: true, ..Default::default() };
//!     let layer = ColumnParallelLinear::<f32>::new(group, 4, 8, config).unwrap();
//!     let x = Tensor::<f32, 2>::ones([3, 4]);
//!     layer.forward(group, &x).unwrap().into_output()
//! })
//! .unwrap();
//!
//! // The gathered output is replicated on every rank.
//! assert_eq!(outputs[0].shape(), &[3, 8]);
//! assert_eq!(outputs[0], outputs[1]);
//! ```

pub mod distributed;
pub mod nn;
pub mod optim;
pub mod random;
pub mod tensor;

pub use tensor::{Tensor, TensorElem, TensorError};
