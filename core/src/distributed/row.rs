use super::backend::CollectiveBackend;
use super::comm::{broadcast, reduce_sum_async};
use super::error::{ParallelError, Result};
use super::parallel_module::{check_group, check_input, Conversion, ParallelModule, ParallelOutput};
use super::region::ParallelRegion;
use super::sharding::{divide, gather_full, shard_colwise, Layout};
use crate::nn::init::{Initializer, BIAS_STREAM, WEIGHT_STREAM};
use crate::nn::linear::{input_grad, linear, linear_rows, weight_grad};
use crate::nn::{Linear, LinearGrads, Module};
use crate::optim::Optimizer;
use crate::random::{initial_seed, Randomizer};
use crate::tensor::{Tensor, TensorElem, TensorError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::ops::Range;
use tracing::{debug, trace};

/// Construction options of a [`RowParallelLinear`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowParallelConfig {
    pub bias: bool,
    /// The input arrives already sharded along its last dimension.
    pub parallel_input: bool,
    /// Return the bias replica alongside the output instead of adding it.
    pub skip_bias_add: bool,
    /// Number of output blocks reduced one after another in inference. `1` disables streaming.
    pub stream_chunk_count: usize,
    pub weight_init: Initializer,
    pub bias_init: Initializer,
    /// Base seed of the initialisers. Defaults to the calling thread's ambient initial seed.
    pub seed: Option<u64>,
}

impl Default for RowParallelConfig {
    fn default() -> Self {
        Self {
            bias: true,
            parallel_input: true,
            skip_bias_add: false,
            stream_chunk_count: 1,
            weight_init: Initializer::default_weight(),
            bias_init: Initializer::default_bias(),
            seed: None,
        }
    }
}

impl RowParallelConfig {
    fn validate(&self) -> Result<()> {
        if self.skip_bias_add && !self.bias {
            return Err(ParallelError::SkipBiasWithoutBias);
        }
        Ok(())
    }
}

/// Splits `out_features` rows into `count` contiguous blocks whose sizes differ by at most one.
fn chunk_ranges(out_features: usize, count: usize) -> Result<Vec<Range<usize>>> {
    if count == 0 || (count > out_features && count != 1) {
        return Err(ParallelError::InvalidChunkCount {
            chunks: count,
            out_features,
        });
    }
    let base = out_features / count;
    let extra = out_features % count;
    let mut start = 0;
    Ok((0..count)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect())
}

/// Linear layer with its weight split along the input dimension.
///
/// Rank `r` of `P` holds columns `[r · in/P, (r + 1) · in/P)` of the logical `[out, in]` weight
/// and a full replica of the bias. Each rank computes a partial sum over its slice of the input
/// features; the partial sums are all-reduced and the bias is added once, after the reduction.
///
/// With `stream_chunk_count > 1` the layer is in *chunked inference* mode: the output features
/// are computed in blocks, each block's reduction is issued asynchronously before the next block
/// is computed, and the reduced blocks are concatenated. This mode only runs in eval mode.
#[derive(Debug, Clone)]
pub struct RowParallelLinear<T: TensorElem> {
    weight: Tensor<T, 2>,
    bias: Option<Tensor<T, 1>>,
    in_features: usize,
    out_features: usize,
    rank: usize,
    world_size: usize,
    parallel_input: bool,
    skip_bias_add: bool,
    chunks: Vec<Range<usize>>,
    weight_init: Initializer,
    bias_init: Initializer,
    randomizer: Randomizer,
    training: bool,
}

impl<T: TensorElem> RowParallelLinear<T> {
    const NAME: &'static str = "RowParallelLinear";

    /// Creates a freshly initialised layer. Collective: the bias is broadcast from rank 0.
    pub fn new<B: CollectiveBackend>(
        group: &B,
        in_features: usize,
        out_features: usize,
        config: RowParallelConfig,
    ) -> Result<Self> {
        config.validate()?;
        let in_per_partition = divide(in_features, group.world_size(), "in_features")?;
        let chunks = chunk_ranges(out_features, config.stream_chunk_count)?;

        let mut layer = Self::with_config(
            group,
            Tensor::zeros([out_features, in_per_partition]),
            config.bias.then(|| Tensor::zeros([out_features])),
            chunks,
            &config,
        );
        layer.reset_parameters(group)?;
        debug!(
            rank = layer.rank,
            in_features,
            out_features,
            chunks = layer.chunks.len(),
            "initialised RowParallelLinear"
        );
        Ok(layer)
    }

    /// Creates a layer from this rank's weight shard `[out, in/P]` and a bias `[out]`.
    ///
    /// Collective when a bias is supplied: rank 0's bias is broadcast so that every rank holds
    /// the same replica.
    pub fn from_parts<B: CollectiveBackend>(
        group: &B,
        weight: Tensor<T, 2>,
        bias: Option<Tensor<T, 1>>,
        config: RowParallelConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.bias != bias.is_some() {
            return Err(ParallelError::BiasMismatch {
                configured: config.bias,
                supplied: bias.is_some(),
            });
        }
        let out_features = weight.shape()[0];
        if let Some(b) = &bias {
            if b.shape()[0] != out_features {
                return Err(ParallelError::ParameterShape {
                    name: "bias",
                    expected: vec![out_features],
                    got: b.shape().to_vec(),
                });
            }
        }
        let chunks = chunk_ranges(out_features, config.stream_chunk_count)?;

        let mut layer = Self::with_config(group, weight, bias, chunks, &config);
        layer.sync_bias(group)?;
        debug!(
            rank = layer.rank,
            in_features = layer.in_features,
            out_features,
            "built RowParallelLinear from supplied shards"
        );
        Ok(layer)
    }

    fn with_config<B: CollectiveBackend>(
        group: &B,
        weight: Tensor<T, 2>,
        bias: Option<Tensor<T, 1>>,
        chunks: Vec<Range<usize>>,
        config: &RowParallelConfig,
    ) -> Self {
        let [out_features, in_per_partition] = *weight.shape();
        Self {
            weight,
            bias,
            in_features: in_per_partition * group.world_size(),
            out_features,
            rank: group.rank(),
            world_size: group.world_size(),
            parallel_input: config.parallel_input,
            skip_bias_add: config.skip_bias_add,
            chunks,
            weight_init: config.weight_init,
            bias_init: config.bias_init,
            randomizer: Randomizer::with_index(config.seed.unwrap_or_else(initial_seed)),
            training: true,
        }
    }

    fn sync_bias<B: CollectiveBackend>(&mut self, group: &B) -> Result<()> {
        self.bias = match &self.bias {
            Some(bias) => Some(broadcast(group, bias, 0)?),
            None => None,
        };
        Ok(())
    }

    pub fn weight(&self) -> &Tensor<T, 2> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<T, 1>> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn in_features_per_partition(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn parallel_input(&self) -> bool {
        self.parallel_input
    }

    pub fn skip_bias_add(&self) -> bool {
        self.skip_bias_add
    }

    pub fn stream_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The output rows computed by each stream chunk, in order.
    pub fn chunk_ranges(&self) -> &[Range<usize>] {
        &self.chunks
    }

    pub fn is_chunked(&self) -> bool {
        self.chunks.len() > 1
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn randomizer(&self) -> Randomizer {
        self.randomizer
    }

    /// Layout the forward pass expects its input in, for inputs of rank `RANK`.
    pub fn input_layout<const RANK: usize>(&self) -> Layout {
        if self.parallel_input && self.world_size > 1 {
            Layout::Sharded {
                dim: RANK.saturating_sub(1),
            }
        } else {
            Layout::Replicated
        }
    }

    /// Reassembles the dense layer on every rank. Collective.
    pub fn gather_dense<B: CollectiveBackend>(&self, group: &B) -> Result<Linear<T>> {
        check_group(group, self.rank, self.world_size)?;
        let weight = gather_full(group, &self.weight, 1)?;
        Ok(Linear::new(weight, self.bias.clone())?)
    }

    /// Applies `grads` to this rank's shards.
    pub fn apply_gradients<O: Optimizer<T>, const RANK: usize>(
        &mut self,
        optimizer: &O,
        grads: &LinearGrads<T, RANK>,
    ) -> Result<()> {
        optimizer.update(&mut self.weight, &grads.weight)?;
        if let (Some(bias), Some(grad)) = (self.bias.as_mut(), grads.bias.as_ref()) {
            optimizer.update(bias, grad)?;
        }
        Ok(())
    }

    /// This rank's slice of the input features, splitting a replicated input if needed.
    fn local_input<'a, B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &'a Tensor<T, RANK>,
    ) -> Result<Cow<'a, Tensor<T, RANK>>> {
        if self.parallel_input {
            check_input(
                Self::NAME,
                input,
                &self.weight,
                self.in_features_per_partition(),
            )?;
            Ok(Cow::Borrowed(input))
        } else {
            check_input(Self::NAME, input, &self.weight, self.in_features)?;
            Ok(Cow::Owned(ParallelRegion::Scatter.forward(group, input)?))
        }
    }

    fn forward_streamed<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
    ) -> Result<Tensor<T, RANK>> {
        let mut pending = Vec::with_capacity(self.chunks.len());
        for (i, rows) in self.chunks.iter().enumerate() {
            let partial = linear_rows(input, &self.weight, rows.clone(), None)?;
            trace!(rank = self.rank, chunk = i, rows = ?rows, "issue chunk reduction");
            pending.push(reduce_sum_async(group, partial)?);
        }

        let reduced = pending
            .into_iter()
            .map(|p| p.wait())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Tensor::cat(&reduced, RANK.saturating_sub(1))?)
    }
}

impl<T: TensorElem> Module<T> for RowParallelLinear<T> {
    fn num_parameters(&self) -> usize {
        self.weight.size() + self.bias.as_ref().map_or(0, Tensor::size)
    }
}

impl<T: TensorElem> ParallelModule<T> for RowParallelLinear<T> {
    type Config = RowParallelConfig;

    fn from_dense<B: CollectiveBackend>(
        dense: Linear<T>,
        group: &B,
        config: RowParallelConfig,
    ) -> Result<Conversion<Self, T>> {
        let config = RowParallelConfig {
            bias: dense.bias.is_some(),
            ..config
        };
        config.validate()?;

        let in_features = dense.in_features();
        if in_features < group.world_size() {
            return Ok(Conversion::fallback(
                dense,
                Self::NAME,
                in_features,
                group.world_size(),
            ));
        }
        divide(in_features, group.world_size(), "in_features")?;

        let weight = shard_colwise(&dense.weight, group)?;
        Ok(Conversion::Parallel(Self::from_parts(
            group, weight, dense.bias, config,
        )?))
    }

    /// Re-draws this rank's weight columns and the bias, then broadcasts rank 0's bias.
    fn reset_parameters<B: CollectiveBackend>(&mut self, group: &B) -> Result<()> {
        check_group(group, self.rank, self.world_size)?;
        let cols = self.in_features_per_partition();

        let weight = self.weight_init.fill_block(
            &self.randomizer,
            WEIGHT_STREAM,
            self.in_features,
            0..self.out_features,
            self.rank * cols..(self.rank + 1) * cols,
            self.in_features,
            Some(self.out_features),
        )?;
        self.weight = Tensor::new(weight, [self.out_features, cols])?;

        if self.bias.is_some() {
            let bias = self.bias_init.fill_block(
                &self.randomizer,
                BIAS_STREAM,
                self.out_features,
                0..1,
                0..self.out_features,
                self.in_features,
                None,
            )?;
            self.bias = Some(Tensor::new(bias, [self.out_features])?);
        }
        self.sync_bias(group)
    }

    fn forward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
    ) -> Result<ParallelOutput<T, RANK>> {
        if self.is_chunked() && self.training {
            return Err(ParallelError::ChunkedTraining);
        }
        check_group(group, self.rank, self.world_size)?;
        let local = self.local_input(group, input)?;
        let input: &Tensor<T, RANK> = &local;

        let output = if self.is_chunked() {
            self.forward_streamed(group, input)?
        } else {
            let partial = linear(input, &self.weight, None)?;
            ParallelRegion::Reduce.forward(group, &partial)?
        };

        match (&self.bias, self.skip_bias_add) {
            (Some(bias), false) => Ok(ParallelOutput::new(output.add_bias(bias)?, None)),
            (bias, true) => Ok(ParallelOutput::new(output, bias.clone())),
            (None, false) => Ok(ParallelOutput::new(output, None)),
        }
    }

    fn backward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
        grad_output: &Tensor<T, RANK>,
    ) -> Result<LinearGrads<T, RANK>> {
        if self.is_chunked() {
            return Err(ParallelError::ChunkedTraining);
        }
        check_group(group, self.rank, self.world_size)?;
        let expected = input.shape_with_last_dim(self.out_features);
        if grad_output.shape() != &expected {
            return Err(TensorError::ShapeMismatch {
                expected: expected.to_vec(),
                got: grad_output.shape().to_vec(),
            }
            .into());
        }
        let local = self.local_input(group, input)?;

        let grad = ParallelRegion::Reduce.backward(group, grad_output)?;
        let weight = weight_grad(local.as_ref(), &grad)?;
        let bias = match (&self.bias, self.skip_bias_add) {
            (Some(_), false) => Some(grad.sum_rows()),
            _ => None,
        };
        let partial = input_grad(&grad, &self.weight)?;
        let input = if self.parallel_input {
            partial
        } else {
            ParallelRegion::Scatter.backward(group, &partial)?
        };

        Ok(LinearGrads {
            input,
            weight,
            bias,
        })
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}
