use super::backend::CollectiveBackend;
use super::error::{ParallelError, Result};
use super::parallel_module::{check_group, check_input, Conversion, ParallelModule, ParallelOutput};
use super::region::ParallelRegion;
use super::sharding::{divide, gather_full, shard_colwise, shard_rowwise, Layout};
use crate::nn::init::{Initializer, BIAS_STREAM, WEIGHT_STREAM};
use crate::nn::linear::{input_grad, linear, weight_grad};
use crate::nn::{Linear, LinearGrads, Module};
use crate::optim::Optimizer;
use crate::random::{initial_seed, Randomizer};
use crate::tensor::{Tensor, TensorElem, TensorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Construction options of a [`ColumnParallelLinear`].
///
/// Missing fields take their defaults when deserialised:
///
/// ```rust
/// use tp_linear::distributed::ColumnParallelConfig;
///
/// let config: ColumnParallelConfig = serde_json::from_str(r#"{"gather_output": true}"#).unwrap();
/// assert!(config.gather_output);
/// assert!(config.bias);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnParallelConfig {
    pub bias: bool,
    /// All-gather the output so it is replicated, instead of leaving it sharded.
    pub gather_output: bool,
    /// Return the bias shard alongside the output instead of adding it.
    pub skip_bias_add: bool,
    pub weight_init: Initializer,
    pub bias_init: Initializer,
    /// Base seed of the initialisers. Defaults to the calling thread's ambient initial seed.
    pub seed: Option<u64>,
}

impl Default for ColumnParallelConfig {
    fn default() -> Self {
        Self {
            bias: true,
            gather_output: false,
            skip_bias_add: false,
            weight_init: Initializer::default_weight(),
            bias_init: Initializer::default_bias(),
            seed: None,
        }
    }
}

impl ColumnParallelConfig {
    fn validate(&self) -> Result<()> {
        if self.skip_bias_add && !self.bias {
            return Err(ParallelError::SkipBiasWithoutBias);
        }
        Ok(())
    }
}

/// Linear layer with its weight split along the output dimension.
///
/// Rank `r` of `P` holds rows `[r · out/P, (r + 1) · out/P)` of the logical `[out, in]` weight
/// and the matching slice of the bias. The input must be replicated; the output is sharded along
/// its last dimension unless `gather_output` is set.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear<T: TensorElem> {
    weight: Tensor<T, 2>,
    bias: Option<Tensor<T, 1>>,
    in_features: usize,
    out_features: usize,
    rank: usize,
    world_size: usize,
    gather_output: bool,
    skip_bias_add: bool,
    weight_init: Initializer,
    bias_init: Initializer,
    randomizer: Randomizer,
    training: bool,
}

impl<T: TensorElem> ColumnParallelLinear<T> {
    const NAME: &'static str = "ColumnParallelLinear";

    /// Creates a freshly initialised layer.
    pub fn new<B: CollectiveBackend>(
        group: &B,
        in_features: usize,
        out_features: usize,
        config: ColumnParallelConfig,
    ) -> Result<Self> {
        config.validate()?;
        let out_per_partition = divide(out_features, group.world_size(), "out_features")?;

        let mut layer = Self::with_config(
            group,
            Tensor::zeros([out_per_partition, in_features]),
            config.bias.then(|| Tensor::zeros([out_per_partition])),
            &config,
        );
        layer.init_parameters()?;
        debug!(
            rank = layer.rank,
            in_features, out_features, "initialised ColumnParallelLinear"
        );
        Ok(layer)
    }

    /// Creates a layer from this rank's weight shard `[out/P, in]` and bias shard `[out/P]`.
    pub fn from_parts<B: CollectiveBackend>(
        group: &B,
        weight: Tensor<T, 2>,
        bias: Option<Tensor<T, 1>>,
        config: ColumnParallelConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.bias != bias.is_some() {
            return Err(ParallelError::BiasMismatch {
                configured: config.bias,
                supplied: bias.is_some(),
            });
        }
        if let Some(b) = &bias {
            if b.shape()[0] != weight.shape()[0] {
                return Err(ParallelError::ParameterShape {
                    name: "bias",
                    expected: vec![weight.shape()[0]],
                    got: b.shape().to_vec(),
                });
            }
        }

        let layer = Self::with_config(group, weight, bias, &config);
        debug!(
            rank = layer.rank,
            in_features = layer.in_features,
            out_features = layer.out_features,
            "built ColumnParallelLinear from supplied shards"
        );
        Ok(layer)
    }

    fn with_config<B: CollectiveBackend>(
        group: &B,
        weight: Tensor<T, 2>,
        bias: Option<Tensor<T, 1>>,
        config: &ColumnParallelConfig,
    ) -> Self {
        let [out_per_partition, in_features] = *weight.shape();
        Self {
            weight,
            bias,
            in_features,
            out_features: out_per_partition * group.world_size(),
            rank: group.rank(),
            world_size: group.world_size(),
            gather_output: config.gather_output,
            skip_bias_add: config.skip_bias_add,
            weight_init: config.weight_init,
            bias_init: config.bias_init,
            randomizer: Randomizer::with_index(config.seed.unwrap_or_else(initial_seed)),
            training: true,
        }
    }

    fn init_parameters(&mut self) -> Result<()> {
        let rows = self.out_features_per_partition();
        let owned = self.rank * rows..(self.rank + 1) * rows;

        let weight = self.weight_init.fill_block(
            &self.randomizer,
            WEIGHT_STREAM,
            self.in_features,
            owned.clone(),
            0..self.in_features,
            self.in_features,
            Some(self.out_features),
        )?;
        self.weight = Tensor::new(weight, [rows, self.in_features])?;

        if self.bias.is_some() {
            let bias = self.bias_init.fill_block(
                &self.randomizer,
                BIAS_STREAM,
                self.out_features,
                0..1,
                owned,
                self.in_features,
                None,
            )?;
            self.bias = Some(Tensor::new(bias, [rows])?);
        }
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

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn out_features_per_partition(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn gather_output(&self) -> bool {
        self.gather_output
    }

    pub fn skip_bias_add(&self) -> bool {
        self.skip_bias_add
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

    /// Layout of the forward output for inputs of rank `RANK`.
    pub fn output_layout<const RANK: usize>(&self) -> Layout {
        if self.gather_output || self.world_size == 1 {
            Layout::Replicated
        } else {
            Layout::Sharded {
                dim: RANK.saturating_sub(1),
            }
        }
    }

    /// Reassembles the dense layer on every rank. Collective.
    pub fn gather_dense<B: CollectiveBackend>(&self, group: &B) -> Result<Linear<T>> {
        check_group(group, self.rank, self.world_size)?;
        let weight = gather_full(group, &self.weight, 0)?;
        let bias = match &self.bias {
            Some(b) => Some(gather_full(group, b, 0)?),
            None => None,
        };
        Ok(Linear::new(weight, bias)?)
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
}

impl<T: TensorElem> Module<T> for ColumnParallelLinear<T> {
    fn num_parameters(&self) -> usize {
        self.weight.size() + self.bias.as_ref().map_or(0, Tensor::size)
    }
}

impl<T: TensorElem> ParallelModule<T> for ColumnParallelLinear<T> {
    type Config = ColumnParallelConfig;

    fn from_dense<B: CollectiveBackend>(
        dense: Linear<T>,
        group: &B,
        config: ColumnParallelConfig,
    ) -> Result<Conversion<Self, T>> {
        let config = ColumnParallelConfig {
            bias: dense.bias.is_some(),
            ..config
        };
        config.validate()?;

        let out_features = dense.out_features();
        if out_features < group.world_size() {
            return Ok(Conversion::fallback(
                dense,
                Self::NAME,
                out_features,
                group.world_size(),
            ));
        }
        divide(out_features, group.world_size(), "out_features")?;

        let weight = shard_rowwise(&dense.weight, group)?;
        let bias = match &dense.bias {
            Some(b) => Some(shard_colwise(b, group)?),
            None => None,
        };
        Ok(Conversion::Parallel(Self::from_parts(
            group, weight, bias, config,
        )?))
    }

    fn reset_parameters<B: CollectiveBackend>(&mut self, group: &B) -> Result<()> {
        check_group(group, self.rank, self.world_size)?;
        self.init_parameters()
    }

    fn forward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
    ) -> Result<ParallelOutput<T, RANK>> {
        check_group(group, self.rank, self.world_size)?;
        check_input(Self::NAME, input, &self.weight, self.in_features)?;

        // The replicated input is used as is; `Copy` only acts in the backward pass.
        let added_bias = if self.skip_bias_add {
            None
        } else {
            self.bias.as_ref()
        };
        let local = linear(input, &self.weight, added_bias)?;
        trace!(rank = self.rank, shape = ?local.shape(), "column-parallel local output");

        let output = if self.gather_output {
            ParallelRegion::Gather.forward(group, &local)?
        } else {
            local
        };
        let bias = if self.skip_bias_add {
            self.bias.clone()
        } else {
            None
        };
        Ok(ParallelOutput::new(output, bias))
    }

    fn backward<B: CollectiveBackend, const RANK: usize>(
        &self,
        group: &B,
        input: &Tensor<T, RANK>,
        grad_output: &Tensor<T, RANK>,
    ) -> Result<LinearGrads<T, RANK>> {
        check_group(group, self.rank, self.world_size)?;
        check_input(Self::NAME, input, &self.weight, self.in_features)?;
        let expected = if self.gather_output {
            self.out_features
        } else {
            self.out_features_per_partition()
        };
        if grad_output.shape() != &input.shape_with_last_dim(expected) {
            return Err(TensorError::ShapeMismatch {
                expected: input.shape_with_last_dim(expected).to_vec(),
                got: grad_output.shape().to_vec(),
            }
            .into());
        }

        let grad_local = if self.gather_output {
            ParallelRegion::Gather.backward(group, grad_output)?
        } else {
            grad_output.clone()
        };

        let weight = weight_grad(input, &grad_local)?;
        let bias = match (&self.bias, self.skip_bias_add) {
            (Some(_), false) => Some(grad_local.sum_rows()),
            _ => None,
        };
        let partial = input_grad(&grad_local, &self.weight)?;
        let input = ParallelRegion::Copy.backward(group, &partial)?;

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
