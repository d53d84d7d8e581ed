// Copyright 2025 Gibran Rodriguez <brangi000@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! DeepSets networks for unordered constituent sets
//!
//! The invariant network applies a weight-shared per-constituent MLP (phi),
//! averages over the set and classifies the pooled vector (rho + head). The
//! equivariant network replaces phi with permutation-equivariant layers
//! `act(gamma(x) - lambda(mean(x)))` before the same pooling and head.
//!
//! With `nbits` set, every dense layer and activation except the output head
//! is quantization-aware. The head always produces raw float logits.
//!
//! Known limitation: the keep-dims pooling inside the equivariant layers is
//! not available in the HLS conversion of global pooling layers, so the
//! equivariant variant cannot be synthesised yet.

use super::JetNetwork;
use crate::layers::{global_average_pool, global_average_pool_keepdim, ActivationLayer, QDense};
use crate::model::{LayerInfo, ModelInfo};
use crate::optimization::quantization::{Activation, QuantizerSpec};
use crate::{QjetError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

/// Configuration shared by both DeepSets variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepSetsConfig {
    /// Width of the per-constituent stage
    #[serde(default = "default_nnodes_phi")]
    pub nnodes_phi: usize,
    /// Width of the post-pooling stage
    #[serde(default = "default_nnodes_rho")]
    pub nnodes_rho: usize,
    #[serde(default = "default_activ")]
    pub activ: Activation,
    /// Bit-width for weights, biases and activations; `None` keeps floats
    #[serde(default)]
    pub nbits: Option<u8>,
    #[serde(default = "default_nclasses")]
    pub nclasses: usize,
    /// Depth of the per-constituent stage (dense layers for the invariant
    /// network, equivariant layers for the equivariant one)
    #[serde(default = "default_phi_layers")]
    pub phi_layers: usize,
    #[serde(default = "default_rho_layers")]
    pub rho_layers: usize,
}

fn default_nnodes_phi() -> usize {
    32
}

fn default_nnodes_rho() -> usize {
    16
}

fn default_activ() -> Activation {
    Activation::Elu
}

pub(crate) fn default_nclasses() -> usize {
    5
}

fn default_phi_layers() -> usize {
    3
}

fn default_rho_layers() -> usize {
    1
}

impl Default for DeepSetsConfig {
    fn default() -> Self {
        Self {
            nnodes_phi: default_nnodes_phi(),
            nnodes_rho: default_nnodes_rho(),
            activ: default_activ(),
            nbits: None,
            nclasses: default_nclasses(),
            phi_layers: default_phi_layers(),
            rho_layers: default_rho_layers(),
        }
    }
}

impl DeepSetsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nnodes_phi == 0 || self.nnodes_rho == 0 {
            return Err(QjetError::InvalidConfiguration {
                message: "DeepSets layer widths must be positive".to_string(),
            });
        }
        if self.nclasses < 2 {
            return Err(QjetError::InvalidConfiguration {
                message: format!("need at least 2 classes, got {}", self.nclasses),
            });
        }
        if self.phi_layers == 0 {
            return Err(QjetError::InvalidConfiguration {
                message: "phi_layers must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn quantizer(&self) -> Result<Option<QuantizerSpec>> {
        self.nbits.map(QuantizerSpec::from_bits).transpose()
    }

    fn dense_type(&self) -> &'static str {
        if self.nbits.is_some() {
            "QDense"
        } else {
            "Dense"
        }
    }

    fn activation_type(&self) -> &'static str {
        if self.nbits.is_some() {
            "QActivation"
        } else {
            "Activation"
        }
    }
}

/// Dense layer followed by its activation
#[derive(Debug, Clone)]
struct DenseBlock {
    dense: QDense,
    activation: ActivationLayer,
}

impl DenseBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.activation.forward(&self.dense.forward(xs)?)
    }
}

fn dense_stack(
    in_dim: usize,
    width: usize,
    depth: usize,
    config: &DeepSetsConfig,
    vb: &VarBuilder,
    prefix: &str,
) -> Result<Vec<DenseBlock>> {
    let quantizer = config.quantizer()?;
    let activation = ActivationLayer::new(config.activ, config.nbits)?;
    let mut blocks = Vec::with_capacity(depth);
    let mut dim = in_dim;
    for i in 0..depth {
        let dense = QDense::new(dim, width, true, quantizer, vb.pp(format!("{}_{}", prefix, i)))?;
        blocks.push(DenseBlock { dense, activation });
        dim = width;
    }
    Ok(blocks)
}

fn stack_info(
    layers: &mut Vec<LayerInfo>,
    shape: &mut Vec<usize>,
    prefix: &str,
    width: usize,
    depth: usize,
    config: &DeepSetsConfig,
) {
    for i in 0..depth {
        let dense = LayerInfo::dense(
            &format!("{}_{}", prefix, i),
            config.dense_type(),
            shape,
            width,
            true,
        );
        *shape = dense.output_shape.clone();
        layers.push(dense);
        layers.push(LayerInfo::elementwise(
            &format!("{}_{}_activation", prefix, i),
            config.activation_type(),
            shape,
        ));
    }
}

fn bits_per_parameter(config: &DeepSetsConfig) -> usize {
    config.nbits.map(|b| b as usize).unwrap_or(32)
}

/// Permutation-invariant DeepSets network
#[derive(Debug, Clone)]
pub struct DeepSetsInvariant {
    config: DeepSetsConfig,
    phi: Vec<DenseBlock>,
    rho: Vec<DenseBlock>,
    head: QDense,
}

impl DeepSetsInvariant {
    pub fn new(input_shape: [usize; 2], config: &DeepSetsConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let [_, nfeats] = input_shape;
        let phi = dense_stack(nfeats, config.nnodes_phi, config.phi_layers, config, &vb, "phi")?;
        let rho = dense_stack(
            config.nnodes_phi,
            config.nnodes_rho,
            config.rho_layers,
            config,
            &vb,
            "rho",
        )?;
        let head_in = if config.rho_layers == 0 {
            config.nnodes_phi
        } else {
            config.nnodes_rho
        };
        let head = QDense::float(head_in, config.nclasses, vb.pp("head"))?;

        Ok(Self {
            config: config.clone(),
            phi,
            rho,
            head,
        })
    }

    /// Per-constituent representation before pooling, `(batch, nconst, nnodes_phi)`
    pub fn phi_output(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        for block in &self.phi {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    pub fn info(&self, input_shape: [usize; 2]) -> ModelInfo {
        let config = &self.config;
        let mut layers = Vec::new();
        let mut shape = input_shape.to_vec();

        stack_info(&mut layers, &mut shape, "phi", config.nnodes_phi, config.phi_layers, config);
        let pool = LayerInfo::pooling("invariant_pooling", &shape, 0, false);
        shape = pool.output_shape.clone();
        layers.push(pool);
        stack_info(&mut layers, &mut shape, "rho", config.nnodes_rho, config.rho_layers, config);
        layers.push(LayerInfo::dense("head", "Dense", &shape, config.nclasses, true));

        let architecture = if config.nbits.is_some() {
            "qinvariant"
        } else {
            "invariant"
        };
        ModelInfo::from_layers(
            "deepsets_invariant",
            architecture,
            &input_shape,
            bits_per_parameter(config),
            layers,
        )
    }
}

impl JetNetwork for DeepSetsInvariant {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let mut x = global_average_pool(&self.phi_output(xs)?)?;
        for block in &self.rho {
            x = block.forward(&x)?;
        }
        self.head.forward(&x)
    }

    fn name(&self) -> &str {
        "deepsets_invariant"
    }
}

/// `act(gamma(x) - lambda(mean_set(x)))`, equivariant under set permutations
#[derive(Debug, Clone)]
pub struct PermutationEquivariant {
    gamma: QDense,
    lambda: QDense,
    activation: ActivationLayer,
}

impl PermutationEquivariant {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        config: &DeepSetsConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let quantizer = config.quantizer()?;
        Ok(Self {
            gamma: QDense::new(in_dim, out_dim, true, quantizer, vb.pp("gamma"))?,
            lambda: QDense::new(in_dim, out_dim, false, quantizer, vb.pp("lambda"))?,
            activation: ActivationLayer::new(config.activ, config.nbits)?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x_lambda = self.lambda.forward(&global_average_pool_keepdim(xs)?)?;
        let x_gamma = self.gamma.forward(xs)?;
        self.activation.forward(&x_gamma.broadcast_sub(&x_lambda)?)
    }
}

/// Permutation-equivariant DeepSets network with a pooled classification head
#[derive(Debug, Clone)]
pub struct DeepSetsEquivariant {
    config: DeepSetsConfig,
    equivariant: Vec<PermutationEquivariant>,
    rho: Vec<DenseBlock>,
    head: QDense,
}

impl DeepSetsEquivariant {
    pub fn new(input_shape: [usize; 2], config: &DeepSetsConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let [_, nfeats] = input_shape;
        let mut equivariant = Vec::with_capacity(config.phi_layers);
        let mut dim = nfeats;
        for i in 0..config.phi_layers {
            equivariant.push(PermutationEquivariant::new(
                dim,
                config.nnodes_phi,
                config,
                vb.pp(format!("equivariant_{}", i)),
            )?);
            dim = config.nnodes_phi;
        }
        let rho = dense_stack(
            config.nnodes_phi,
            config.nnodes_rho,
            config.rho_layers,
            config,
            &vb,
            "rho",
        )?;
        let head_in = if config.rho_layers == 0 {
            config.nnodes_phi
        } else {
            config.nnodes_rho
        };
        let head = QDense::float(head_in, config.nclasses, vb.pp("head"))?;

        Ok(Self {
            config: config.clone(),
            equivariant,
            rho,
            head,
        })
    }

    /// Per-constituent representation after the equivariant stack
    pub fn per_element(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        for layer in &self.equivariant {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    pub fn info(&self, input_shape: [usize; 2]) -> ModelInfo {
        let config = &self.config;
        let mut layers = Vec::new();
        let mut shape = input_shape.to_vec();

        for i in 0..config.phi_layers {
            let prefix = format!("equivariant_{}", i);
            let pool = LayerInfo::pooling(&format!("{}_pooling", prefix), &shape, 0, true);
            let lambda = LayerInfo::dense(
                &format!("{}_lambda", prefix),
                config.dense_type(),
                &pool.output_shape,
                config.nnodes_phi,
                false,
            );
            let gamma = LayerInfo::dense(
                &format!("{}_gamma", prefix),
                config.dense_type(),
                &shape,
                config.nnodes_phi,
                true,
            );
            shape = gamma.output_shape.clone();
            layers.push(pool);
            layers.push(lambda);
            layers.push(gamma);
            layers.push(LayerInfo::elementwise(&format!("{}_subtract", prefix), "Subtract", &shape));
            layers.push(LayerInfo::elementwise(
                &format!("{}_activation", prefix),
                config.activation_type(),
                &shape,
            ));
        }

        let pool = LayerInfo::pooling("invariant_pooling", &shape, 0, false);
        shape = pool.output_shape.clone();
        layers.push(pool);
        stack_info(&mut layers, &mut shape, "rho", config.nnodes_rho, config.rho_layers, config);
        layers.push(LayerInfo::dense("head", "Dense", &shape, config.nclasses, true));

        let architecture = if config.nbits.is_some() {
            "qequivariant"
        } else {
            "equivariant"
        };
        ModelInfo::from_layers(
            "deepsets_equivariant",
            architecture,
            &input_shape,
            bits_per_parameter(config),
            layers,
        )
    }
}

impl JetNetwork for DeepSetsEquivariant {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let mut x = global_average_pool(&self.per_element(xs)?)?;
        for block in &self.rho {
            x = block.forward(&x)?;
        }
        self.head.forward(&x)
    }

    fn name(&self) -> &str {
        "deepsets_equivariant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_invariant_output_classes() {
        let varmap = VarMap::new();
        let config = DeepSetsConfig {
            nclasses: 3,
            ..Default::default()
        };
        let net = DeepSetsInvariant::new([8, 4], &config, vb(&varmap)).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (2, 8, 4), &Device::Cpu).unwrap();
        let out = net.forward_t(&xs, false).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
    }

    #[test]
    fn test_invariant_parameter_count() {
        let varmap = VarMap::new();
        let config = DeepSetsConfig::default();
        let net = DeepSetsInvariant::new([150, 16], &config, vb(&varmap)).unwrap();
        let info = net.info([150, 16]);

        // phi: 16->32, 32->32, 32->32; rho: 32->16; head: 16->5
        let expected = (16 * 32 + 32) + 2 * (32 * 32 + 32) + (32 * 16 + 16) + (16 * 5 + 5);
        assert_eq!(info.parameter_count, expected);

        let stored: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(stored, expected);
        assert_eq!(info.output_shape, vec![5]);
    }

    #[test]
    fn test_equivariant_parameter_count() {
        let varmap = VarMap::new();
        let config = DeepSetsConfig {
            nbits: Some(8),
            ..Default::default()
        };
        let net = DeepSetsEquivariant::new([10, 3], &config, vb(&varmap)).unwrap();
        let info = net.info([10, 3]);
        let stored: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(info.parameter_count, stored);
        assert_eq!(info.architecture, "qequivariant");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let varmap = VarMap::new();
        let config = DeepSetsConfig {
            nclasses: 1,
            ..Default::default()
        };
        assert!(DeepSetsInvariant::new([4, 4], &config, vb(&varmap)).is_err());
    }
}
