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

//! Interaction network over all ordered constituent pairs
//!
//! Edges are laid out receiver-major: edge `r * (N - 1) + k` has receiver `r`
//! and the `k`-th other constituent as sender. The effects and objects MLPs
//! are weight-shared across edges and nodes respectively, which is what the
//! 1x1 convolutions of the hardware formulation compute.

use super::deepsets::default_nclasses;
use super::JetNetwork;
use crate::layers::{global_average_pool, ActivationLayer, QDense};
use crate::model::{LayerInfo, ModelInfo};
use crate::optimization::quantization::{Activation, QuantizerSpec};
use crate::{QjetError, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

/// How incoming edge effects are combined per receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Mean,
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntNetConfig {
    #[serde(default = "default_effects_nodes")]
    pub effects_nodes: Vec<usize>,
    #[serde(default = "default_objects_nodes")]
    pub objects_nodes: Vec<usize>,
    #[serde(default = "default_classifier_nodes")]
    pub classifier_nodes: Vec<usize>,
    #[serde(default = "default_activ")]
    pub activ: Activation,
    #[serde(default)]
    pub nbits: Option<u8>,
    #[serde(default = "default_nclasses")]
    pub nclasses: usize,
    #[serde(default)]
    pub aggregation: Aggregation,
}

fn default_effects_nodes() -> Vec<usize> {
    vec![16, 8]
}

fn default_objects_nodes() -> Vec<usize> {
    vec![16, 8]
}

fn default_classifier_nodes() -> Vec<usize> {
    vec![16]
}

fn default_activ() -> Activation {
    Activation::Relu
}

impl Default for IntNetConfig {
    fn default() -> Self {
        Self {
            effects_nodes: default_effects_nodes(),
            objects_nodes: default_objects_nodes(),
            classifier_nodes: default_classifier_nodes(),
            activ: default_activ(),
            nbits: None,
            nclasses: default_nclasses(),
            aggregation: Aggregation::default(),
        }
    }
}

impl IntNetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.effects_nodes.is_empty() || self.objects_nodes.is_empty() {
            return Err(QjetError::InvalidConfiguration {
                message: "intnet needs at least one effects and one objects layer".to_string(),
            });
        }
        let widths = self
            .effects_nodes
            .iter()
            .chain(&self.objects_nodes)
            .chain(&self.classifier_nodes);
        if widths.into_iter().any(|&w| w == 0) {
            return Err(QjetError::InvalidConfiguration {
                message: "intnet layer widths must be positive".to_string(),
            });
        }
        if self.nclasses < 2 {
            return Err(QjetError::InvalidConfiguration {
                message: format!("need at least 2 classes, got {}", self.nclasses),
            });
        }
        Ok(())
    }
}

/// Weight-shared MLP applied over the last axis
#[derive(Debug, Clone)]
struct SharedMlp {
    layers: Vec<(QDense, ActivationLayer)>,
}

impl SharedMlp {
    fn new(in_dim: usize, widths: &[usize], config: &IntNetConfig, vb: VarBuilder) -> Result<Self> {
        let quantizer = config.nbits.map(QuantizerSpec::from_bits).transpose()?;
        let activation = ActivationLayer::new(config.activ, config.nbits)?;
        let mut layers = Vec::with_capacity(widths.len());
        let mut dim = in_dim;
        for (i, &width) in widths.iter().enumerate() {
            let dense = QDense::new(dim, width, true, quantizer, vb.pp(i.to_string()))?;
            layers.push((dense, activation));
            dim = width;
        }
        Ok(Self { layers })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        for (dense, activation) in &self.layers {
            x = activation.forward(&dense.forward(&x)?)?;
        }
        Ok(x)
    }

    fn out_dim(&self, in_dim: usize) -> usize {
        self.layers.last().map(|(d, _)| d.out_dim()).unwrap_or(in_dim)
    }
}

/// Receiver and sender indices for every ordered pair, receiver-major
pub fn edge_indices(nconst: usize) -> (Vec<u32>, Vec<u32>) {
    let nedges = nconst * nconst.saturating_sub(1);
    let mut receivers = Vec::with_capacity(nedges);
    let mut senders = Vec::with_capacity(nedges);
    for r in 0..nconst {
        for s in 0..nconst {
            if r != s {
                receivers.push(r as u32);
                senders.push(s as u32);
            }
        }
    }
    (receivers, senders)
}

fn mlp_info(
    layers: &mut Vec<LayerInfo>,
    shape: &mut Vec<usize>,
    prefix: &str,
    widths: &[usize],
    dense_type: &str,
    act_type: &str,
) {
    for (i, &width) in widths.iter().enumerate() {
        let dense = LayerInfo::dense(&format!("{}_{}", prefix, i), dense_type, shape, width, true);
        *shape = dense.output_shape.clone();
        layers.push(dense);
        layers.push(LayerInfo::elementwise(
            &format!("{}_{}_activation", prefix, i),
            act_type,
            shape,
        ));
    }
}

/// Interaction network classifier
#[derive(Debug, Clone)]
pub struct QConvIntNet {
    config: IntNetConfig,
    nconst: usize,
    receivers: Tensor,
    senders: Tensor,
    effects: SharedMlp,
    objects: SharedMlp,
    classifier: SharedMlp,
    head: QDense,
}

impl QConvIntNet {
    pub fn new(input_shape: [usize; 2], config: &IntNetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let [nconst, nfeats] = input_shape;
        if nconst < 2 {
            return Err(QjetError::InvalidConfiguration {
                message: format!("intnet needs at least 2 constituents, got {}", nconst),
            });
        }

        let (receivers, senders) = edge_indices(nconst);
        let device: &Device = vb.device();
        let receivers = Tensor::new(receivers.as_slice(), device)?;
        let senders = Tensor::new(senders.as_slice(), device)?;

        let effects = SharedMlp::new(2 * nfeats, &config.effects_nodes, config, vb.pp("effects"))?;
        let effects_dim = effects.out_dim(2 * nfeats);
        let objects = SharedMlp::new(
            nfeats + effects_dim,
            &config.objects_nodes,
            config,
            vb.pp("objects"),
        )?;
        let objects_dim = objects.out_dim(nfeats + effects_dim);
        let classifier = SharedMlp::new(
            objects_dim,
            &config.classifier_nodes,
            config,
            vb.pp("classifier"),
        )?;
        let head = QDense::float(
            classifier.out_dim(objects_dim),
            config.nclasses,
            vb.pp("head"),
        )?;

        Ok(Self {
            config: config.clone(),
            nconst,
            receivers,
            senders,
            effects,
            objects,
            classifier,
            head,
        })
    }

    /// Per-node representation after the objects MLP, `(batch, nconst, objects_dim)`
    pub fn node_output(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, nconst, _) = xs.dims3()?;
        if nconst != self.nconst {
            return Err(QjetError::ShapeMismatch {
                expected: vec![self.nconst],
                actual: vec![nconst],
            });
        }

        let xs = xs.contiguous()?;
        let recv = xs.index_select(&self.receivers, 1)?;
        let send = xs.index_select(&self.senders, 1)?;
        let edges = Tensor::cat(&[&recv, &send], 2)?;

        let effects = self.effects.forward(&edges)?;
        let effects_dim = effects.dim(2)?;
        let effects = effects.reshape((batch, nconst, nconst - 1, effects_dim))?;
        let aggregated = match self.config.aggregation {
            Aggregation::Mean => effects.mean(2)?,
            Aggregation::Sum => effects.sum(2)?,
        };

        let nodes = Tensor::cat(&[&xs, &aggregated], 2)?;
        self.objects.forward(&nodes)
    }

    pub fn info(&self, input_shape: [usize; 2]) -> ModelInfo {
        let config = &self.config;
        let [nconst, nfeats] = input_shape;
        let nedges = nconst * (nconst - 1);
        let (dense_type, act_type) = if config.nbits.is_some() {
            ("QDense", "QActivation")
        } else {
            ("Dense", "Activation")
        };

        let mut layers = vec![LayerInfo::reshape(
            "edge_gather",
            "Gather",
            &[nconst, nfeats],
            &[nedges, 2 * nfeats],
        )];
        let mut shape = vec![nedges, 2 * nfeats];

        mlp_info(&mut layers, &mut shape, "effects", &config.effects_nodes, dense_type, act_type);
        let effects_dim = *shape.last().unwrap_or(&0);
        let edge_shape = vec![nconst, nconst - 1, effects_dim];
        layers.push(LayerInfo::reshape("edge_reshape", "Reshape", &shape, &edge_shape));
        let aggregate = LayerInfo::pooling("edge_aggregation", &edge_shape, 1, false);
        layers.push(aggregate);
        shape = vec![nconst, nfeats + effects_dim];
        layers.push(LayerInfo::reshape(
            "node_concat",
            "Concatenate",
            &[nconst, effects_dim],
            &shape,
        ));

        mlp_info(&mut layers, &mut shape, "objects", &config.objects_nodes, dense_type, act_type);
        let pool = LayerInfo::pooling("node_pooling", &shape, 0, false);
        shape = pool.output_shape.clone();
        layers.push(pool);
        mlp_info(
            &mut layers,
            &mut shape,
            "classifier",
            &config.classifier_nodes,
            dense_type,
            act_type,
        );
        layers.push(LayerInfo::dense("head", "Dense", &shape, config.nclasses, true));

        let architecture = if config.nbits.is_some() {
            "qintnet"
        } else {
            "intnet"
        };
        ModelInfo::from_layers(
            "qconv_intnet",
            architecture,
            &input_shape,
            config.nbits.map(|b| b as usize).unwrap_or(32),
            layers,
        )
    }
}

impl JetNetwork for QConvIntNet {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let x = global_average_pool(&self.node_output(xs)?)?;
        let x = self.classifier.forward(&x)?;
        self.head.forward(&x)
    }

    fn name(&self) -> &str {
        "qconv_intnet"
    }
}
