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

//! Fully connected student network on the flattened jet

use super::deepsets::default_nclasses;
use super::JetNetwork;
use crate::layers::{dropout, ActivationLayer, QDense};
use crate::model::{LayerInfo, ModelInfo};
use crate::optimization::quantization::{Activation, QuantizerSpec};
use crate::{QjetError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

const HIDDEN_LAYERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JediDnnConfig {
    #[serde(default = "default_node_size")]
    pub node_size: usize,
    #[serde(default = "default_activ")]
    pub activ: Activation,
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f32,
    #[serde(default = "default_nclasses")]
    pub nclasses: usize,
    #[serde(default)]
    pub nbits: Option<u8>,
}

fn default_node_size() -> usize {
    64
}

fn default_activ() -> Activation {
    Activation::Relu
}

fn default_dropout_rate() -> f32 {
    0.1
}

impl Default for JediDnnConfig {
    fn default() -> Self {
        Self {
            node_size: default_node_size(),
            activ: default_activ(),
            dropout_rate: default_dropout_rate(),
            nclasses: default_nclasses(),
            nbits: None,
        }
    }
}

impl JediDnnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_size == 0 {
            return Err(QjetError::InvalidConfiguration {
                message: "node_size must be positive".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(QjetError::InvalidConfiguration {
                message: format!("dropout_rate must be in [0, 1), got {}", self.dropout_rate),
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

/// Flatten, three hidden dense blocks with dropout, float head
#[derive(Debug, Clone)]
pub struct JediDnn {
    config: JediDnnConfig,
    hidden: Vec<(QDense, ActivationLayer)>,
    head: QDense,
}

impl JediDnn {
    pub fn new(input_shape: [usize; 2], config: &JediDnnConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let quantizer = config.nbits.map(QuantizerSpec::from_bits).transpose()?;
        let activation = ActivationLayer::new(config.activ, config.nbits)?;

        let mut hidden = Vec::with_capacity(HIDDEN_LAYERS);
        let mut dim = input_shape[0] * input_shape[1];
        for i in 0..HIDDEN_LAYERS {
            let dense = QDense::new(
                dim,
                config.node_size,
                true,
                quantizer,
                vb.pp(format!("dense_{}", i)),
            )?;
            hidden.push((dense, activation));
            dim = config.node_size;
        }
        let head = QDense::float(dim, config.nclasses, vb.pp("head"))?;

        Ok(Self {
            config: config.clone(),
            hidden,
            head,
        })
    }

    pub fn info(&self, input_shape: [usize; 2]) -> ModelInfo {
        let config = &self.config;
        let flat = vec![input_shape[0] * input_shape[1]];
        let mut layers = vec![LayerInfo::reshape("flatten", "Flatten", &input_shape, &flat)];
        let mut shape = flat;
        for (i, (dense, activation)) in self.hidden.iter().enumerate() {
            let info = LayerInfo::dense(
                &format!("dense_{}", i),
                dense.layer_type(),
                &shape,
                config.node_size,
                true,
            );
            shape = info.output_shape.clone();
            layers.push(info);
            layers.push(LayerInfo::elementwise(
                &format!("activation_{}", i),
                activation.layer_type(),
                &shape,
            ));
            layers.push(LayerInfo::elementwise(&format!("dropout_{}", i), "Dropout", &shape));
        }
        layers.push(LayerInfo::dense("head", "Dense", &shape, config.nclasses, true));

        let architecture = if config.nbits.is_some() {
            "qjedidnn"
        } else {
            "jedidnn"
        };
        ModelInfo::from_layers(
            "jedidnn",
            architecture,
            &input_shape,
            config.nbits.map(|b| b as usize).unwrap_or(32),
            layers,
        )
    }
}

impl JetNetwork for JediDnn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = xs.flatten_from(1)?;
        for (dense, activation) in &self.hidden {
            x = activation.forward(&dense.forward(&x)?)?;
            x = dropout(&x, self.config.dropout_rate, train)?;
        }
        self.head.forward(&x)
    }

    fn name(&self) -> &str {
        "jedidnn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_jedidnn_forward() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = JediDnn::new([8, 3], &JediDnnConfig::default(), vb).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (5, 8, 3), &Device::Cpu).unwrap();

        assert_eq!(net.forward_t(&xs, true).unwrap().dims(), &[5, 5]);
        let a = net.forward_t(&xs, false).unwrap().to_vec2::<f32>().unwrap();
        let b = net.forward_t(&xs, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_jedidnn_info() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = JediDnnConfig {
            node_size: 10,
            ..Default::default()
        };
        let net = JediDnn::new([4, 2], &config, vb).unwrap();
        let info = net.info([4, 2]);
        assert_eq!(info.parameter_count, (8 * 10 + 10) + 2 * (10 * 10 + 10) + (10 * 5 + 5));
        assert_eq!(info.layers[0].layer_type, "Flatten");
        assert_eq!(info.architecture, "jedidnn");
    }

    #[test]
    fn test_quantized_jedidnn_info() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = JediDnnConfig {
            nbits: Some(4),
            ..Default::default()
        };
        let net = JediDnn::new([4, 2], &config, vb).unwrap();
        let info = net.info([4, 2]);
        assert_eq!(info.architecture, "qjedidnn");
        assert_eq!(info.model_size_bytes, (info.parameter_count * 4).div_ceil(8));
    }

    #[test]
    fn test_invalid_dropout() {
        let config = JediDnnConfig {
            dropout_rate: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
