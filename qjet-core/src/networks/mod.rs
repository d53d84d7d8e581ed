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

//! Network builders for jet tagging
//!
//! Every builder takes the per-jet input shape `(nconst, nfeats)`, its own
//! configuration and a `VarBuilder`, and returns the network together with a
//! [`ModelInfo`] describing its layer graph.

pub mod deepsets;
pub mod intnet;
pub mod student;

pub use deepsets::{DeepSetsConfig, DeepSetsEquivariant, DeepSetsInvariant};
pub use intnet::{Aggregation, IntNetConfig, QConvIntNet};
pub use student::{JediDnn, JediDnnConfig};

use crate::model::ModelInfo;
use crate::{QjetError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

/// A trainable jet classifier mapping `(batch, nconst, nfeats)` to logits
pub trait JetNetwork: Send + Sync {
    /// Forward pass; `train` enables dropout
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    /// Network name used in summaries
    fn name(&self) -> &str;
}

/// Architecture selection, tagged by `type` in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Architecture {
    /// DeepSets with mean pooling after the per-element stage
    Invariant(DeepSetsConfig),
    /// DeepSets built from permutation-equivariant layers
    Equivariant(DeepSetsConfig),
    /// Interaction network over all constituent pairs
    Intnet(IntNetConfig),
    /// Fully connected student on the flattened jet
    Jedidnn(JediDnnConfig),
}

impl Architecture {
    /// Type name; quantized networks carry a `q` prefix
    pub fn type_name(&self) -> String {
        match self {
            Self::Invariant(c) if c.nbits.is_some() => "qinvariant".to_string(),
            Self::Invariant(_) => "invariant".to_string(),
            Self::Equivariant(c) if c.nbits.is_some() => "qequivariant".to_string(),
            Self::Equivariant(_) => "equivariant".to_string(),
            Self::Intnet(c) if c.nbits.is_some() => "qintnet".to_string(),
            Self::Intnet(_) => "intnet".to_string(),
            Self::Jedidnn(c) if c.nbits.is_some() => "qjedidnn".to_string(),
            Self::Jedidnn(_) => "jedidnn".to_string(),
        }
    }

    pub fn nclasses(&self) -> usize {
        match self {
            Self::Invariant(c) | Self::Equivariant(c) => c.nclasses,
            Self::Intnet(c) => c.nclasses,
            Self::Jedidnn(c) => c.nclasses,
        }
    }

    pub fn nbits(&self) -> Option<u8> {
        match self {
            Self::Invariant(c) | Self::Equivariant(c) => c.nbits,
            Self::Intnet(c) => c.nbits,
            Self::Jedidnn(c) => c.nbits,
        }
    }

    /// Floating point DeepSets, the only variants the FLOPs report covers
    pub fn is_floating_point_deepsets(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Equivariant(_)) && self.nbits().is_none()
    }
}

/// Build the network described by `architecture`
pub fn build(
    architecture: &Architecture,
    input_shape: [usize; 2],
    vb: VarBuilder,
) -> Result<(Box<dyn JetNetwork>, ModelInfo)> {
    match architecture {
        Architecture::Invariant(config) => {
            let net = DeepSetsInvariant::new(input_shape, config, vb)?;
            let info = net.info(input_shape);
            Ok((Box::new(net), info))
        }
        Architecture::Equivariant(config) => {
            let net = DeepSetsEquivariant::new(input_shape, config, vb)?;
            let info = net.info(input_shape);
            Ok((Box::new(net), info))
        }
        Architecture::Intnet(config) => {
            let net = QConvIntNet::new(input_shape, config, vb)?;
            let info = net.info(input_shape);
            Ok((Box::new(net), info))
        }
        Architecture::Jedidnn(config) => {
            let net = JediDnn::new(input_shape, config, vb)?;
            let info = net.info(input_shape);
            Ok((Box::new(net), info))
        }
    }
}

/// Pick a student architecture by name, filling unspecified hyperparameters
/// with their defaults.
pub fn choose_student(student_type: &str, params: serde_json::Value) -> Result<Architecture> {
    let mut object = match params {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(QjetError::Configuration(format!(
                "student hyperparameters must be a table, got {}",
                other
            )))
        }
    };

    match student_type {
        "invariant" | "equivariant" | "intnet" | "jedidnn" => {}
        other => {
            return Err(QjetError::UnknownArchitecture {
                name: other.to_string(),
            })
        }
    }

    object.insert(
        "type".to_string(),
        serde_json::Value::String(student_type.to_string()),
    );
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| QjetError::Configuration(format!("student '{}': {}", student_type, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_choose_student_defaults() {
        let arch = choose_student("jedidnn", json!({})).unwrap();
        match arch {
            Architecture::Jedidnn(c) => {
                assert_eq!(c.node_size, 64);
                assert_eq!(c.nclasses, 5);
            }
            other => panic!("unexpected architecture {:?}", other),
        }
    }

    #[test]
    fn test_choose_student_overrides() {
        let arch = choose_student("invariant", json!({"nnodes_phi": 8, "nbits": 4})).unwrap();
        assert_eq!(arch.type_name(), "qinvariant");
        assert_eq!(arch.nbits(), Some(4));
    }

    #[test]
    fn test_quantized_student_type_name() {
        let float = choose_student("jedidnn", json!({})).unwrap();
        assert_eq!(float.type_name(), "jedidnn");
        let quantized = choose_student("jedidnn", json!({"nbits": 6})).unwrap();
        assert_eq!(quantized.type_name(), "qjedidnn");
    }

    #[test]
    fn test_choose_unknown_student() {
        assert!(matches!(
            choose_student("transformer", json!({})),
            Err(QjetError::UnknownArchitecture { .. })
        ));
        assert!(choose_student("jedidnn", json!([1, 2])).is_err());
    }

    #[test]
    fn test_architecture_toml_tagging() {
        let arch: Architecture = toml::from_str(
            r#"
            type = "equivariant"
            nnodes_phi = 16
            activ = "relu"
            "#,
        )
        .unwrap();
        assert_eq!(arch.type_name(), "equivariant");
        assert!(arch.is_floating_point_deepsets());
    }
}
