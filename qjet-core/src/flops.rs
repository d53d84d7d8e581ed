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

//! FLOPs and MACs of a layer graph, per jet

use crate::model::ModelInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Operation counts of a model for a single jet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlopsReport {
    pub model: String,
    /// FLOPs summed per layer type
    pub per_layer_type: BTreeMap<String, u64>,
    pub total_macs: u64,
    pub total_flops: u64,
}

/// Count the operations of every layer in `info`
pub fn count(info: &ModelInfo) -> FlopsReport {
    let mut per_layer_type = BTreeMap::new();
    let mut total_macs = 0;
    let mut total_flops = 0;
    for layer in &info.layers {
        *per_layer_type.entry(layer.layer_type.clone()).or_insert(0) += layer.flops;
        total_macs += layer.macs;
        total_flops += layer.flops;
    }

    FlopsReport {
        model: info.architecture.clone(),
        per_layer_type,
        total_macs,
        total_flops,
    }
}

impl fmt::Display for FlopsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FLOPs report for {}", self.model)?;
        for (layer_type, flops) in &self.per_layer_type {
            writeln!(f, "  {:<24}{:>12}", layer_type, flops)?;
        }
        writeln!(f, "  {:<24}{:>12}", "Total MACs", self.total_macs)?;
        write!(f, "  {:<24}{:>12}", "Total FLOPs", self.total_flops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LayerInfo;

    #[test]
    fn test_known_graph() {
        // 8 constituents, 3 features -> Dense(4) -> Elu -> mean -> Dense(2)
        let layers = vec![
            LayerInfo::dense("phi_0", "Dense", &[8, 3], 4, true),
            LayerInfo::elementwise("phi_0_activation", "Activation", &[8, 4]),
            LayerInfo::pooling("pool", &[8, 4], 0, false),
            LayerInfo::dense("head", "Dense", &[4], 2, true),
        ];
        let info = ModelInfo::from_layers("toy", "invariant", &[8, 3], 32, layers);
        let report = count(&info);

        assert_eq!(report.total_macs, 8 * 3 * 4 + 4 * 2);
        assert_eq!(report.per_layer_type["Dense"], 2 * (8 * 3 * 4 + 4 * 2));
        assert_eq!(report.per_layer_type["Activation"], 32);
        assert_eq!(report.per_layer_type["GlobalAveragePooling1D"], 32);
        assert_eq!(report.total_flops, 2 * 104 + 32 + 32);
        assert!(report.to_string().contains("Total FLOPs"));
    }
}
