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

//! Model representation, layer graph metadata and persistence
//!
//! A [`Model`] owns its parameters (a `candle_nn::VarMap`), the network built
//! from its [`Hyperparameters`] and a [`ModelInfo`] describing the layer
//! graph. On disk a model is a directory:
//!
//! - `hyperparameters.json`: everything needed to rebuild the network
//! - `model.safetensors`: parameter values
//! - `architecture.json`: the layer graph, for inspection and FLOPs reports

use crate::config::{DataConfig, TrainingConfig};
use crate::data::JetData;
use crate::networks::{self, Architecture, JetNetwork};
use crate::runtime::{Precision, Runtime};
use crate::{QjetError, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const HYPERPARAMETERS_FILE: &str = "hyperparameters.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const ARCHITECTURE_FILE: &str = "architecture.json";
pub const HISTORY_FILE: &str = "history.json";

/// Model metadata and information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Architecture type, e.g. `invariant` or `qequivariant`
    pub architecture: String,
    /// Per-jet input shape `[nconst, nfeats]`
    pub input_shape: Vec<usize>,
    /// Per-jet output shape `[nclasses]`
    pub output_shape: Vec<usize>,
    pub parameter_count: usize,
    pub model_size_bytes: usize,
    /// Multiply-accumulate operations for a single jet
    pub operations_count: usize,
    pub layers: Vec<LayerInfo>,
}

impl ModelInfo {
    /// Assemble the graph summary and derive the totals
    pub fn from_layers(
        name: &str,
        architecture: &str,
        input_shape: &[usize],
        bits_per_parameter: usize,
        layers: Vec<LayerInfo>,
    ) -> Self {
        let parameter_count: usize = layers.iter().map(|l| l.parameter_count).sum();
        let operations_count: u64 = layers.iter().map(|l| l.macs).sum();
        let output_shape = layers
            .last()
            .map(|l| l.output_shape.clone())
            .unwrap_or_else(|| input_shape.to_vec());

        Self {
            name: name.to_string(),
            architecture: architecture.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape,
            parameter_count,
            model_size_bytes: (parameter_count * bits_per_parameter).div_ceil(8),
            operations_count: operations_count as usize,
            layers,
        }
    }

    /// Keras-style text summary of the layer graph
    pub fn summary(&self) -> String {
        let mut out = format!("Model: \"{}\" ({})\n", self.name, self.architecture);
        out.push_str(&format!("{:=<78}\n", ""));
        out.push_str(&format!(
            "{:<28}{:<24}{:<16}{:>10}\n",
            "Layer", "Type", "Output", "Params"
        ));
        out.push_str(&format!("{:-<78}\n", ""));
        for layer in &self.layers {
            out.push_str(&format!(
                "{:<28}{:<24}{:<16}{:>10}\n",
                layer.name,
                layer.layer_type,
                format!("{:?}", layer.output_shape),
                layer.parameter_count
            ));
        }
        out.push_str(&format!("{:=<78}\n", ""));
        out.push_str(&format!("Total params: {}\n", self.parameter_count));
        out.push_str(&format!("Size: {} bytes", self.model_size_bytes));
        out
    }
}

/// Information about a single layer in the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub layer_type: String,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub parameter_count: usize,
    pub macs: u64,
    pub flops: u64,
}

impl LayerInfo {
    /// Dense projection over the last axis, shared across the leading axes
    pub fn dense(
        name: &str,
        layer_type: &str,
        input_shape: &[usize],
        units: usize,
        use_bias: bool,
    ) -> Self {
        let (in_dim, positions) = split_last(input_shape);
        let mut output_shape = input_shape.to_vec();
        if let Some(last) = output_shape.last_mut() {
            *last = units;
        }
        let macs = (positions * in_dim * units) as u64;
        let bias_params = if use_bias { units } else { 0 };

        Self {
            name: name.to_string(),
            layer_type: layer_type.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape,
            parameter_count: in_dim * units + bias_params,
            macs,
            flops: 2 * macs,
        }
    }

    /// Element-wise layer (activation, subtraction, dropout)
    pub fn elementwise(name: &str, layer_type: &str, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            layer_type: layer_type.to_string(),
            input_shape: shape.to_vec(),
            output_shape: shape.to_vec(),
            parameter_count: 0,
            macs: 0,
            flops: shape.iter().product::<usize>() as u64,
        }
    }

    /// Mean over `axis`, dropping it or keeping it with size one
    pub fn pooling(name: &str, input_shape: &[usize], axis: usize, keep_dims: bool) -> Self {
        let mut output_shape = input_shape.to_vec();
        if keep_dims {
            output_shape[axis] = 1;
        } else {
            output_shape.remove(axis);
        }
        Self {
            name: name.to_string(),
            layer_type: "GlobalAveragePooling1D".to_string(),
            input_shape: input_shape.to_vec(),
            output_shape,
            parameter_count: 0,
            macs: 0,
            flops: input_shape.iter().product::<usize>() as u64,
        }
    }

    /// Layers that only move data around
    pub fn reshape(name: &str, layer_type: &str, input_shape: &[usize], output_shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            layer_type: layer_type.to_string(),
            input_shape: input_shape.to_vec(),
            output_shape: output_shape.to_vec(),
            parameter_count: 0,
            macs: 0,
            flops: 0,
        }
    }
}

fn split_last(shape: &[usize]) -> (usize, usize) {
    match shape.split_last() {
        Some((last, rest)) => (*last, rest.iter().product()),
        None => (0, 0),
    }
}

/// Everything needed to rebuild a model, persisted next to its weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub model_hyperparams: Architecture,
    /// Per-jet input shape `[nconst, nfeats]`
    pub input_shape: [usize; 2],
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub data_hyperparams: DataConfig,
    #[serde(default)]
    pub training_hyperparams: Option<TrainingConfig>,
}

impl Hyperparameters {
    pub fn new(model_hyperparams: Architecture, input_shape: [usize; 2]) -> Self {
        Self {
            model_hyperparams,
            input_shape,
            precision: Precision::F32,
            data_hyperparams: DataConfig::default(),
            training_hyperparams: None,
        }
    }

    /// Architecture type as reported in logs and FLOPs gating
    pub fn deepsets_type(&self) -> String {
        self.model_hyperparams.type_name()
    }

    pub fn load<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let path = model_dir.as_ref().join(HYPERPARAMETERS_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            QjetError::ModelLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, model_dir: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(model_dir.as_ref().join(HYPERPARAMETERS_FILE), content)?;
        Ok(())
    }
}

/// High-level model: parameters, network and layer graph
pub struct Model {
    pub info: ModelInfo,
    pub hyperparameters: Hyperparameters,
    varmap: VarMap,
    network: Box<dyn JetNetwork>,
    dtype: DType,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("info", &self.info)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Model {
    /// Build a freshly initialised model from its hyperparameters, seeding
    /// the weights with `runtime.seed`
    pub fn build(hyperparameters: Hyperparameters, runtime: &Runtime) -> Result<Self> {
        Self::build_seeded(hyperparameters, runtime, runtime.seed)
    }

    /// Build with an explicit initialisation seed
    pub fn build_seeded(hyperparameters: Hyperparameters, runtime: &Runtime, seed: u64) -> Result<Self> {
        let dtype = hyperparameters.precision.dtype();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, &runtime.device);
        let (network, info) = networks::build(
            &hyperparameters.model_hyperparams,
            hyperparameters.input_shape,
            vb,
        )?;
        seed_parameters(&varmap, seed)?;

        log::debug!(
            "Built {} with {} parameters",
            info.architecture,
            info.parameter_count
        );

        Ok(Self {
            info,
            hyperparameters,
            varmap,
            network,
            dtype,
        })
    }

    /// Get model information
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn nclasses(&self) -> usize {
        self.hyperparameters.model_hyperparams.nclasses()
    }

    /// Reject data whose per-jet shape or class count the network cannot take
    pub fn check_data(&self, data: &JetData) -> Result<()> {
        let expected = self.hyperparameters.input_shape;
        let actual = data.input_shape();
        if expected != actual {
            return Err(QjetError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }
        if self.nclasses() != data.nclasses() {
            return Err(QjetError::ShapeMismatch {
                expected: vec![self.nclasses()],
                actual: vec![data.nclasses()],
            });
        }
        Ok(())
    }

    /// Forward pass producing raw logits `(batch, nclasses)`
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, nconst, nfeats) = xs.dims3()?;
        let [expected_const, expected_feats] = self.hyperparameters.input_shape;
        if nconst != expected_const || nfeats != expected_feats {
            return Err(QjetError::ShapeMismatch {
                expected: vec![expected_const, expected_feats],
                actual: vec![nconst, nfeats],
            });
        }

        if xs.dtype() == self.dtype {
            self.network.forward_t(xs, train)
        } else {
            self.network.forward_t(&xs.to_dtype(self.dtype)?, train)
        }
    }

    /// Batched inference returning detached logits
    pub fn predict(&self, xs: &Tensor, batch_size: usize) -> Result<Tensor> {
        let n = xs.dim(0)?;
        let batch_size = batch_size.max(1);
        let mut outputs = Vec::with_capacity(n.div_ceil(batch_size));
        let mut start = 0;
        while start < n {
            let len = batch_size.min(n - start);
            let batch = xs.narrow(0, start, len)?;
            outputs.push(self.forward_t(&batch, false)?.detach());
            start += len;
        }
        if outputs.is_empty() {
            return Err(QjetError::Data("cannot predict on an empty dataset".to_string()));
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// Variables handed to the optimizer
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Persist hyperparameters, weights and layer graph into `model_dir`
    pub fn save<P: AsRef<Path>>(&self, model_dir: P) -> Result<()> {
        let model_dir = model_dir.as_ref();
        std::fs::create_dir_all(model_dir)?;

        self.hyperparameters.save(model_dir)?;
        self.varmap.save(model_dir.join(WEIGHTS_FILE))?;
        std::fs::write(
            model_dir.join(ARCHITECTURE_FILE),
            serde_json::to_string_pretty(&self.info)?,
        )?;

        log::info!("Saved model to {}", model_dir.display());
        Ok(())
    }

    /// Rebuild the network from `hyperparameters.json` and load its weights
    pub fn load<P: AsRef<Path>>(model_dir: P, runtime: &Runtime) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let hyperparameters = Hyperparameters::load(model_dir)?;
        let mut model = Self::build(hyperparameters, runtime)?;

        let weights = model_dir.join(WEIGHTS_FILE);
        if !weights.exists() {
            return Err(QjetError::ModelLoad(format!(
                "no weights found at {}",
                weights.display()
            )));
        }
        model.varmap.load(&weights)?;

        log::info!(
            "Loaded {} model from {}",
            model.info.architecture,
            model_dir.display()
        );
        Ok(model)
    }

    /// Weights-only export for the synthesis toolchain
    pub fn save_weights_npz<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| QjetError::Internal("parameter store lock poisoned".to_string()))?;
        let mut named: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Tensor::write_npz(&named, path.as_ref())?;
        Ok(())
    }

    pub fn summary(&self) -> String {
        self.info.summary()
    }
}

/// Redraw every parameter uniformly in `±1/sqrt(fan_in)` of its dense layer.
///
/// Variables are visited in name order so the draw only depends on `seed`.
fn seed_parameters(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| QjetError::Internal("parameter store lock poisoned".to_string()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let fan_in = match name.strip_suffix("bias") {
            Some(prefix) => data
                .get(&format!("{}weight", prefix))
                .and_then(|w| w.dims().last().copied()),
            None => var.dims().last().copied(),
        }
        .unwrap_or(1)
        .max(1);
        let bound = 1.0 / (fan_in as f64).sqrt();
        let values: Vec<f64> = (0..var.elem_count())
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let init = Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(var.dtype())?;
        var.set(&init)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::DeepSetsConfig;

    fn weights(model: &Model) -> Vec<(String, Vec<f64>)> {
        let data = model.varmap.data().lock().unwrap();
        let mut named: Vec<(String, Vec<f64>)> = data
            .iter()
            .map(|(name, var)| {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_dtype(DType::F64)
                    .unwrap()
                    .to_vec1::<f64>()
                    .unwrap();
                (name.clone(), values)
            })
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    #[test]
    fn test_seeded_initialisation() {
        let hp = Hyperparameters::new(
            Architecture::Invariant(DeepSetsConfig {
                nnodes_phi: 8,
                nnodes_rho: 4,
                ..Default::default()
            }),
            [6, 3],
        );
        let runtime = Runtime::cpu();
        let a = Model::build(hp.clone(), &runtime).unwrap();
        let b = Model::build(hp.clone(), &runtime).unwrap();
        let c = Model::build_seeded(hp, &runtime, runtime.seed + 1).unwrap();

        assert_eq!(weights(&a), weights(&b));
        assert_ne!(weights(&a), weights(&c));
        for (name, values) in weights(&a) {
            assert!(values.iter().all(|v| v.abs() <= 1.0), "{} out of range", name);
        }
    }

    #[test]
    fn test_dense_layer_info() {
        let layer = LayerInfo::dense("phi_0", "QDense", &[16, 3], 32, true);
        assert_eq!(layer.output_shape, vec![16, 32]);
        assert_eq!(layer.parameter_count, 3 * 32 + 32);
        assert_eq!(layer.macs, 16 * 3 * 32);
        assert_eq!(layer.flops, 2 * 16 * 3 * 32);
    }

    #[test]
    fn test_pooling_layer_info() {
        let pooled = LayerInfo::pooling("pool", &[16, 32], 0, false);
        assert_eq!(pooled.output_shape, vec![32]);
        assert_eq!(pooled.flops, 16 * 32);

        let kept = LayerInfo::pooling("pool", &[16, 32], 0, true);
        assert_eq!(kept.output_shape, vec![1, 32]);
    }

    #[test]
    fn test_model_info_totals() {
        let layers = vec![
            LayerInfo::dense("a", "Dense", &[4, 2], 8, true),
            LayerInfo::pooling("pool", &[4, 8], 0, false),
            LayerInfo::dense("head", "Dense", &[8], 5, true),
        ];
        let info = ModelInfo::from_layers("test", "invariant", &[4, 2], 32, layers);
        assert_eq!(info.parameter_count, 24 + 45);
        assert_eq!(info.model_size_bytes, 69 * 4);
        assert_eq!(info.operations_count, 4 * 2 * 8 + 8 * 5);
        assert_eq!(info.output_shape, vec![5]);
        assert!(info.summary().contains("Total params: 69"));
    }

    #[test]
    fn test_quantized_model_size() {
        let layers = vec![LayerInfo::dense("a", "QDense", &[10], 10, false)];
        let info = ModelInfo::from_layers("q", "qinvariant", &[1, 10], 3, layers);
        assert_eq!(info.model_size_bytes, (100 * 3usize).div_ceil(8));
    }
}
