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

//! Run configuration for qjet
//!
//! One TOML file drives every command. Sections a command does not use may be
//! omitted; each command checks for the sections it needs.

use crate::networks::Architecture;
use crate::optimization::tuning::HyperparameterSpace;
use crate::runtime::RuntimeConfig;
use crate::{QjetError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global configuration for a qjet run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub data: DataConfig,
    /// Network to train with `qjet train`
    #[serde(default)]
    pub model: Option<Architecture>,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub distill: Option<DistillRunConfig>,
    #[serde(default)]
    pub tune: Option<TuneConfig>,
    #[serde(default)]
    pub evaluate: Option<EvaluateConfig>,
    /// Root directory for trained models and search results
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,
}

fn default_outdir() -> PathBuf {
    PathBuf::from("trained_models")
}

/// Dataset selection. Every field is optional so that evaluation can overlay
/// a partial section on the hyperparameters stored with a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding `x_train.npy`, `y_train.npy`, `x_test.npy`, `y_test.npy`
    #[serde(default)]
    pub data_folder: Option<PathBuf>,
    /// Keep only the first `nconst` constituents of each jet
    #[serde(default)]
    pub nconst: Option<usize>,
    /// Indices of the features to keep
    #[serde(default)]
    pub feature_selection: Option<Vec<usize>>,
    #[serde(default)]
    pub train_events: Option<usize>,
    #[serde(default)]
    pub test_events: Option<usize>,
    /// Shuffle jets with this seed after loading
    #[serde(default)]
    pub jet_seed: Option<u64>,
}

impl DataConfig {
    /// Overlay the fields set in `other`
    pub fn merge(&mut self, other: &DataConfig) {
        if other.data_folder.is_some() {
            self.data_folder = other.data_folder.clone();
        }
        if other.nconst.is_some() {
            self.nconst = other.nconst;
        }
        if other.feature_selection.is_some() {
            self.feature_selection = other.feature_selection.clone();
        }
        if other.train_events.is_some() {
            self.train_events = other.train_events;
        }
        if other.test_events.is_some() {
            self.test_events = other.test_events;
        }
        if other.jet_seed.is_some() {
            self.jet_seed = other.jet_seed;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nconst == Some(0) {
            return Err(QjetError::Configuration(
                "nconst must be greater than 0".to_string(),
            ));
        }
        if let Some(features) = &self.feature_selection {
            if features.is_empty() {
                return Err(QjetError::Configuration(
                    "feature_selection must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Early stopping settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default = "default_monitor")]
    pub monitor: String,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
}

/// Learning rate reduction on plateau settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrConfig {
    #[serde(default = "default_monitor")]
    pub monitor: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_lr: f64,
}

fn default_monitor() -> String {
    "val_acc".to_string()
}

fn default_patience() -> usize {
    10
}

fn default_factor() -> f64 {
    0.2
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            monitor: default_monitor(),
            patience: default_patience(),
            min_delta: 0.0,
        }
    }
}

impl Default for ReduceLrConfig {
    fn default() -> Self {
        Self {
            monitor: default_monitor(),
            factor: default_factor(),
            patience: default_patience(),
            min_lr: 0.0,
        }
    }
}

/// Training loop hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_optimizer")]
    pub optimizer: String,
    /// Trailing fraction of the training set held out for validation
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingConfig>,
    #[serde(default)]
    pub reduce_lr: Option<ReduceLrConfig>,
}

fn default_epochs() -> usize {
    100
}

fn default_batch() -> usize {
    256
}

fn default_lr() -> f64 {
    1e-3
}

fn default_optimizer() -> String {
    "adam".to_string()
}

fn default_validation_split() -> f64 {
    0.3
}

fn default_shuffle() -> bool {
    true
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch: default_batch(),
            lr: default_lr(),
            optimizer: default_optimizer(),
            validation_split: default_validation_split(),
            shuffle: default_shuffle(),
            early_stopping: Some(EarlyStoppingConfig::default()),
            reduce_lr: Some(ReduceLrConfig::default()),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(QjetError::Configuration(
                "epochs must be greater than 0".to_string(),
            ));
        }
        if self.batch == 0 {
            return Err(QjetError::Configuration(
                "batch must be greater than 0".to_string(),
            ));
        }
        if self.lr <= 0.0 {
            return Err(QjetError::Configuration(
                "lr must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(QjetError::Configuration(
                "validation_split must be in [0, 1)".to_string(),
            ));
        }
        if let Some(reduce) = &self.reduce_lr {
            if reduce.factor <= 0.0 || reduce.factor >= 1.0 {
                return Err(QjetError::Configuration(
                    "reduce_lr.factor must be between 0 and 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Distillation run: a trained teacher directory and a student to fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillRunConfig {
    /// Directory of a model saved by `qjet train`
    pub teacher: PathBuf,
    #[serde(default = "default_student_type")]
    pub student_type: String,
    /// Student hyperparameters; missing keys take the architecture defaults
    #[serde(default = "empty_table")]
    pub student: serde_json::Value,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_student_type() -> String {
    "jedidnn".to_string()
}

fn empty_table() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_temperature() -> f64 {
    10.0
}

fn default_alpha() -> f64 {
    0.1
}

/// Random search over distillation hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    #[serde(default)]
    pub distill: Option<DistillRunConfig>,
    #[serde(default = "default_max_trials")]
    pub max_trials: usize,
    #[serde(default = "default_executions")]
    pub executions_per_trial: usize,
    #[serde(default = "default_monitor")]
    pub objective: String,
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
    #[serde(default = "default_search_seed")]
    pub seed: u64,
    #[serde(default = "default_max_failed")]
    pub max_consecutive_failed_trials: usize,
    /// Search space; the temperature/alpha/learning-rate space when omitted
    #[serde(default)]
    pub space: Option<HyperparameterSpace>,
    /// Epoch budget per execution, overriding `training.epochs`
    #[serde(default)]
    pub epochs: Option<usize>,
    /// Callbacks used inside every trial in place of the training ones
    #[serde(default = "default_tune_early_stopping")]
    pub early_stopping: EarlyStoppingConfig,
    #[serde(default = "default_tune_reduce_lr")]
    pub reduce_lr: ReduceLrConfig,
}

fn default_tune_early_stopping() -> EarlyStoppingConfig {
    EarlyStoppingConfig {
        patience: 20,
        ..Default::default()
    }
}

fn default_tune_reduce_lr() -> ReduceLrConfig {
    ReduceLrConfig {
        factor: 0.8,
        ..Default::default()
    }
}

fn default_max_trials() -> usize {
    300
}

fn default_executions() -> usize {
    1
}

fn default_project_name() -> String {
    "distiller_search".to_string()
}

fn default_overwrite() -> bool {
    true
}

fn default_search_seed() -> u64 {
    123
}

fn default_max_failed() -> usize {
    3
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            distill: None,
            max_trials: default_max_trials(),
            executions_per_trial: default_executions(),
            objective: default_monitor(),
            project_name: default_project_name(),
            overwrite: default_overwrite(),
            seed: default_search_seed(),
            max_consecutive_failed_trials: default_max_failed(),
            space: None,
            epochs: None,
            early_stopping: default_tune_early_stopping(),
            reduce_lr: default_tune_reduce_lr(),
        }
    }
}

/// Evaluation of a saved model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateConfig {
    pub model_dir: PathBuf,
    /// Shuffle constituents of each test jet with seeds derived from this one
    #[serde(default)]
    pub const_seed: Option<u64>,
    /// Stop after the FLOPs report
    #[serde(default = "default_flops_only")]
    pub flops_only: bool,
    #[serde(default = "default_eval_batch")]
    pub batch_size: usize,
}

fn default_flops_only() -> bool {
    true
}

fn default_eval_batch() -> usize {
    4096
}

impl RunConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.training.validate()?;

        for distill in [
            self.distill.as_ref(),
            self.tune.as_ref().and_then(|t| t.distill.as_ref()),
        ]
        .into_iter()
        .flatten()
        {
            if distill.temperature <= 0.0 {
                return Err(QjetError::Configuration(
                    "temperature must be greater than 0".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&distill.alpha) {
                return Err(QjetError::Configuration(
                    "alpha must be between 0 and 1".to_string(),
                ));
            }
        }

        if let Some(tune) = &self.tune {
            if tune.max_trials == 0 || tune.executions_per_trial == 0 {
                return Err(QjetError::Configuration(
                    "max_trials and executions_per_trial must be greater than 0".to_string(),
                ));
            }
            if let Some(space) = &tune.space {
                space.validate()?;
            }
        }

        if let Some(evaluate) = &self.evaluate {
            if evaluate.batch_size == 0 {
                return Err(QjetError::Configuration(
                    "evaluate.batch_size must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Distillation settings from `[distill]`, or from `[tune.distill]` when tuning
    pub fn distill_settings(&self) -> Result<&DistillRunConfig> {
        self.tune
            .as_ref()
            .and_then(|t| t.distill.as_ref())
            .or(self.distill.as_ref())
            .ok_or_else(|| QjetError::Configuration("missing [distill] section".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const EXAMPLE: &str = r#"
outdir = "out"

[runtime]
precision = "f64"
seed = 7

[data]
data_folder = "jets"
nconst = 16
feature_selection = [0, 1, 2]

[model]
type = "invariant"
nnodes_phi = 32
nbits = 8

[training]
epochs = 5
batch = 128

[training.early_stopping]
patience = 20

[distill]
teacher = "out/intnet"
student_type = "jedidnn"
temperature = 4.0
alpha = 0.3

[distill.student]
node_size = 32

[evaluate]
model_dir = "out/invariant"
const_seed = 42
"#;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.validation_split, 0.3);
    }

    #[test]
    fn test_parse_full_config() {
        let config: RunConfig = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.data.nconst, Some(16));
        assert_eq!(config.model.as_ref().unwrap().type_name(), "qinvariant");
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.early_stopping.as_ref().unwrap().patience, 20);
        assert_eq!(config.training.reduce_lr, None);

        let distill = config.distill_settings().unwrap();
        assert_eq!(distill.student["node_size"], 32);
        assert_eq!(distill.alpha, 0.3);

        let evaluate = config.evaluate.unwrap();
        assert!(evaluate.flops_only);
        assert_eq!(evaluate.const_seed, Some(42));
    }

    #[test]
    fn test_config_file_operations() {
        let config: RunConfig = toml::from_str(EXAMPLE).unwrap();
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = RunConfig::load(temp_file.path()).unwrap();

        assert_eq!(loaded.data, config.data);
        assert_eq!(loaded.model, config.model);
        assert_eq!(loaded.training, config.training);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[training]\nepochs = \"many\"\n").unwrap();
        assert!(matches!(
            RunConfig::load(temp_file.path()),
            Err(QjetError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_alpha() {
        let mut config: RunConfig = toml::from_str(EXAMPLE).unwrap();
        if let Some(distill) = config.distill.as_mut() {
            distill.alpha = 1.5;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_merge() {
        let mut base = DataConfig {
            data_folder: Some(PathBuf::from("a")),
            nconst: Some(32),
            ..Default::default()
        };
        let overlay = DataConfig {
            nconst: Some(8),
            test_events: Some(100),
            ..Default::default()
        };
        base.merge(&overlay);
        assert_eq!(base.data_folder, Some(PathBuf::from("a")));
        assert_eq!(base.nconst, Some(8));
        assert_eq!(base.test_events, Some(100));
    }
}
