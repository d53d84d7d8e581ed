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

//! Supervised training with categorical cross-entropy

use super::metrics::{categorical_accuracy, cross_entropy_with_logits, scalar};
use super::{fit, CallbackList, EpochLogs, FitOptions, History, TrainStep};
use crate::config::TrainingConfig;
use crate::model::Model;
use crate::optimization::optimizer::{choose_optimizer, TrainOptimizer};
use crate::Result;
use candle_core::Tensor;

/// Fits a model on one-hot targets
#[derive(Debug)]
pub struct Trainer<'m> {
    model: &'m Model,
    optimizer: TrainOptimizer,
}

impl<'m> Trainer<'m> {
    pub fn new(model: &'m Model, config: &TrainingConfig) -> Result<Self> {
        let optimizer = choose_optimizer(&config.optimizer, model.trainable_vars(), config.lr)?;
        Ok(Self { model, optimizer })
    }

    /// Run the configured training loop with its callbacks
    pub fn fit(&mut self, x: &Tensor, y: &Tensor, config: &TrainingConfig, seed: u64) -> Result<History> {
        log::info!(
            "Training {} with {} (lr {})",
            self.model.info.architecture,
            self.optimizer.name(),
            config.lr
        );
        let mut callbacks = CallbackList::from_training(config);
        fit(self, x, y, &FitOptions::from_config(config, seed), &mut callbacks)
    }
}

impl TrainStep for Trainer<'_> {
    fn train_step(&mut self, x: &Tensor, y: &Tensor) -> Result<EpochLogs> {
        let logits = self.model.forward_t(x, true)?;
        let loss = cross_entropy_with_logits(&logits, y)?;
        self.optimizer.backward_step(&loss)?;

        let mut logs = EpochLogs::new();
        logs.insert("loss".to_string(), scalar(&loss)?);
        logs.insert("acc".to_string(), categorical_accuracy(&logits, y)?);
        Ok(logs)
    }

    fn test_step(&self, x: &Tensor, y: &Tensor) -> Result<EpochLogs> {
        let logits = self.model.forward_t(x, false)?.detach();
        let loss = cross_entropy_with_logits(&logits, y)?;

        let mut logs = EpochLogs::new();
        logs.insert("loss".to_string(), scalar(&loss)?);
        logs.insert("acc".to_string(), categorical_accuracy(&logits, y)?);
        Ok(logs)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }
}
