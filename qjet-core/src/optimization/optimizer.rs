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

//! Gradient-descent optimizers selectable by name

use crate::{QjetError, Result};
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

/// Keras' default epsilon for Adam
const ADAM_EPSILON: f64 = 1e-7;
const ADAMW_WEIGHT_DECAY: f64 = 1e-2;

/// Optimizer driving one set of trainable variables
pub enum TrainOptimizer {
    AdamW { inner: AdamW, name: &'static str },
    Sgd(SGD),
}

impl std::fmt::Debug for TrainOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainOptimizer")
            .field("name", &self.name())
            .field("lr", &self.learning_rate())
            .finish()
    }
}

impl TrainOptimizer {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AdamW { name, .. } => *name,
            Self::Sgd(_) => "sgd",
        }
    }

    /// Back-propagate `loss` and update the variables
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::AdamW { inner, .. } => inner.backward_step(loss)?,
            Self::Sgd(inner) => inner.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW { inner, .. } => inner.learning_rate(),
            Self::Sgd(inner) => inner.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW { inner, .. } => inner.set_learning_rate(lr),
            Self::Sgd(inner) => inner.set_learning_rate(lr),
        }
    }
}

/// Build the optimizer called `name` over `vars`.
///
/// `adam` is AdamW without weight decay, matching plain Adam.
pub fn choose_optimizer(name: &str, vars: Vec<Var>, lr: f64) -> Result<TrainOptimizer> {
    if lr <= 0.0 {
        return Err(QjetError::Configuration(format!(
            "learning rate must be positive, got {}",
            lr
        )));
    }

    match name.to_lowercase().as_str() {
        "adam" => {
            let params = ParamsAdamW {
                lr,
                eps: ADAM_EPSILON,
                weight_decay: 0.0,
                ..Default::default()
            };
            Ok(TrainOptimizer::AdamW {
                inner: AdamW::new(vars, params)?,
                name: "adam",
            })
        }
        "adamw" => {
            let params = ParamsAdamW {
                lr,
                eps: ADAM_EPSILON,
                weight_decay: ADAMW_WEIGHT_DECAY,
                ..Default::default()
            };
            Ok(TrainOptimizer::AdamW {
                inner: AdamW::new(vars, params)?,
                name: "adamw",
            })
        }
        "sgd" => Ok(TrainOptimizer::Sgd(SGD::new(vars, lr)?)),
        other => Err(QjetError::Configuration(format!(
            "unknown optimizer '{}', expected adam, adamw or sgd",
            other
        ))),
    }
}
