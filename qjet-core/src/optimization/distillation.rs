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

//! Knowledge distillation for model compression
//!
//! A small "student" network learns from both the hard labels and the
//! temperature-softened output distribution of a frozen "teacher":
//!
//! `loss = alpha * CE(y, s) + (1 - alpha) * T^2 * KL(softmax(t / T) || softmax(s / T))`
//!
//! The teacher is borrowed immutably and its outputs are detached, so only the
//! student's variables ever reach the optimizer.

use crate::config::{DistillRunConfig, TrainingConfig};
use crate::model::Model;
use crate::optimization::optimizer::{choose_optimizer, TrainOptimizer};
use crate::training::metrics::{categorical_accuracy, cross_entropy_with_logits, kl_divergence, scalar};
use crate::training::{fit, CallbackList, EpochLogs, FitOptions, History, TrainStep};
use crate::{QjetError, Result};
use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Configuration for knowledge distillation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Temperature for softmax in distillation
    pub temperature: f64,
    /// Weight of the hard-label loss; `1 - alpha` weighs the teacher term
    pub alpha: f64,
    pub optimizer: String,
    pub learning_rate: f64,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            temperature: 10.0,
            alpha: 0.1,
            optimizer: "adam".to_string(),
            learning_rate: 1e-3,
        }
    }
}

impl DistillationConfig {
    pub fn from_run(run: &DistillRunConfig, training: &TrainingConfig) -> Self {
        Self {
            temperature: run.temperature,
            alpha: run.alpha,
            optimizer: training.optimizer.clone(),
            learning_rate: training.lr,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) {
            return Err(QjetError::InvalidConfiguration {
                message: format!("temperature must be positive, got {}", self.temperature),
            });
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(QjetError::InvalidConfiguration {
                message: format!("alpha must be in [0, 1], got {}", self.alpha),
            });
        }
        Ok(())
    }
}

/// The parts of the composite loss for one batch
#[derive(Debug, Clone)]
pub struct LossParts {
    pub total: Tensor,
    /// Hard-label cross-entropy of the student
    pub student: Tensor,
    /// `T^2`-scaled divergence from the teacher
    pub distillation: Tensor,
}

/// Composite hard-label plus soft-target loss
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistillationLoss {
    temperature: f64,
    alpha: f64,
}

impl DistillationLoss {
    pub fn new(temperature: f64, alpha: f64) -> Result<Self> {
        DistillationConfig {
            temperature,
            alpha,
            ..Default::default()
        }
        .validate()?;
        Ok(Self { temperature, alpha })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Batch-mean loss of `student_logits` against one-hot `targets` and the
    /// teacher's `teacher_logits`
    pub fn compute(
        &self,
        student_logits: &Tensor,
        teacher_logits: &Tensor,
        targets: &Tensor,
    ) -> Result<LossParts> {
        let t = self.temperature;
        let teacher_logits = teacher_logits.detach().to_dtype(student_logits.dtype())?;

        let student = cross_entropy_with_logits(student_logits, targets)?;
        let soft_teacher = softmax(&teacher_logits.affine(1.0 / t, 0.0)?, D::Minus1)?;
        let soft_student = softmax(&student_logits.affine(1.0 / t, 0.0)?, D::Minus1)?;
        let distillation = kl_divergence(&soft_teacher, &soft_student)?.affine(t * t, 0.0)?;

        let total = student
            .affine(self.alpha, 0.0)?
            .add(&distillation.affine(1.0 - self.alpha, 0.0)?)?;
        Ok(LossParts {
            total,
            student,
            distillation,
        })
    }
}

/// Trains a student against a frozen teacher
#[derive(Debug)]
pub struct Distiller<'t> {
    student: Model,
    teacher: &'t Model,
    loss: DistillationLoss,
    optimizer: TrainOptimizer,
}

impl<'t> Distiller<'t> {
    pub fn new(student: Model, teacher: &'t Model, config: &DistillationConfig) -> Result<Self> {
        config.validate()?;
        if student.nclasses() != teacher.nclasses() {
            return Err(QjetError::ShapeMismatch {
                expected: vec![teacher.nclasses()],
                actual: vec![student.nclasses()],
            });
        }
        if student.hyperparameters.input_shape != teacher.hyperparameters.input_shape {
            return Err(QjetError::ShapeMismatch {
                expected: teacher.hyperparameters.input_shape.to_vec(),
                actual: student.hyperparameters.input_shape.to_vec(),
            });
        }

        let optimizer = choose_optimizer(
            &config.optimizer,
            student.trainable_vars(),
            config.learning_rate,
        )?;
        let loss = DistillationLoss::new(config.temperature, config.alpha)?;
        debug!(
            "Distilling {} into {} (T={}, alpha={})",
            teacher.info.architecture, student.info.architecture, loss.temperature, loss.alpha
        );

        Ok(Self {
            student,
            teacher,
            loss,
            optimizer,
        })
    }

    pub fn student(&self) -> &Model {
        &self.student
    }

    pub fn teacher(&self) -> &Model {
        self.teacher
    }

    pub fn loss(&self) -> &DistillationLoss {
        &self.loss
    }

    /// Run the training loop on `(x, y)` with the given callbacks
    pub fn fit(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        training: &TrainingConfig,
        callbacks: &mut CallbackList,
        seed: u64,
    ) -> Result<History> {
        info!(
            "Distilling for up to {} epochs, batch {}, T={}, alpha={}",
            training.epochs, training.batch, self.loss.temperature, self.loss.alpha
        );
        fit(self, x, y, &FitOptions::from_config(training, seed), callbacks)
    }

    /// Give up the teacher borrow and keep the trained student
    pub fn into_student(self) -> Model {
        self.student
    }
}

impl TrainStep for Distiller<'_> {
    fn train_step(&mut self, x: &Tensor, y: &Tensor) -> Result<EpochLogs> {
        let teacher_logits = self.teacher.forward_t(x, false)?.detach();
        let student_logits = self.student.forward_t(x, true)?;
        let parts = self.loss.compute(&student_logits, &teacher_logits, y)?;
        self.optimizer.backward_step(&parts.total)?;

        let mut logs = EpochLogs::new();
        logs.insert("loss".to_string(), scalar(&parts.total)?);
        logs.insert("student_loss".to_string(), scalar(&parts.student)?);
        logs.insert("distillation_loss".to_string(), scalar(&parts.distillation)?);
        logs.insert("acc".to_string(), categorical_accuracy(&student_logits, y)?);
        Ok(logs)
    }

    fn test_step(&self, x: &Tensor, y: &Tensor) -> Result<EpochLogs> {
        let logits = self.student.forward_t(x, false)?.detach();
        let mut logs = EpochLogs::new();
        logs.insert("acc".to_string(), categorical_accuracy(&logits, y)?);
        logs.insert(
            "student_loss".to_string(),
            scalar(&cross_entropy_with_logits(&logits, y)?)?,
        );
        Ok(logs)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch() -> (Tensor, Tensor, Tensor) {
        let student = Tensor::new(&[[1.0f32, 0.2, -0.5], [0.1, 0.3, 2.0]], &Device::Cpu).unwrap();
        let teacher = Tensor::new(&[[2.5f32, 0.0, -1.0], [-0.2, 0.4, 1.5]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1.0f32, 0.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu).unwrap();
        (student, teacher, targets)
    }

    #[test]
    fn test_alpha_one_is_student_loss() {
        let (s, t, y) = batch();
        let loss = DistillationLoss::new(5.0, 1.0).unwrap();
        let parts = loss.compute(&s, &t, &y).unwrap();
        let expected = scalar(&cross_entropy_with_logits(&s, &y).unwrap()).unwrap();
        assert_eq!(scalar(&parts.total).unwrap(), expected);
    }

    #[test]
    fn test_alpha_zero_unit_temperature_is_kl() {
        let (s, t, y) = batch();
        let loss = DistillationLoss::new(1.0, 0.0).unwrap();
        let parts = loss.compute(&s, &t, &y).unwrap();
        let p = softmax(&t, D::Minus1).unwrap();
        let q = softmax(&s, D::Minus1).unwrap();
        let expected = scalar(&kl_divergence(&p, &q).unwrap()).unwrap();
        assert!((scalar(&parts.total).unwrap() - expected).abs() < 1e-6);
        assert!(expected > 0.0);
    }

    #[test]
    fn test_temperature_squared_scaling() {
        let (s, t, y) = batch();
        let parts = DistillationLoss::new(4.0, 0.5).unwrap().compute(&s, &t, &y).unwrap();
        let p = softmax(&(&t / 4.0).unwrap(), D::Minus1).unwrap();
        let q = softmax(&(&s / 4.0).unwrap(), D::Minus1).unwrap();
        let kl = scalar(&kl_divergence(&p, &q).unwrap()).unwrap();
        let distill = scalar(&parts.distillation).unwrap();
        assert!((distill - 16.0 * kl).abs() < 1e-4);

        let student = scalar(&parts.student).unwrap();
        let total = scalar(&parts.total).unwrap();
        assert!((total - 0.5 * (student + distill)).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_hyperparameters() {
        assert!(DistillationLoss::new(0.0, 0.5).is_err());
        assert!(DistillationLoss::new(1.0, -0.1).is_err());
        assert!(DistillationLoss::new(1.0, 1.1).is_err());
        assert!(DistillationLoss::new(f64::NAN, 0.5).is_err());
    }
}
