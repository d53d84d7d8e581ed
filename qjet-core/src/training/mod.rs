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

//! Epoch-based training loop
//!
//! [`fit`] drives anything implementing [`TrainStep`]: it holds out a trailing
//! validation fraction, iterates shuffled mini-batches, averages the per-batch
//! metrics weighted by batch size, evaluates on the held-out jets and hands
//! the epoch logs to the callbacks.

pub mod callbacks;
pub mod metrics;
pub mod trainer;

pub use callbacks::{
    Callback, CallbackAction, CallbackContext, CallbackList, EarlyStopping, ReduceLrOnPlateau,
};
pub use trainer::Trainer;

use crate::config::TrainingConfig;
use crate::data::{batch_indices, validation_split};
use crate::{QjetError, Result};
use candle_core::Tensor;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Metric name to value for one epoch or one batch
pub type EpochLogs = BTreeMap<String, f64>;

/// Whether larger or smaller values of a metric are better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    /// Accuracy-like metrics are maximised, everything else minimised
    pub fn auto(metric: &str) -> Self {
        if metric.contains("acc") || metric.contains("auc") {
            Self::Max
        } else {
            Self::Min
        }
    }

    pub fn is_better(&self, value: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Self::Max => value > best + min_delta,
            Self::Min => value < best - min_delta,
        }
    }
}

/// One step of optimisation and evaluation on a batch
pub trait TrainStep {
    /// Update the trainable variables on one batch and report its metrics
    fn train_step(&mut self, x: &Tensor, y: &Tensor) -> Result<EpochLogs>;

    /// Metrics on one batch without updating anything
    fn test_step(&self, x: &Tensor, y: &Tensor) -> Result<EpochLogs>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// Per-epoch metrics of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochLogs>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stopped_early: bool,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self {
            epochs: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            stopped_early: false,
        }
    }

    pub fn push(&mut self, logs: EpochLogs) {
        self.epochs.push(logs);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Values of `metric` over the epochs that recorded it
    pub fn metric(&self, metric: &str) -> Vec<f64> {
        self.epochs
            .iter()
            .filter_map(|logs| logs.get(metric).copied())
            .collect()
    }

    pub fn last(&self, metric: &str) -> Option<f64> {
        self.epochs.last().and_then(|logs| logs.get(metric).copied())
    }

    /// Best finite value of `metric` in the given direction
    pub fn best(&self, metric: &str, mode: MonitorMode) -> Option<f64> {
        self.metric(metric)
            .into_iter()
            .filter(|v| v.is_finite())
            .reduce(|a, b| match mode {
                MonitorMode::Max => a.max(b),
                MonitorMode::Min => a.min(b),
            })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Loop settings for [`fit`]
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub shuffle: bool,
    pub seed: u64,
}

impl FitOptions {
    pub fn from_config(config: &TrainingConfig, seed: u64) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch,
            validation_split: config.validation_split,
            shuffle: config.shuffle,
            seed,
        }
    }
}

/// Sample-weighted running mean of batch metrics
#[derive(Debug, Default)]
struct MetricAccumulator {
    sums: BTreeMap<String, (f64, usize)>,
}

impl MetricAccumulator {
    fn add(&mut self, logs: &EpochLogs, samples: usize) {
        for (name, value) in logs {
            let entry = self.sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value * samples as f64;
            entry.1 += samples;
        }
    }

    fn mean(&self) -> EpochLogs {
        self.sums
            .iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(name, (sum, n))| (name.clone(), sum / *n as f64))
            .collect()
    }
}

/// Metrics of `step` over `(x, y)` evaluated in sequential batches
pub fn evaluate<S: TrainStep + ?Sized>(
    step: &S,
    x: &Tensor,
    y: &Tensor,
    batch_size: usize,
) -> Result<EpochLogs> {
    let n = x.dim(0)?;
    let batch_size = batch_size.max(1);
    let mut acc = MetricAccumulator::default();
    let mut start = 0;
    while start < n {
        let len = batch_size.min(n - start);
        let logs = step.test_step(&x.narrow(0, start, len)?, &y.narrow(0, start, len)?)?;
        acc.add(&logs, len);
        start += len;
    }
    Ok(acc.mean())
}

/// Train `step` on `(x, y)` for up to `options.epochs` epochs
pub fn fit<S: TrainStep>(
    step: &mut S,
    x: &Tensor,
    y: &Tensor,
    options: &FitOptions,
    callbacks: &mut CallbackList,
) -> Result<History> {
    let ((x_fit, y_fit), validation) = validation_split(x, y, options.validation_split)?;
    let n = x_fit.dim(0)?;
    if n == 0 {
        return Err(QjetError::TrainingFailed {
            reason: "no training samples".to_string(),
        });
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut history = History::new();
    callbacks.on_train_begin(&CallbackContext {
        max_epochs: options.epochs,
        lr: step.learning_rate(),
        ..Default::default()
    });

    for epoch in 0..options.epochs {
        let shuffle = if options.shuffle { Some(&mut rng) } else { None };
        let mut acc = MetricAccumulator::default();
        for idx in batch_indices(n, options.batch_size, shuffle) {
            let index = Tensor::new(idx.as_slice(), x_fit.device())?;
            let xb = x_fit.index_select(&index, 0)?;
            let yb = y_fit.index_select(&index, 0)?;
            let logs = step.train_step(&xb, &yb)?;
            acc.add(&logs, idx.len());
        }

        let mut logs = acc.mean();
        if let Some(loss) = logs.get("loss") {
            if !loss.is_finite() {
                return Err(QjetError::TrainingFailed {
                    reason: format!("loss became {} at epoch {}", loss, epoch + 1),
                });
            }
        }
        if let Some((x_val, y_val)) = &validation {
            for (name, value) in evaluate(step, x_val, y_val, options.batch_size)? {
                logs.insert(format!("val_{}", name), value);
            }
        }
        logs.insert("lr".to_string(), step.learning_rate());

        log::info!(
            "Epoch {}/{}: {}",
            epoch + 1,
            options.epochs,
            logs.iter()
                .map(|(k, v)| format!("{}={:.4}", k, v))
                .collect::<Vec<_>>()
                .join(" ")
        );

        let ctx = CallbackContext {
            epoch,
            max_epochs: options.epochs,
            lr: step.learning_rate(),
            logs: logs.clone(),
        };
        history.push(logs);

        let (stop, new_lr) = callbacks.on_epoch_end(&ctx);
        if let Some(lr) = new_lr {
            step.set_learning_rate(lr);
        }
        if stop {
            history.stopped_early = true;
            break;
        }
    }

    history.finish();
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Counts samples and reports a loss that shrinks with each update
    struct CountingStep {
        seen: usize,
        updates: usize,
        lr: f64,
    }

    impl TrainStep for CountingStep {
        fn train_step(&mut self, x: &Tensor, _y: &Tensor) -> Result<EpochLogs> {
            self.seen += x.dim(0)?;
            self.updates += 1;
            let mut logs = EpochLogs::new();
            logs.insert("loss".to_string(), 1.0 / self.updates as f64);
            Ok(logs)
        }

        fn test_step(&self, _x: &Tensor, _y: &Tensor) -> Result<EpochLogs> {
            let mut logs = EpochLogs::new();
            logs.insert("acc".to_string(), 0.5);
            Ok(logs)
        }

        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }
    }

    fn options(epochs: usize) -> FitOptions {
        FitOptions {
            epochs,
            batch_size: 3,
            validation_split: 0.2,
            shuffle: true,
            seed: 5,
        }
    }

    #[test]
    fn test_fit_runs_all_epochs() {
        let x = Tensor::zeros((10, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros((10, 2), DType::F32, &Device::Cpu).unwrap();
        let mut step = CountingStep { seen: 0, updates: 0, lr: 0.1 };
        let history = fit(&mut step, &x, &y, &options(4), &mut CallbackList::new()).unwrap();

        assert_eq!(history.len(), 4);
        assert_eq!(step.seen, 4 * 8);
        assert_eq!(history.last("val_acc"), Some(0.5));
        assert!(history.finished_at.is_some());
        assert!(!history.stopped_early);
    }

    #[test]
    fn test_fit_stops_early_on_plateau() {
        let x = Tensor::zeros((10, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros((10, 2), DType::F32, &Device::Cpu).unwrap();
        let mut step = CountingStep { seen: 0, updates: 0, lr: 0.1 };
        let mut callbacks = CallbackList::new();
        callbacks.push(EarlyStopping::new("val_acc", 2, 0.0));
        callbacks.push(ReduceLrOnPlateau::new("val_acc", 0.5, 1, 0.0));

        let history = fit(&mut step, &x, &y, &options(50), &mut callbacks).unwrap();
        // constant val_acc: best at epoch 1, stop after two stale epochs
        assert_eq!(history.len(), 3);
        assert!(history.stopped_early);
        assert!(step.lr < 0.1);
    }

    #[test]
    fn test_history_best() {
        let mut history = History::new();
        for v in [0.3, 0.7, 0.5] {
            let mut logs = EpochLogs::new();
            logs.insert("val_acc".to_string(), v);
            history.push(logs);
        }
        assert_eq!(history.best("val_acc", MonitorMode::Max), Some(0.7));
        assert_eq!(history.best("val_acc", MonitorMode::Min), Some(0.3));
        assert_eq!(history.best("loss", MonitorMode::Min), None);
        assert_eq!(MonitorMode::auto("val_loss"), MonitorMode::Min);
    }
}
