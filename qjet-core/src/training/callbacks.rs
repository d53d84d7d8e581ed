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

//! Epoch-level training callbacks

use super::{EpochLogs, MonitorMode};
use crate::config::{EarlyStoppingConfig, ReduceLrConfig};

/// State handed to callbacks at the end of an epoch
#[derive(Debug, Clone, Default)]
pub struct CallbackContext {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    pub max_epochs: usize,
    /// Current learning rate
    pub lr: f64,
    /// Metrics of the finished epoch, validation metrics prefixed `val_`
    pub logs: EpochLogs,
}

/// What the training loop should do next
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallbackAction {
    Continue,
    Stop,
    SetLearningRate(f64),
}

pub trait Callback: Send {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) {}

    fn on_epoch_end(&mut self, ctx: &CallbackContext) -> CallbackAction;

    fn name(&self) -> &'static str;
}

/// Tracks the best value of a monitored metric
#[derive(Debug, Clone)]
struct Monitor {
    metric: String,
    mode: MonitorMode,
    min_delta: f64,
    best: Option<f64>,
    wait: usize,
}

impl Monitor {
    fn new(metric: &str, min_delta: f64) -> Self {
        Self {
            metric: metric.to_string(),
            mode: MonitorMode::auto(metric),
            min_delta: min_delta.abs(),
            best: None,
            wait: 0,
        }
    }

    fn reset(&mut self) {
        self.best = None;
        self.wait = 0;
    }

    /// Record the epoch value; returns `None` when the metric is missing
    fn update(&mut self, logs: &EpochLogs) -> Option<bool> {
        let value = *logs.get(&self.metric)?;
        let improved = match self.best {
            None => true,
            Some(best) => self.mode.is_better(value, best, self.min_delta),
        };
        if improved {
            self.best = Some(value);
            self.wait = 0;
        } else {
            self.wait += 1;
        }
        Some(improved)
    }
}

/// Stop training when the monitored metric stops improving
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: Monitor,
    patience: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(monitor: &str, patience: usize, min_delta: f64) -> Self {
        Self {
            monitor: Monitor::new(monitor, min_delta),
            patience,
            stopped_epoch: None,
        }
    }

    pub fn from_config(config: &EarlyStoppingConfig) -> Self {
        Self::new(&config.monitor, config.patience, config.min_delta)
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn best(&self) -> Option<f64> {
        self.monitor.best
    }
}

impl Callback for EarlyStopping {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) {
        self.monitor.reset();
        self.stopped_epoch = None;
    }

    fn on_epoch_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        let improved = match self.monitor.update(&ctx.logs) {
            Some(improved) => improved,
            None => {
                log::warn!(
                    "Early stopping conditioned on unavailable metric '{}'",
                    self.monitor.metric
                );
                return CallbackAction::Continue;
            }
        };

        if !improved && self.monitor.wait >= self.patience {
            self.stopped_epoch = Some(ctx.epoch);
            log::info!(
                "Epoch {}: early stopping, no improvement in {} for {} epochs",
                ctx.epoch + 1,
                self.monitor.metric,
                self.patience
            );
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }
}

/// Multiply the learning rate by `factor` when the monitored metric plateaus
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    monitor: Monitor,
    factor: f64,
    patience: usize,
    min_lr: f64,
}

impl ReduceLrOnPlateau {
    pub fn new(monitor: &str, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            monitor: Monitor::new(monitor, 1e-4),
            factor,
            patience,
            min_lr,
        }
    }

    pub fn from_config(config: &ReduceLrConfig) -> Self {
        Self::new(&config.monitor, config.factor, config.patience, config.min_lr)
    }
}

impl Callback for ReduceLrOnPlateau {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) {
        self.monitor.reset();
    }

    fn on_epoch_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        let improved = self.monitor.update(&ctx.logs).unwrap_or(true);
        if improved || self.monitor.wait < self.patience || ctx.lr <= self.min_lr {
            return CallbackAction::Continue;
        }

        self.monitor.wait = 0;
        let new_lr = (ctx.lr * self.factor).max(self.min_lr);
        log::info!(
            "Epoch {}: reducing learning rate to {:.3e}",
            ctx.epoch + 1,
            new_lr
        );
        CallbackAction::SetLearningRate(new_lr)
    }

    fn name(&self) -> &'static str {
        "ReduceLrOnPlateau"
    }
}

/// Ordered set of callbacks; `Stop` from any of them wins
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Early stopping and learning rate reduction as configured for training
    pub fn from_training(config: &crate::config::TrainingConfig) -> Self {
        let mut list = Self::new();
        if let Some(es) = &config.early_stopping {
            list.push(EarlyStopping::from_config(es));
        }
        if let Some(rl) = &config.reduce_lr {
            list.push(ReduceLrOnPlateau::from_config(rl));
        }
        list
    }

    pub fn push<C: Callback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(&mut self, ctx: &CallbackContext) {
        for cb in &mut self.callbacks {
            cb.on_train_begin(ctx);
        }
    }

    /// Run every callback; returns whether to stop and the learning rate to use
    pub fn on_epoch_end(&mut self, ctx: &CallbackContext) -> (bool, Option<f64>) {
        let mut stop = false;
        let mut lr = None;
        for cb in &mut self.callbacks {
            match cb.on_epoch_end(ctx) {
                CallbackAction::Continue => {}
                CallbackAction::Stop => stop = true,
                CallbackAction::SetLearningRate(new_lr) => {
                    log::debug!("{} set learning rate {}", cb.name(), new_lr);
                    lr = Some(new_lr);
                }
            }
        }
        (stop, lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(epoch: usize, metric: &str, value: f64, lr: f64) -> CallbackContext {
        let mut logs = EpochLogs::new();
        logs.insert(metric.to_string(), value);
        CallbackContext {
            epoch,
            max_epochs: 100,
            lr,
            logs,
        }
    }

    #[test]
    fn test_early_stopping_on_accuracy() {
        let mut es = EarlyStopping::new("val_acc", 2, 0.0);
        assert_eq!(es.on_epoch_end(&ctx(0, "val_acc", 0.5, 1e-3)), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(&ctx(1, "val_acc", 0.6, 1e-3)), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(&ctx(2, "val_acc", 0.6, 1e-3)), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(&ctx(3, "val_acc", 0.55, 1e-3)), CallbackAction::Stop);
        assert_eq!(es.stopped_epoch(), Some(3));
        assert_eq!(es.best(), Some(0.6));
    }

    #[test]
    fn test_early_stopping_on_loss_improvement_resets() {
        let mut es = EarlyStopping::new("val_loss", 2, 0.01);
        es.on_epoch_end(&ctx(0, "val_loss", 1.0, 1e-3));
        es.on_epoch_end(&ctx(1, "val_loss", 0.995, 1e-3));
        assert_eq!(es.on_epoch_end(&ctx(2, "val_loss", 0.5, 1e-3)), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(&ctx(3, "val_loss", 0.6, 1e-3)), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(&ctx(4, "val_loss", 0.6, 1e-3)), CallbackAction::Stop);
    }

    #[test]
    fn test_missing_metric_never_stops() {
        let mut es = EarlyStopping::new("val_acc", 0, 0.0);
        assert_eq!(es.on_epoch_end(&ctx(0, "loss", 1.0, 1e-3)), CallbackAction::Continue);
    }

    #[test]
    fn test_reduce_lr_on_plateau() {
        let mut rl = ReduceLrOnPlateau::new("val_acc", 0.2, 1, 1e-5);
        assert_eq!(rl.on_epoch_end(&ctx(0, "val_acc", 0.7, 1e-3)), CallbackAction::Continue);
        match rl.on_epoch_end(&ctx(1, "val_acc", 0.7, 1e-3)) {
            CallbackAction::SetLearningRate(lr) => assert!((lr - 2e-4).abs() < 1e-12),
            other => panic!("expected a learning rate change, got {:?}", other),
        }
        // floor at min_lr
        match rl.on_epoch_end(&ctx(2, "val_acc", 0.7, 2e-5)) {
            CallbackAction::SetLearningRate(lr) => assert_eq!(lr, 1e-5),
            other => panic!("expected a learning rate change, got {:?}", other),
        }
        assert_eq!(rl.on_epoch_end(&ctx(3, "val_acc", 0.7, 1e-5)), CallbackAction::Continue);
    }

    #[test]
    fn test_callback_list_combines_actions() {
        let mut list = CallbackList::new();
        list.push(EarlyStopping::new("val_acc", 0, 0.0));
        list.push(ReduceLrOnPlateau::new("val_acc", 0.5, 0, 0.0));
        assert_eq!(list.len(), 2);

        assert_eq!(list.on_epoch_end(&ctx(0, "val_acc", 0.5, 1.0)), (false, None));
        let (stop, lr) = list.on_epoch_end(&ctx(1, "val_acc", 0.5, 1.0));
        assert!(stop);
        assert_eq!(lr, Some(0.5));
    }
}
