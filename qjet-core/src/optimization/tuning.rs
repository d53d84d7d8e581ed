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

//! Random search over distillation hyperparameters
//!
//! Trials run one after the other. Each samples a configuration from the
//! [`HyperparameterSpace`], trains `executions_per_trial` fresh models through
//! a [`HyperModel`] and scores the trial with the mean of the best objective
//! value reached by each execution.
//!
//! Results land in `<directory>/<project_name>/`: one `trial_<id>/trial.json`
//! per trial and an `oracle.json` summary once the search ends.

use crate::config::{TrainingConfig, TuneConfig};
use crate::model::{Hyperparameters, Model};
use crate::networks::Architecture;
use crate::optimization::distillation::{DistillationConfig, Distiller};
use crate::runtime::Runtime;
use crate::training::{CallbackList, History, MonitorMode};
use crate::{QjetError, Result};
use candle_core::Tensor;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const TRIAL_FILE: &str = "trial.json";
pub const ORACLE_FILE: &str = "oracle.json";

/// Resampling attempts before the space is considered exhausted
const MAX_COLLISION_RETRIES: usize = 100;

/// Sampled values by hyperparameter name
pub type TrialParams = BTreeMap<String, f64>;

/// Range of values one hyperparameter may take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterDomain {
    Continuous {
        low: f64,
        high: f64,
        #[serde(default)]
        log_scale: bool,
    },
    /// Integers in `[low, high]`
    Discrete { low: i64, high: i64 },
    Choice { values: Vec<f64> },
}

impl ParameterDomain {
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            Self::Continuous { low, high, log_scale } => {
                low.is_finite() && high.is_finite() && low <= high && (!log_scale || *low > 0.0)
            }
            Self::Discrete { low, high } => low <= high,
            Self::Choice { values } => !values.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(QjetError::InvalidConfiguration {
                message: format!("invalid search domain {:?}", self),
            })
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Self::Continuous { low, high, .. } if low == high => *low,
            Self::Continuous {
                low,
                high,
                log_scale: true,
            } => rng.gen_range(low.ln()..high.ln()).exp(),
            Self::Continuous { low, high, .. } => rng.gen_range(*low..*high),
            Self::Discrete { low, high } => rng.gen_range(*low..=*high) as f64,
            Self::Choice { values } => values[rng.gen_range(0..values.len())],
        }
    }
}

impl std::fmt::Display for ParameterDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continuous { low, high, log_scale } => write!(
                f,
                "Float {{min_value: {}, max_value: {}, sampling: {}}}",
                low,
                high,
                if *log_scale { "log" } else { "linear" }
            ),
            Self::Discrete { low, high } => {
                write!(f, "Int {{min_value: {}, max_value: {}}}", low, high)
            }
            Self::Choice { values } => write!(f, "Choice {{values: {:?}}}", values),
        }
    }
}

/// Named hyperparameter domains
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperparameterSpace {
    params: BTreeMap<String, ParameterDomain>,
}

impl HyperparameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: &str, domain: ParameterDomain) -> Self {
        self.params.insert(name.to_string(), domain);
        self
    }

    /// Temperature, alpha and learning rate of the distiller
    pub fn distillation_default() -> Self {
        Self::new()
            .add(
                "temperature",
                ParameterDomain::Continuous {
                    low: 1.0,
                    high: 20.0,
                    log_scale: false,
                },
            )
            .add(
                "alpha",
                ParameterDomain::Continuous {
                    low: 0.0,
                    high: 1.0,
                    log_scale: false,
                },
            )
            .add(
                "learning_rate",
                ParameterDomain::Choice {
                    values: vec![1e-2, 1e-3, 1e-4],
                },
            )
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDomain> {
        self.params.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(QjetError::InvalidConfiguration {
                message: "search space is empty".to_string(),
            });
        }
        self.params.values().try_for_each(ParameterDomain::validate)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> TrialParams {
        self.params
            .iter()
            .map(|(name, domain)| (name.clone(), domain.sample(rng)))
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut out = format!("Search space summary\nDefault search space size: {}\n", self.len());
        for (name, domain) in &self.params {
            out.push_str(&format!("{} ({})\n", name, domain));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Completed,
    Failed,
}

/// One sampled configuration and its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: String,
    pub params: TrialParams,
    pub status: TrialStatus,
    /// Mean of the per-execution best objective; `None` for failed trials
    pub score: Option<f64>,
    pub execution_scores: Vec<f64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Trial {
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref().join(format!("trial_{}", self.trial_id));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(TRIAL_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Builds and trains one model per execution of a trial
pub trait HyperModel {
    /// Train a fresh model with `params` and return its history
    fn fit_trial(&mut self, params: &TrialParams, execution: usize) -> Result<History>;
}

/// Outcome of a search, in trial order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSummary {
    pub objective: String,
    pub direction: MonitorMode,
    pub trials: Vec<Trial>,
}

impl SearchSummary {
    pub fn completed(&self) -> impl Iterator<Item = &Trial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Completed)
    }

    /// Completed trials, best objective first
    pub fn ranked(&self) -> Vec<&Trial> {
        let mut ranked: Vec<&Trial> = self.completed().filter(|t| t.score.is_some()).collect();
        ranked.sort_by(|a, b| {
            let (a, b) = (a.score.unwrap_or(f64::NAN), b.score.unwrap_or(f64::NAN));
            match self.direction {
                MonitorMode::Max => b.total_cmp(&a),
                MonitorMode::Min => a.total_cmp(&b),
            }
        });
        ranked
    }

    pub fn best(&self) -> Option<&Trial> {
        self.ranked().into_iter().next()
    }

    /// Text report of the `n` best trials
    pub fn results_summary(&self, n: usize) -> String {
        let mut out = format!(
            "Results summary\nObjective: {} ({:?})\n",
            self.objective, self.direction
        );
        for trial in self.ranked().into_iter().take(n) {
            out.push_str(&format!("Trial {} summary\nHyperparameters:\n", trial.trial_id));
            for (name, value) in &trial.params {
                out.push_str(&format!("{}: {}\n", name, value));
            }
            out.push_str(&format!("Score: {}\n", trial.score.unwrap_or(f64::NAN)));
        }
        out
    }
}

/// Random search driver
#[derive(Debug, Clone)]
pub struct RandomSearch {
    pub max_trials: usize,
    pub executions_per_trial: usize,
    pub objective: String,
    pub direction: MonitorMode,
    pub directory: PathBuf,
    pub project_name: String,
    pub overwrite: bool,
    pub seed: u64,
    pub max_consecutive_failed_trials: usize,
}

impl RandomSearch {
    pub fn new<P: Into<PathBuf>>(directory: P, project_name: &str) -> Self {
        Self {
            max_trials: 300,
            executions_per_trial: 1,
            objective: "val_acc".to_string(),
            direction: MonitorMode::Max,
            directory: directory.into(),
            project_name: project_name.to_string(),
            overwrite: true,
            seed: 123,
            max_consecutive_failed_trials: 3,
        }
    }

    pub fn from_config<P: Into<PathBuf>>(config: &TuneConfig, directory: P) -> Self {
        Self {
            max_trials: config.max_trials,
            executions_per_trial: config.executions_per_trial,
            objective: config.objective.clone(),
            direction: MonitorMode::auto(&config.objective),
            directory: directory.into(),
            project_name: config.project_name.clone(),
            overwrite: config.overwrite,
            seed: config.seed,
            max_consecutive_failed_trials: config.max_consecutive_failed_trials,
        }
    }

    pub fn with_max_trials(mut self, max_trials: usize) -> Self {
        self.max_trials = max_trials;
        self
    }

    pub fn with_objective(mut self, objective: &str) -> Self {
        self.objective = objective.to_string();
        self.direction = MonitorMode::auto(objective);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn project_dir(&self) -> PathBuf {
        self.directory.join(&self.project_name)
    }

    fn prepare_project_dir(&self) -> Result<PathBuf> {
        let dir = self.project_dir();
        if dir.exists() {
            if self.overwrite {
                info!("Overwriting previous search results in {}", dir.display());
                std::fs::remove_dir_all(&dir)?;
            } else {
                return Err(QjetError::SearchFailed {
                    reason: format!(
                        "{} already exists and overwrite is disabled",
                        dir.display()
                    ),
                });
            }
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Run up to `max_trials` trials of `hypermodel` over `space`
    pub fn search<H: HyperModel + ?Sized>(
        &self,
        space: &HyperparameterSpace,
        hypermodel: &mut H,
    ) -> Result<SearchSummary> {
        space.validate()?;
        if self.max_trials == 0 || self.executions_per_trial == 0 {
            return Err(QjetError::InvalidConfiguration {
                message: "max_trials and executions_per_trial must be positive".to_string(),
            });
        }

        let dir = self.prepare_project_dir()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut seen: HashSet<String> = HashSet::new();
        let mut summary = SearchSummary {
            objective: self.objective.clone(),
            direction: self.direction,
            trials: Vec::with_capacity(self.max_trials),
        };
        let mut consecutive_failures = 0;

        info!("{}", space.summary());

        for index in 0..self.max_trials {
            let params = match sample_unseen(space, &mut rng, &mut seen) {
                Some(params) => params,
                None => {
                    info!("Search space exhausted after {} trials", index);
                    break;
                }
            };

            let trial = self.run_trial(index, params, hypermodel);
            trial.save(&dir)?;
            match trial.status {
                TrialStatus::Completed => {
                    consecutive_failures = 0;
                    info!(
                        "Trial {} complete: {} = {:.5}",
                        trial.trial_id,
                        self.objective,
                        trial.score.unwrap_or(f64::NAN)
                    );
                }
                TrialStatus::Failed => {
                    consecutive_failures += 1;
                    warn!(
                        "Trial {} failed: {}",
                        trial.trial_id,
                        trial.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            summary.trials.push(trial);

            if consecutive_failures > self.max_consecutive_failed_trials {
                self.write_oracle(&dir, &summary)?;
                return Err(QjetError::SearchFailed {
                    reason: format!("{} consecutive trials failed", consecutive_failures),
                });
            }
        }

        self.write_oracle(&dir, &summary)?;
        if let Some(best) = summary.best() {
            info!(
                "Best trial {}: {} = {:.5}",
                best.trial_id,
                self.objective,
                best.score.unwrap_or(f64::NAN)
            );
        }
        Ok(summary)
    }

    fn run_trial<H: HyperModel + ?Sized>(
        &self,
        index: usize,
        params: TrialParams,
        hypermodel: &mut H,
    ) -> Trial {
        let started_at = Utc::now();
        let trial_id = format!("{:04}", index);
        let mut execution_scores = Vec::with_capacity(self.executions_per_trial);
        let mut error = None;

        for execution in 0..self.executions_per_trial {
            match hypermodel.fit_trial(&params, execution) {
                Ok(history) => match history.best(&self.objective, self.direction) {
                    Some(score) => execution_scores.push(score),
                    None => {
                        error = Some(format!("objective '{}' was never reported", self.objective));
                        break;
                    }
                },
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let (status, score) = match error {
            None => {
                let mean = execution_scores.iter().sum::<f64>() / execution_scores.len() as f64;
                (TrialStatus::Completed, Some(mean))
            }
            Some(_) => (TrialStatus::Failed, None),
        };

        Trial {
            trial_id,
            params,
            status,
            score,
            execution_scores,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn write_oracle(&self, dir: &Path, summary: &SearchSummary) -> Result<()> {
        let oracle = serde_json::json!({
            "objective": self.objective,
            "direction": self.direction,
            "max_trials": self.max_trials,
            "executions_per_trial": self.executions_per_trial,
            "seed": self.seed,
            "trial_ids": summary.trials.iter().map(|t| &t.trial_id).collect::<Vec<_>>(),
            "best_trial": summary.best().map(|t| &t.trial_id),
            "completed_at": Utc::now(),
        });
        std::fs::write(dir.join(ORACLE_FILE), serde_json::to_string_pretty(&oracle)?)?;
        Ok(())
    }
}

fn sample_unseen<R: Rng>(
    space: &HyperparameterSpace,
    rng: &mut R,
    seen: &mut HashSet<String>,
) -> Option<TrialParams> {
    for _ in 0..MAX_COLLISION_RETRIES {
        let params = space.sample(rng);
        let key = params
            .iter()
            .map(|(k, v)| format!("{}={:e}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        if seen.insert(key) {
            return Some(params);
        }
    }
    None
}

/// Binds a frozen teacher, a student architecture and the training data into
/// a trial runner for [`RandomSearch`]
pub struct DistillerHypermodel<'a> {
    teacher: &'a Model,
    student: Architecture,
    runtime: &'a Runtime,
    x: &'a Tensor,
    y: &'a Tensor,
    training: TrainingConfig,
    base: DistillationConfig,
}

impl<'a> DistillerHypermodel<'a> {
    pub fn new(
        teacher: &'a Model,
        student: Architecture,
        runtime: &'a Runtime,
        (x, y): (&'a Tensor, &'a Tensor),
        training: TrainingConfig,
        base: DistillationConfig,
    ) -> Self {
        Self {
            teacher,
            student,
            runtime,
            x,
            y,
            training,
            base,
        }
    }

    /// Distillation settings for one trial: sampled values override the base
    pub fn trial_config(&self, params: &TrialParams) -> DistillationConfig {
        let mut config = self.base.clone();
        if let Some(&t) = params.get("temperature") {
            config.temperature = t;
        }
        if let Some(&a) = params.get("alpha") {
            config.alpha = a;
        }
        if let Some(&lr) = params.get("learning_rate") {
            config.learning_rate = lr;
        }
        config
    }
}

impl HyperModel for DistillerHypermodel<'_> {
    fn fit_trial(&mut self, params: &TrialParams, execution: usize) -> Result<History> {
        let config = self.trial_config(params);
        let mut hyperparameters =
            Hyperparameters::new(self.student.clone(), self.teacher.hyperparameters.input_shape);
        hyperparameters.precision = self.teacher.hyperparameters.precision;
        hyperparameters.training_hyperparams = Some(self.training.clone());

        let seed = self.runtime.seed.wrapping_add(execution as u64);
        let student = Model::build_seeded(hyperparameters, self.runtime, seed)?;
        let mut distiller = Distiller::new(student, self.teacher, &config)?;
        let mut callbacks = CallbackList::from_training(&self.training);
        distiller.fit(
            self.x,
            self.y,
            &self.training,
            &mut callbacks,
            seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::EpochLogs;

    /// Scores each trial by how close alpha is to 0.25
    struct QuadraticModel {
        calls: usize,
        fail_all: bool,
    }

    impl HyperModel for QuadraticModel {
        fn fit_trial(&mut self, params: &TrialParams, _execution: usize) -> Result<History> {
            self.calls += 1;
            if self.fail_all {
                return Err(QjetError::TrainingFailed {
                    reason: "diverged".to_string(),
                });
            }
            let alpha = params["alpha"];
            let mut history = History::new();
            for epoch in 0..3 {
                let mut logs = EpochLogs::new();
                logs.insert(
                    "val_acc".to_string(),
                    1.0 - (alpha - 0.25).powi(2) - 0.01 * (2 - epoch) as f64,
                );
                history.push(logs);
            }
            Ok(history)
        }
    }

    fn search(dir: &Path) -> RandomSearch {
        RandomSearch::new(dir, "unit").with_max_trials(12).with_seed(9)
    }

    #[test]
    fn test_domain_sampling_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let log = ParameterDomain::Continuous {
            low: 1e-4,
            high: 1e-1,
            log_scale: true,
        };
        let discrete = ParameterDomain::Discrete { low: 2, high: 4 };
        for _ in 0..200 {
            let v = log.sample(&mut rng);
            assert!((1e-4..1e-1).contains(&v));
            let d = discrete.sample(&mut rng);
            assert!([2.0, 3.0, 4.0].contains(&d));
        }
        assert!(ParameterDomain::Choice { values: vec![] }.validate().is_err());
        assert!(ParameterDomain::Continuous {
            low: 0.0,
            high: 1.0,
            log_scale: true
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_default_space() {
        let space = HyperparameterSpace::distillation_default();
        assert_eq!(space.len(), 3);
        let params = space.sample(&mut StdRng::seed_from_u64(1));
        assert!((1.0..20.0).contains(&params["temperature"]));
        assert!((0.0..1.0).contains(&params["alpha"]));
        assert!([1e-2, 1e-3, 1e-4].contains(&params["learning_rate"]));
        assert!(space.summary().contains("learning_rate"));
    }

    #[test]
    fn test_search_respects_budget_and_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = QuadraticModel {
            calls: 0,
            fail_all: false,
        };
        let summary = search(dir.path())
            .search(&HyperparameterSpace::distillation_default(), &mut model)
            .unwrap();

        assert_eq!(summary.trials.len(), 12);
        assert_eq!(model.calls, 12);
        for trial in &summary.trials {
            assert_eq!(trial.status, TrialStatus::Completed);
            assert_eq!(trial.execution_scores.len(), 1);
            let alpha = trial.params["alpha"];
            let expected = 1.0 - (alpha - 0.25).powi(2);
            assert!((trial.score.unwrap() - expected).abs() < 1e-12);
        }

        let ranked = summary.ranked();
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        let project = dir.path().join("unit");
        assert!(project.join(ORACLE_FILE).exists());
        let first = Trial::load(project.join("trial_0000").join(TRIAL_FILE)).unwrap();
        assert_eq!(first.params, summary.trials[0].params);
    }

    #[test]
    fn test_search_is_reproducible() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let space = HyperparameterSpace::distillation_default();
        let mut model = QuadraticModel {
            calls: 0,
            fail_all: false,
        };
        let first = search(a.path()).search(&space, &mut model).unwrap();
        let second = search(b.path()).search(&space, &mut model).unwrap();
        let params = |s: &SearchSummary| s.trials.iter().map(|t| t.params.clone()).collect::<Vec<_>>();
        assert_eq!(params(&first), params(&second));
    }

    #[test]
    fn test_overwrite_clears_previous_results() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("unit").join("trial_9999");
        std::fs::create_dir_all(&stale).unwrap();

        let mut model = QuadraticModel {
            calls: 0,
            fail_all: false,
        };
        search(dir.path())
            .with_max_trials(1)
            .search(&HyperparameterSpace::distillation_default(), &mut model)
            .unwrap();
        assert!(!stale.exists());

        let mut keep = search(dir.path());
        keep.overwrite = false;
        assert!(keep
            .search(&HyperparameterSpace::distillation_default(), &mut model)
            .is_err());
    }

    #[test]
    fn test_consecutive_failures_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = QuadraticModel {
            calls: 0,
            fail_all: true,
        };
        let result = search(dir.path()).search(&HyperparameterSpace::distillation_default(), &mut model);
        assert!(matches!(result, Err(QjetError::SearchFailed { .. })));
        // default limit of 3 tolerates three failures and aborts on the fourth
        assert_eq!(model.calls, 4);
    }

    #[test]
    fn test_small_discrete_space_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let space = HyperparameterSpace::new()
            .add("alpha", ParameterDomain::Choice { values: vec![0.1, 0.2] });
        let mut model = QuadraticModel {
            calls: 0,
            fail_all: false,
        };
        let summary = search(dir.path()).search(&space, &mut model).unwrap();
        assert_eq!(summary.trials.len(), 2);
        assert!((summary.best().unwrap().params["alpha"] - 0.2).abs() < 1e-12);
    }
}
