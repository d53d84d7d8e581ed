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

//! End-to-end flows behind the `qjet` commands
//!
//! Each flow takes a validated [`RunConfig`], sets up the runtime and writes
//! its results below `outdir`.

use crate::config::{RunConfig, TrainingConfig};
use crate::data::JetData;
use crate::evaluation::{self, EvaluationReport};
use crate::model::{Hyperparameters, Model, HISTORY_FILE};
use crate::networks::{choose_student, Architecture};
use crate::optimization::distillation::{DistillationConfig, Distiller};
use crate::optimization::tuning::{
    DistillerHypermodel, HyperparameterSpace, RandomSearch, SearchSummary,
};
use crate::runtime::{init_logging, Runtime};
use crate::training::{self, CallbackList, EpochLogs, History, Trainer};
use crate::{QjetError, Result};
use log::info;
use std::path::{Path, PathBuf};

/// Commands understood by the `qjet` binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Train,
    Distill,
    Tune,
    Evaluate,
}

/// A trained model on disk with its training record
#[derive(Debug)]
pub struct TrainOutcome {
    pub model_dir: PathBuf,
    pub history: History,
    pub test_logs: EpochLogs,
}

/// Load the config at `path` and run `command` on it
pub fn run<P: AsRef<Path>>(command: Command, path: P) -> Result<()> {
    let config = RunConfig::load(path)?;
    match command {
        Command::Train => train(&config).map(|_| ()),
        Command::Distill => distill(&config).map(|_| ()),
        Command::Tune => {
            let summary = tune(&config)?;
            info!("{}", summary.results_summary(10));
            Ok(())
        }
        Command::Evaluate => evaluate(&config).map(|_| ()),
    }
}

fn setup(config: &RunConfig) -> Result<Runtime> {
    init_logging(&config.runtime.log_level)?;
    config.validate()?;
    let runtime = Runtime::from_config(&config.runtime)?;
    runtime.describe();
    Ok(runtime)
}

fn save_trained(model: &Model, history: &History, model_dir: &Path) -> Result<()> {
    model.save(model_dir)?;
    history.save(model_dir.join(HISTORY_FILE))?;
    Ok(())
}

/// Train the `[model]` network on `[data]` and save it to `outdir/<type>`
pub fn train(config: &RunConfig) -> Result<TrainOutcome> {
    let runtime = setup(config)?;
    let architecture = config
        .model
        .clone()
        .ok_or_else(|| QjetError::Configuration("missing [model] section".to_string()))?;

    let data = JetData::load(&config.data, &runtime)?;
    let mut hyperparameters = Hyperparameters::new(architecture, data.input_shape());
    hyperparameters.precision = config.runtime.precision;
    hyperparameters.data_hyperparams = config.data.clone();
    hyperparameters.training_hyperparams = Some(config.training.clone());

    let model = Model::build(hyperparameters, &runtime)?;
    model.check_data(&data)?;
    info!("{}", model.summary());

    let mut trainer = Trainer::new(&model, &config.training)?;
    let history = trainer.fit(&data.x_train, &data.y_train, &config.training, runtime.seed)?;
    let test_logs = training::evaluate(&trainer, &data.x_test, &data.y_test, config.training.batch)?;
    info!("Test metrics: {:?}", test_logs);

    let model_dir = config.outdir.join(model.hyperparameters.deepsets_type());
    save_trained(&model, &history, &model_dir)?;
    Ok(TrainOutcome {
        model_dir,
        history,
        test_logs,
    })
}

fn load_teacher(config: &RunConfig, runtime: &Runtime) -> Result<(Model, Architecture, JetData)> {
    let settings = config.distill_settings()?;
    let teacher = Model::load(&settings.teacher, runtime)?;
    let student = choose_student(&settings.student_type, settings.student.clone())?;
    if student.nclasses() != teacher.nclasses() {
        return Err(QjetError::Configuration(format!(
            "student has {} classes but the teacher has {}",
            student.nclasses(),
            teacher.nclasses()
        )));
    }

    let mut data_config = teacher.hyperparameters.data_hyperparams.clone();
    data_config.merge(&config.data);
    let data = JetData::load(&data_config, runtime)?;
    teacher.check_data(&data)?;
    Ok((teacher, student, data))
}

/// Distill the teacher of `[distill]` into a fresh student saved to
/// `outdir/<student type>_distilled`
pub fn distill(config: &RunConfig) -> Result<TrainOutcome> {
    let runtime = setup(config)?;
    let (teacher, student_arch, data) = load_teacher(config, &runtime)?;
    let settings = config.distill_settings()?;
    let distillation = DistillationConfig::from_run(settings, &config.training);

    let mut hyperparameters = Hyperparameters::new(student_arch, data.input_shape());
    hyperparameters.precision = teacher.hyperparameters.precision;
    hyperparameters.data_hyperparams = teacher.hyperparameters.data_hyperparams.clone();
    hyperparameters.training_hyperparams = Some(config.training.clone());
    let student = Model::build(hyperparameters, &runtime)?;
    info!("Teacher:\n{}", teacher.summary());
    info!("Student:\n{}", student.summary());

    let mut distiller = Distiller::new(student, &teacher, &distillation)?;
    let mut callbacks = CallbackList::from_training(&config.training);
    let history = distiller.fit(
        &data.x_train,
        &data.y_train,
        &config.training,
        &mut callbacks,
        runtime.seed,
    )?;
    let test_logs = training::evaluate(&distiller, &data.x_test, &data.y_test, config.training.batch)?;
    info!("Student test metrics: {:?}", test_logs);

    let student = distiller.into_student();
    let model_dir = config
        .outdir
        .join(format!("{}_distilled", student.hyperparameters.deepsets_type()));
    save_trained(&student, &history, &model_dir)?;
    Ok(TrainOutcome {
        model_dir,
        history,
        test_logs,
    })
}

/// Training settings used inside every search trial
pub fn trial_training(config: &RunConfig) -> TrainingConfig {
    let mut training = config.training.clone();
    if let Some(tune) = &config.tune {
        if let Some(epochs) = tune.epochs {
            training.epochs = epochs;
        }
        training.early_stopping = Some(tune.early_stopping.clone());
        training.reduce_lr = Some(tune.reduce_lr.clone());
    }
    training
}

/// Random search over the distillation hyperparameters, results under
/// `outdir/<project_name>`
pub fn tune(config: &RunConfig) -> Result<SearchSummary> {
    let runtime = setup(config)?;
    let settings = config
        .tune
        .as_ref()
        .ok_or_else(|| QjetError::Configuration("missing [tune] section".to_string()))?;
    let (teacher, student_arch, data) = load_teacher(config, &runtime)?;

    let training = trial_training(config);
    let base = DistillationConfig::from_run(config.distill_settings()?, &training);
    let space = settings
        .space
        .clone()
        .unwrap_or_else(HyperparameterSpace::distillation_default);

    let mut hypermodel = DistillerHypermodel::new(
        &teacher,
        student_arch,
        &runtime,
        (&data.x_train, &data.y_train),
        training,
        base,
    );
    RandomSearch::from_config(settings, &config.outdir).search(&space, &mut hypermodel)
}

/// Evaluate the model of `[evaluate]`
pub fn evaluate(config: &RunConfig) -> Result<EvaluationReport> {
    let runtime = setup(config)?;
    evaluation::evaluate(config, &runtime)
}
