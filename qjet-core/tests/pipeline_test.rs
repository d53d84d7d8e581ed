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

//! End-to-end runs of the train, evaluate, distill and tune flows on a
//! synthetic dataset

mod common;

use candle_core::{Device, Tensor};
use common::{separable_jets, write_dataset, NCONST, NFEATS};
use qjet_core::config::{
    DataConfig, DistillRunConfig, EvaluateConfig, RunConfig, TrainingConfig, TuneConfig,
};
use qjet_core::evaluation::{
    OUTPUT_HISTOGRAM_FILE, PREDICTIONS_FILE, REPORT_FILE, ROC_FILE, WEIGHTS_NPZ_FILE,
};
use qjet_core::model::{
    Hyperparameters, Model, ARCHITECTURE_FILE, HISTORY_FILE, HYPERPARAMETERS_FILE, WEIGHTS_FILE,
};
use qjet_core::networks::{Architecture, DeepSetsConfig, IntNetConfig};
use qjet_core::pipeline::{self, Command};
use qjet_core::training::History;
use qjet_core::data::{X_TEST_FILE, X_TRAIN_FILE, Y_TEST_FILE, Y_TRAIN_FILE};
use qjet_core::{QjetError, Runtime};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

const NTRAIN: usize = 96;
const NTEST: usize = 40;

fn base_config(root: &Path) -> RunConfig {
    let data_dir = root.join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    write_dataset(&data_dir, NTRAIN, NTEST);

    let mut config = RunConfig {
        data: DataConfig {
            data_folder: Some(data_dir),
            ..Default::default()
        },
        model: Some(Architecture::Invariant(DeepSetsConfig {
            nnodes_phi: 8,
            nnodes_rho: 4,
            nclasses: 2,
            ..Default::default()
        })),
        training: TrainingConfig {
            epochs: 2,
            batch: 32,
            ..Default::default()
        },
        outdir: root.join("out"),
        ..Default::default()
    };
    config.runtime.log_level = "warn".to_string();
    config
}

#[test]
fn test_train_then_evaluate() {
    let root = TempDir::new().unwrap();
    let mut config = base_config(root.path());

    let outcome = pipeline::train(&config).unwrap();
    let model_dir = outcome.model_dir;
    assert_eq!(model_dir, root.path().join("out").join("invariant"));
    for file in [HYPERPARAMETERS_FILE, WEIGHTS_FILE, ARCHITECTURE_FILE, HISTORY_FILE] {
        assert!(model_dir.join(file).exists(), "missing {}", file);
    }
    let history = History::load(model_dir.join(HISTORY_FILE)).unwrap();
    assert_eq!(history.len(), outcome.history.len());
    assert!(outcome.test_logs.contains_key("acc"));

    config.evaluate = Some(EvaluateConfig {
        model_dir: model_dir.clone(),
        const_seed: Some(5),
        flops_only: false,
        batch_size: 16,
    });
    let report = pipeline::evaluate(&config).unwrap();
    let flops = report.flops.expect("floating point DeepSets report FLOPs");
    assert!(flops.total_flops > 0);

    let performance = report.performance.unwrap();
    assert_eq!(performance.njets, NTEST);
    assert_eq!(performance.auc.len(), 2);
    assert!(performance.cross_entropy.is_finite());

    let plots = model_dir.join("plots_5");
    for file in [ROC_FILE, OUTPUT_HISTOGRAM_FILE, PREDICTIONS_FILE, REPORT_FILE] {
        assert!(plots.join(file).exists(), "missing {}", file);
    }
    let predictions = std::fs::read(plots.join(PREDICTIONS_FILE)).unwrap();
    assert_eq!(predictions.len(), NTEST * 2 * 4);
    assert!(model_dir.join(WEIGHTS_NPZ_FILE).exists());
}

/// Jets labelled with three classes instead of the two the models are trained on
fn write_three_class_dataset(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let labels = |n: usize| {
        let values: Vec<u32> = (0..n as u32).map(|i| i % 3).collect();
        Tensor::from_vec(values, n, &Device::Cpu).unwrap()
    };
    let (x_train, _) = separable_jets(NTRAIN, 3);
    let (x_test, _) = separable_jets(NTEST, 4);
    x_train.write_npy(dir.join(X_TRAIN_FILE)).unwrap();
    labels(NTRAIN).write_npy(dir.join(Y_TRAIN_FILE)).unwrap();
    x_test.write_npy(dir.join(X_TEST_FILE)).unwrap();
    labels(NTEST).write_npy(dir.join(Y_TEST_FILE)).unwrap();
}

#[test]
fn test_evaluate_rejects_incompatible_data() {
    let root = TempDir::new().unwrap();
    let mut config = base_config(root.path());
    config.training.epochs = 1;
    let outcome = pipeline::train(&config).unwrap();
    config.evaluate = Some(EvaluateConfig {
        model_dir: outcome.model_dir.clone(),
        const_seed: None,
        flops_only: false,
        batch_size: 16,
    });

    let three_classes = root.path().join("three_classes");
    write_three_class_dataset(&three_classes);
    config.data.data_folder = Some(three_classes);
    match pipeline::evaluate(&config) {
        Err(QjetError::ShapeMismatch { expected, actual }) => {
            assert_eq!(expected, vec![2]);
            assert_eq!(actual, vec![3]);
        }
        other => panic!("expected a class count mismatch, got {:?}", other),
    }

    config.data.data_folder = Some(root.path().join("data"));
    config.data.nconst = Some(NCONST - 2);
    assert!(matches!(
        pipeline::evaluate(&config),
        Err(QjetError::ShapeMismatch { .. })
    ));
    assert!(!outcome.model_dir.join("plots").exists());
}

#[test]
fn test_evaluate_stops_after_flops_by_default() {
    let root = TempDir::new().unwrap();
    let mut config = base_config(root.path());
    config.model = Some(Architecture::Intnet(IntNetConfig {
        effects_nodes: vec![4],
        objects_nodes: vec![4],
        classifier_nodes: vec![4],
        nclasses: 2,
        ..Default::default()
    }));
    config.training.epochs = 1;
    let outcome = pipeline::train(&config).unwrap();

    config.evaluate = Some(EvaluateConfig {
        model_dir: outcome.model_dir.clone(),
        const_seed: None,
        flops_only: true,
        batch_size: 64,
    });
    let report = pipeline::evaluate(&config).unwrap();
    assert_eq!(report.architecture, "intnet");
    assert!(report.flops.is_none());
    assert!(report.performance.is_none());
    assert!(!outcome.model_dir.join("plots").exists());
}

#[test]
fn test_distill_and_tune_from_saved_teacher() {
    let root = TempDir::new().unwrap();
    let mut config = base_config(root.path());
    let teacher_dir = pipeline::train(&config).unwrap().model_dir;

    config.distill = Some(DistillRunConfig {
        teacher: teacher_dir,
        student_type: "jedidnn".to_string(),
        student: json!({"node_size": 8, "nclasses": 2}),
        temperature: 4.0,
        alpha: 0.5,
    });
    let outcome = pipeline::distill(&config).unwrap();
    assert_eq!(
        outcome.model_dir,
        root.path().join("out").join("jedidnn_distilled")
    );
    assert!(outcome.history.metric("distillation_loss").len() >= 1);
    assert!(outcome.test_logs.contains_key("student_loss"));

    config.tune = Some(TuneConfig {
        max_trials: 2,
        epochs: Some(1),
        ..Default::default()
    });
    let summary = pipeline::tune(&config).unwrap();
    assert!(!summary.trials.is_empty() && summary.trials.len() <= 2);
    assert!(root.path().join("out").join("distiller_search").is_dir());
}

#[test]
fn test_saved_model_reproduces_predictions() {
    let root = TempDir::new().unwrap();
    let runtime = Runtime::cpu();
    let architecture = Architecture::Equivariant(DeepSetsConfig {
        nnodes_phi: 6,
        nnodes_rho: 4,
        nclasses: 2,
        nbits: Some(6),
        ..Default::default()
    });
    let model =
        Model::build(Hyperparameters::new(architecture, [NCONST, NFEATS]), &runtime).unwrap();
    let (x, _) = common::separable_jets(10, 4);

    let dir = root.path().join("qequivariant");
    model.save(&dir).unwrap();
    let loaded = Model::load(&dir, &runtime).unwrap();

    let before: Vec<Vec<f32>> = model.predict(&x, 4).unwrap().to_vec2().unwrap();
    let after: Vec<Vec<f32>> = loaded.predict(&x, 4).unwrap().to_vec2().unwrap();
    assert_eq!(before, after);
    assert_eq!(loaded.info.architecture, "qequivariant");
}

#[test]
fn test_run_from_config_file() {
    let root = TempDir::new().unwrap();
    let mut config = base_config(root.path());
    config.training.epochs = 1;
    let path = root.path().join("train.toml");
    config.save(&path).unwrap();

    pipeline::run(Command::Train, &path).unwrap();
    assert!(root
        .path()
        .join("out")
        .join("invariant")
        .join(WEIGHTS_FILE)
        .exists());
}
