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

//! Classifier performance on the test split
//!
//! Produces the data behind the usual jet-tagging plots: one-vs-rest ROC
//! curves with their AUC and per-class histograms of the network output. The
//! plotting itself happens elsewhere.

use crate::config::RunConfig;
use crate::data::{shuffle_constituents, JetData};
use crate::flops::{count, FlopsReport};
use crate::model::{Hyperparameters, Model};
use crate::runtime::Runtime;
use crate::{QjetError, Result};
use candle_core::{DType, Tensor, D};
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ROC_FILE: &str = "roc.json";
pub const OUTPUT_HISTOGRAM_FILE: &str = "dnn_output.json";
pub const PREDICTIONS_FILE: &str = "y_pred.dat";
pub const REPORT_FILE: &str = "evaluation.json";
pub const WEIGHTS_NPZ_FILE: &str = "model_weights.npz";

/// Jet classes of the five-class tagging dataset, in label order
pub const JET_CLASSES: [&str; 5] = ["g", "q", "W", "Z", "t"];

const HISTOGRAM_BINS: usize = 50;

pub fn class_name(class: usize, nclasses: usize) -> String {
    if nclasses == JET_CLASSES.len() {
        JET_CLASSES[class].to_string()
    } else {
        format!("class_{}", class)
    }
}

/// Softmax of `(jets, nclasses)` logits as nested rows
pub fn softmax_predictions(logits: &Tensor) -> Result<Vec<Vec<f64>>> {
    let probs = candle_nn::ops::softmax(logits, D::Minus1)?;
    Ok(probs.to_dtype(DType::F64)?.to_vec2::<f64>()?)
}

/// Arg-max class of each one-hot row
pub fn labels_from_one_hot(targets: &Tensor) -> Result<Vec<usize>> {
    let labels = targets.argmax(D::Minus1)?.to_vec1::<u32>()?;
    Ok(labels.into_iter().map(|l| l as usize).collect())
}

/// One-vs-rest ROC curve of a single class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocCurve {
    pub class: usize,
    pub label: String,
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
    pub auc: f64,
}

/// ROC points for `scores` against boolean `positives`, highest threshold first.
///
/// Tied scores produce a single point. The curve always starts at `(0, 0)`.
pub fn roc_curve(scores: &[f64], positives: &[bool]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let npos = positives.iter().filter(|&&p| p).count() as f64;
    let nneg = positives.len() as f64 - npos;

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![f64::INFINITY];
    let (mut tp, mut fp) = (0.0, 0.0);

    for (rank, &i) in order.iter().enumerate() {
        if positives[i] {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_tie = order
            .get(rank + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_tie {
            fpr.push(if nneg > 0.0 { fp / nneg } else { 0.0 });
            tpr.push(if npos > 0.0 { tp / npos } else { 0.0 });
            thresholds.push(scores[i]);
        }
    }
    (fpr, tpr, thresholds)
}

/// Trapezoidal area under a curve with non-decreasing `x`
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[1] + ys[0]) / 2.0)
        .sum()
}

/// One-vs-rest ROC curves of every class, computed in parallel
pub fn roc_curves(probs: &[Vec<f64>], labels: &[usize], nclasses: usize) -> Vec<RocCurve> {
    (0..nclasses)
        .into_par_iter()
        .map(|class| {
            let scores: Vec<f64> = probs.iter().map(|row| row[class]).collect();
            let positives: Vec<bool> = labels.iter().map(|&l| l == class).collect();
            let (fpr, tpr, thresholds) = roc_curve(&scores, &positives);
            let auc = auc(&fpr, &tpr);
            RocCurve {
                class,
                label: class_name(class, nclasses),
                fpr,
                tpr,
                thresholds,
                auc,
            }
        })
        .collect()
}

/// Distribution of one output node, split by true class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputHistogram {
    pub output_class: usize,
    pub label: String,
    pub bin_edges: Vec<f64>,
    /// `counts[k]` is the histogram over jets whose true class is `k`
    pub counts: Vec<Vec<u64>>,
}

pub fn output_histograms(probs: &[Vec<f64>], labels: &[usize], nclasses: usize) -> Vec<OutputHistogram> {
    let bin_edges: Vec<f64> = (0..=HISTOGRAM_BINS)
        .map(|i| i as f64 / HISTOGRAM_BINS as f64)
        .collect();

    (0..nclasses)
        .map(|output_class| {
            let mut counts = vec![vec![0u64; HISTOGRAM_BINS]; nclasses];
            for (row, &label) in probs.iter().zip(labels) {
                let value = row[output_class].clamp(0.0, 1.0);
                let bin = ((value * HISTOGRAM_BINS as f64) as usize).min(HISTOGRAM_BINS - 1);
                if let Some(hist) = counts.get_mut(label) {
                    hist[bin] += 1;
                }
            }
            OutputHistogram {
                output_class,
                label: class_name(output_class, nclasses),
                bin_edges: bin_edges.clone(),
                counts,
            }
        })
        .collect()
}

/// Classifier metrics on the test split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    pub njets: usize,
    pub cross_entropy: f64,
    pub accuracy: f64,
    /// AUC of each class, in label order
    pub auc: Vec<(String, f64)>,
}

/// Summary of one evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub architecture: String,
    pub flops: Option<FlopsReport>,
    /// Absent when the run stopped after the FLOPs report
    pub performance: Option<Performance>,
}

impl EvaluationReport {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Output directory for plot data, keyed by the constituent shuffling seed
pub fn plots_dir(model_dir: &Path, const_seed: Option<u64>) -> PathBuf {
    match const_seed {
        Some(seed) => model_dir.join(format!("plots_{}", seed)),
        None => model_dir.join("plots"),
    }
}

/// Evaluate the model saved in `evaluate.model_dir`.
///
/// The data section of `config` is overlaid on the data settings the model
/// was trained with.
pub fn evaluate(config: &RunConfig, runtime: &Runtime) -> Result<EvaluationReport> {
    let settings = config
        .evaluate
        .as_ref()
        .ok_or_else(|| QjetError::Configuration("missing [evaluate] section".to_string()))?;
    let model_dir = settings.model_dir.as_path();

    let hyperparameters = Hyperparameters::load(model_dir)?;
    let mut data_config = hyperparameters.data_hyperparams.clone();
    data_config.merge(&config.data);
    let data = JetData::load(&data_config, runtime)?;
    let x_test = match settings.const_seed {
        Some(seed) => {
            info!("Shuffling test constituents with seed {}", seed);
            shuffle_constituents(&data.x_test, seed)?
        }
        None => data.x_test.clone(),
    };

    let model = Model::load(model_dir, runtime)?;
    info!("{}", model.summary());

    let architecture = hyperparameters.deepsets_type();
    let flops = if hyperparameters.model_hyperparams.is_floating_point_deepsets() {
        let report = count(&model.info);
        info!("{}", report);
        Some(report)
    } else {
        None
    };

    if settings.flops_only {
        return Ok(EvaluationReport {
            architecture,
            flops,
            performance: None,
        });
    }

    model.check_data(&data)?;
    info!("Running inference on {} jets", data.ntest());
    let logits = model.predict(&x_test, settings.batch_size)?;
    let probs = softmax_predictions(&logits)?;
    let labels = labels_from_one_hot(&data.y_test)?;
    let nclasses = model.nclasses();

    let cross_entropy = cross_entropy(&probs, &labels)?;
    info!("Cross-entropy loss: {:.5}", cross_entropy);

    let plots = plots_dir(model_dir, settings.const_seed);
    std::fs::create_dir_all(&plots)?;
    let curves = roc_curves(&probs, &labels, nclasses);
    for curve in &curves {
        info!("AUC {}: {:.4}", curve.label, curve.auc);
    }
    save_roc_curves(plots.join(ROC_FILE), &curves)?;
    save_output_histograms(
        plots.join(OUTPUT_HISTOGRAM_FILE),
        &output_histograms(&probs, &labels, nclasses),
    )?;

    model.save_weights_npz(model_dir.join(WEIGHTS_NPZ_FILE))?;
    write_predictions(plots.join(PREDICTIONS_FILE), &probs)?;

    let report = EvaluationReport {
        architecture,
        flops,
        performance: Some(Performance {
            njets: probs.len(),
            cross_entropy,
            accuracy: accuracy(&probs, &labels),
            auc: curves.into_iter().map(|c| (c.label, c.auc)).collect(),
        }),
    };
    report.save(plots.join(REPORT_FILE))?;
    info!("Plot data written to {}", plots.display());
    Ok(report)
}

/// Mean categorical cross-entropy of probabilities clipped to `[eps, 1 - eps]`
pub fn cross_entropy(probs: &[Vec<f64>], labels: &[usize]) -> Result<f64> {
    if probs.is_empty() || probs.len() != labels.len() {
        return Err(QjetError::Data(format!(
            "{} predictions for {} labels",
            probs.len(),
            labels.len()
        )));
    }
    let eps = crate::training::metrics::EPSILON;
    let mut total = 0.0;
    for (row, &label) in probs.iter().zip(labels) {
        let p = row.get(label).ok_or_else(|| {
            QjetError::Data(format!("label {} out of range for {} classes", label, row.len()))
        })?;
        total -= p.clamp(eps, 1.0 - eps).ln();
    }
    Ok(total / probs.len() as f64)
}

pub fn accuracy(probs: &[Vec<f64>], labels: &[usize]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let correct = probs
        .iter()
        .zip(labels)
        .filter(|(row, &l)| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                == Some(l)
        })
        .count();
    correct as f64 / probs.len() as f64
}

/// Raw little-endian `f32` dump of the predictions, row-major
pub fn write_predictions<P: AsRef<Path>>(path: P, probs: &[Vec<f64>]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for row in probs {
        for &p in row {
            file.write_all(&(p as f32).to_le_bytes())?;
        }
    }
    file.flush()?;
    Ok(())
}

pub fn save_roc_curves<P: AsRef<Path>>(path: P, curves: &[RocCurve]) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(curves)?)?;
    Ok(())
}

pub fn save_output_histograms<P: AsRef<Path>>(path: P, histograms: &[OutputHistogram]) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(histograms)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_and_random_roc() {
        let scores = [0.9, 0.8, 0.3, 0.1];
        let perfect = [true, true, false, false];
        let (fpr, tpr, _) = roc_curve(&scores, &perfect);
        assert_eq!(auc(&fpr, &tpr), 1.0);

        let inverted = [false, false, true, true];
        let (fpr, tpr, _) = roc_curve(&scores, &inverted);
        assert_eq!(auc(&fpr, &tpr), 0.0);
    }

    #[test]
    fn test_roc_ties_collapse() {
        let scores = [0.5, 0.5, 0.5, 0.5];
        let positives = [true, false, true, false];
        let (fpr, tpr, thresholds) = roc_curve(&scores, &positives);
        assert_eq!(fpr, vec![0.0, 1.0]);
        assert_eq!(tpr, vec![0.0, 1.0]);
        assert_eq!(thresholds.len(), 2);
        assert_eq!(auc(&fpr, &tpr), 0.5);
    }

    #[test]
    fn test_roc_curves_per_class() {
        let probs = vec![
            vec![0.7, 0.2, 0.1],
            vec![0.1, 0.8, 0.1],
            vec![0.2, 0.2, 0.6],
            vec![0.6, 0.3, 0.1],
        ];
        let labels = vec![0, 1, 2, 0];
        let curves = roc_curves(&probs, &labels, 3);
        assert_eq!(curves.len(), 3);
        for (i, curve) in curves.iter().enumerate() {
            assert_eq!(curve.class, i);
            assert_eq!(curve.auc, 1.0);
        }
        assert_eq!(curves[0].label, "class_0");
        assert_eq!(class_name(2, 5), "W");
    }

    #[test]
    fn test_histograms_and_scores() {
        let probs = vec![vec![1.0, 0.0], vec![0.25, 0.75], vec![0.5, 0.5]];
        let labels = vec![0, 1, 1];
        let hists = output_histograms(&probs, &labels, 2);
        assert_eq!(hists[0].bin_edges.len(), HISTOGRAM_BINS + 1);
        assert_eq!(hists[0].counts[0][HISTOGRAM_BINS - 1], 1);
        assert_eq!(hists[0].counts[1].iter().sum::<u64>(), 2);

        assert!((accuracy(&probs, &labels) - 2.0 / 3.0).abs() < 1e-12);
        let ce = cross_entropy(&probs, &labels).unwrap();
        let expected = -(1.0f64 - 1e-7).ln() - 0.75f64.ln() - 0.5f64.ln();
        assert!((ce - expected / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cross_entropy_rejects_unknown_label() {
        let probs = vec![vec![0.6, 0.4], vec![0.3, 0.7]];
        assert!(matches!(cross_entropy(&probs, &[0, 2]), Err(QjetError::Data(_))));
        assert!(cross_entropy(&probs, &[0]).is_err());
    }

    #[test]
    fn test_plots_dir_naming() {
        let dir = Path::new("models/invariant");
        assert_eq!(plots_dir(dir, Some(7)), dir.join("plots_7"));
        assert_eq!(plots_dir(dir, None), dir.join("plots"));
    }

    #[test]
    fn test_write_predictions_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREDICTIONS_FILE);
        write_predictions(&path, &[vec![0.25, 0.75]]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 0.75);
    }
}
