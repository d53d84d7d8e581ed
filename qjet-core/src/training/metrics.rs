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

//! Losses and metrics on `(batch, nclasses)` tensors
//!
//! Losses return scalar tensors so they can be back-propagated; metrics
//! return plain numbers.

use crate::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::ops;

/// Probability clipping used by the probability-space losses
pub const EPSILON: f64 = 1e-7;

/// Batch-mean categorical cross-entropy of one-hot `targets` and raw `logits`
pub fn cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let targets = targets.to_dtype(log_probs.dtype())?;
    Ok(targets.mul(&log_probs)?.sum(D::Minus1)?.neg()?.mean_all()?)
}

/// Batch-mean `KL(p_true || p_pred)` with both distributions clipped to `[eps, 1]`
pub fn kl_divergence(p_true: &Tensor, p_pred: &Tensor) -> Result<Tensor> {
    let p = p_true.clamp(EPSILON, 1.0)?;
    let q = p_pred.clamp(EPSILON, 1.0)?;
    let ratio = p.log()?.sub(&q.log()?)?;
    Ok(p.mul(&ratio)?.sum(D::Minus1)?.mean_all()?)
}

/// Fraction of rows whose arg-max matches the one-hot target
pub fn categorical_accuracy(scores: &Tensor, targets: &Tensor) -> Result<f64> {
    let predicted = scores.argmax(D::Minus1)?;
    let expected = targets.argmax(D::Minus1)?;
    let correct = predicted
        .eq(&expected)?
        .to_dtype(DType::F64)?
        .mean_all()?
        .to_scalar::<f64>()?;
    Ok(correct)
}

/// Scalar tensor to `f64`
pub fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
