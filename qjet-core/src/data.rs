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

//! Jet datasets
//!
//! Features are `(jets, nconst, nfeats)` tensors, targets are one-hot
//! `(jets, nclasses)` tensors. Preprocessing and normalisation happen before
//! the arrays are written to disk; this module only selects, truncates and
//! shuffles.

use crate::config::DataConfig;
use crate::runtime::Runtime;
use crate::{QjetError, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

pub const X_TRAIN_FILE: &str = "x_train.npy";
pub const Y_TRAIN_FILE: &str = "y_train.npy";
pub const X_TEST_FILE: &str = "x_test.npy";
pub const Y_TEST_FILE: &str = "y_test.npy";

/// Upper bound (exclusive) of the per-jet shuffling seeds
const JET_SEED_RANGE: u64 = 10_000;

/// Train and test splits of a jet dataset
#[derive(Debug, Clone)]
pub struct JetData {
    pub x_train: Tensor,
    pub y_train: Tensor,
    pub x_test: Tensor,
    pub y_test: Tensor,
}

impl JetData {
    /// Build a dataset from in-memory tensors.
    ///
    /// Targets may be one-hot `(N, C)` or class indices `(N,)`; indices are
    /// expanded with `nclasses` inferred from the largest label.
    pub fn from_tensors(x_train: Tensor, y_train: Tensor, x_test: Tensor, y_test: Tensor) -> Result<Self> {
        let dtype = x_train.dtype();
        let nclasses = infer_nclasses(&[&y_train, &y_test])?;
        let y_train = to_one_hot(&y_train, nclasses, dtype)?;
        let y_test = to_one_hot(&y_test, nclasses, dtype)?;
        let data = Self {
            x_train,
            y_train,
            x_test: x_test.to_dtype(dtype)?,
            y_test,
        };
        data.check()?;
        Ok(data)
    }

    /// Load `x_train.npy`, `y_train.npy`, `x_test.npy` and `y_test.npy` from
    /// `data_folder` and apply the selections in `config`.
    pub fn load(config: &DataConfig, runtime: &Runtime) -> Result<Self> {
        config.validate()?;
        let folder = config
            .data_folder
            .as_deref()
            .ok_or_else(|| QjetError::Configuration("data.data_folder is not set".to_string()))?;

        log::info!("Loading jet data from {}", folder.display());
        let read = |name: &str| read_array(&folder.join(name), &runtime.device);
        let x_train = read(X_TRAIN_FILE)?.to_dtype(runtime.dtype)?;
        let x_test = read(X_TEST_FILE)?.to_dtype(runtime.dtype)?;
        let mut data = Self::from_tensors(x_train, read(Y_TRAIN_FILE)?, x_test, read(Y_TEST_FILE)?)?;
        data.apply(config)?;

        log::info!(
            "Train: {:?} | Test: {:?} | classes: {}",
            data.x_train.dims(),
            data.x_test.dims(),
            data.nclasses()
        );
        Ok(data)
    }

    fn apply(&mut self, config: &DataConfig) -> Result<()> {
        if let Some(n) = config.train_events {
            let n = n.min(self.x_train.dim(0)?);
            self.x_train = self.x_train.narrow(0, 0, n)?;
            self.y_train = self.y_train.narrow(0, 0, n)?;
        }
        if let Some(n) = config.test_events {
            let n = n.min(self.x_test.dim(0)?);
            self.x_test = self.x_test.narrow(0, 0, n)?;
            self.y_test = self.y_test.narrow(0, 0, n)?;
        }
        if let Some(nconst) = config.nconst {
            let available = self.x_train.dim(1)?;
            if nconst > available {
                return Err(QjetError::Data(format!(
                    "requested {} constituents but jets only have {}",
                    nconst, available
                )));
            }
            self.x_train = self.x_train.narrow(1, 0, nconst)?;
            self.x_test = self.x_test.narrow(1, 0, nconst)?;
        }
        if let Some(features) = &config.feature_selection {
            let nfeats = self.x_train.dim(2)?;
            if let Some(bad) = features.iter().find(|&&f| f >= nfeats) {
                return Err(QjetError::Data(format!(
                    "feature index {} out of range for {} features",
                    bad, nfeats
                )));
            }
            let idx: Vec<u32> = features.iter().map(|&f| f as u32).collect();
            let idx = Tensor::new(idx.as_slice(), self.x_train.device())?;
            self.x_train = self.x_train.contiguous()?.index_select(&idx, 2)?;
            self.x_test = self.x_test.contiguous()?.index_select(&idx, 2)?;
        }
        if let Some(seed) = config.jet_seed {
            let n = self.x_train.dim(0)?;
            let mut order: Vec<u32> = (0..n as u32).collect();
            order.shuffle(&mut StdRng::seed_from_u64(seed));
            let order = Tensor::new(order.as_slice(), self.x_train.device())?;
            self.x_train = self.x_train.contiguous()?.index_select(&order, 0)?;
            self.y_train = self.y_train.contiguous()?.index_select(&order, 0)?;
        }
        self.x_train = self.x_train.contiguous()?;
        self.x_test = self.x_test.contiguous()?;
        self.check()
    }

    fn check(&self) -> Result<()> {
        for (x, y, split) in [
            (&self.x_train, &self.y_train, "train"),
            (&self.x_test, &self.y_test, "test"),
        ] {
            if x.rank() != 3 {
                return Err(QjetError::Data(format!(
                    "{} features must be (jets, nconst, nfeats), got {:?}",
                    split,
                    x.dims()
                )));
            }
            if x.dim(0)? != y.dim(0)? {
                return Err(QjetError::Data(format!(
                    "{} split has {} jets but {} targets",
                    split,
                    x.dim(0)?,
                    y.dim(0)?
                )));
            }
        }
        if self.x_train.dims()[1..] != self.x_test.dims()[1..] {
            return Err(QjetError::ShapeMismatch {
                expected: self.x_train.dims()[1..].to_vec(),
                actual: self.x_test.dims()[1..].to_vec(),
            });
        }
        Ok(())
    }

    /// Per-jet input shape `[nconst, nfeats]`
    pub fn input_shape(&self) -> [usize; 2] {
        let dims = self.x_train.dims();
        [dims[1], dims[2]]
    }

    pub fn nclasses(&self) -> usize {
        self.y_train.dims().get(1).copied().unwrap_or(0)
    }

    pub fn ntrain(&self) -> usize {
        self.x_train.dims()[0]
    }

    pub fn ntest(&self) -> usize {
        self.x_test.dims()[0]
    }
}

fn read_array(path: &Path, device: &Device) -> Result<Tensor> {
    if !path.exists() {
        return Err(QjetError::Data(format!("missing data file {}", path.display())));
    }
    let array = Tensor::read_npy(path)?;
    Ok(array.to_device(device)?)
}

fn infer_nclasses(targets: &[&Tensor]) -> Result<usize> {
    let mut nclasses = 0;
    for y in targets {
        match y.rank() {
            2 => nclasses = nclasses.max(y.dim(1)?),
            1 => {
                let max = y.to_dtype(DType::F64)?.max(0)?.to_scalar::<f64>()?;
                nclasses = nclasses.max(max as usize + 1);
            }
            _ => {
                return Err(QjetError::Data(format!(
                    "targets must be one-hot (N, C) or labels (N,), got {:?}",
                    y.dims()
                )))
            }
        }
    }
    Ok(nclasses)
}

fn to_one_hot(y: &Tensor, nclasses: usize, dtype: DType) -> Result<Tensor> {
    match y.rank() {
        1 => one_hot(y, nclasses, dtype),
        _ => Ok(y.to_dtype(dtype)?),
    }
}

/// One-hot encode integer class labels
pub fn one_hot(labels: &Tensor, nclasses: usize, dtype: DType) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    let encoded = candle_nn::encoding::one_hot(labels, nclasses, 1f32, 0f32)?;
    Ok(encoded.to_dtype(dtype)?)
}

/// Shuffle the constituents of every jet.
///
/// Each jet gets its own permutation seed drawn from a generator seeded with
/// `seed`, so the result depends only on `seed` and the jet's position.
pub fn shuffle_constituents(x: &Tensor, seed: u64) -> Result<Tensor> {
    let (njets, nconst, nfeats) = x.dims3()?;
    let mut master = StdRng::seed_from_u64(seed);
    let mut flat = Vec::with_capacity(njets * nconst);
    let mut perm: Vec<u32> = (0..nconst as u32).collect();

    for jet in 0..njets {
        let jet_seed = master.gen_range(0..JET_SEED_RANGE);
        perm.sort_unstable();
        perm.shuffle(&mut StdRng::seed_from_u64(jet_seed));
        let offset = (jet * nconst) as u32;
        flat.extend(perm.iter().map(|&p| offset + p));
    }

    let idx = Tensor::new(flat.as_slice(), x.device())?;
    let shuffled = x
        .contiguous()?
        .reshape((njets * nconst, nfeats))?
        .index_select(&idx, 0)?
        .reshape((njets, nconst, nfeats))?;
    Ok(shuffled)
}

/// Split off the trailing `fraction` of the jets for validation
pub fn validation_split(
    x: &Tensor,
    y: &Tensor,
    fraction: f64,
) -> Result<((Tensor, Tensor), Option<(Tensor, Tensor)>)> {
    let n = x.dim(0)?;
    let split_at = ((n as f64) * (1.0 - fraction)).floor() as usize;
    if fraction <= 0.0 || split_at == n {
        return Ok(((x.clone(), y.clone()), None));
    }
    if split_at == 0 {
        return Err(QjetError::Data(format!(
            "validation split {} leaves no training jets out of {}",
            fraction, n
        )));
    }
    let train = (x.narrow(0, 0, split_at)?, y.narrow(0, 0, split_at)?);
    let val = (
        x.narrow(0, split_at, n - split_at)?,
        y.narrow(0, split_at, n - split_at)?,
    );
    Ok((train, Some(val)))
}

/// Index batches over `n` samples, optionally in shuffled order
pub fn batch_indices(n: usize, batch_size: usize, shuffle: Option<&mut StdRng>) -> Vec<Vec<u32>> {
    let mut order: Vec<u32> = (0..n as u32).collect();
    if let Some(rng) = shuffle {
        order.shuffle(rng);
    }
    order
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
