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

//! Synthetic jets shared by the integration tests

#![allow(dead_code)]

use candle_core::{Device, Tensor};
use qjet_core::data::{X_TEST_FILE, X_TRAIN_FILE, Y_TEST_FILE, Y_TRAIN_FILE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

pub const NCONST: usize = 6;
pub const NFEATS: usize = 3;

/// `n` jets in two classes separated by the sign of their first feature.
/// Returns the inputs and the class indices.
pub fn separable_jets(n: usize, seed: u64) -> (Tensor, Tensor) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(n * NCONST * NFEATS);
    let mut labels = Vec::with_capacity(n);
    for jet in 0..n {
        let label = (jet % 2) as u32;
        let centre = if label == 1 { 1.0f32 } else { -1.0 };
        for _ in 0..NCONST {
            values.push(centre + rng.gen_range(-0.3..0.3));
            for _ in 1..NFEATS {
                values.push(rng.gen_range(-1.0..1.0));
            }
        }
        labels.push(label);
    }
    let x = Tensor::from_vec(values, (n, NCONST, NFEATS), &Device::Cpu).unwrap();
    let y = Tensor::from_vec(labels, n, &Device::Cpu).unwrap();
    (x, y)
}

/// Write a train/test split of separable jets as `.npy` files into `dir`
pub fn write_dataset(dir: &Path, ntrain: usize, ntest: usize) {
    let (x_train, y_train) = separable_jets(ntrain, 1);
    let (x_test, y_test) = separable_jets(ntest, 2);
    x_train.write_npy(dir.join(X_TRAIN_FILE)).unwrap();
    y_train.write_npy(dir.join(Y_TRAIN_FILE)).unwrap();
    x_test.write_npy(dir.join(X_TEST_FILE)).unwrap();
    y_test.write_npy(dir.join(Y_TEST_FILE)).unwrap();
}
