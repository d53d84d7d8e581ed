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

//! Compression techniques for hardware-bound jet taggers: quantization-aware
//! layers, knowledge distillation and the search over its hyperparameters

pub mod distillation;
pub mod optimizer;
pub mod quantization;
pub mod tuning;

pub use distillation::{DistillationConfig, DistillationLoss, Distiller, LossParts};
pub use optimizer::{choose_optimizer, TrainOptimizer};
pub use quantization::{
    format_qactivation, format_quantizer, Activation, QuantizedActivation, QuantizerSpec,
};
pub use tuning::{
    DistillerHypermodel, HyperModel, HyperparameterSpace, ParameterDomain, RandomSearch,
    SearchSummary, Trial, TrialParams, TrialStatus,
};
