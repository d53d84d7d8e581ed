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

//! qjet Core - quantization-aware jet tagging networks
//!
//! This crate builds, trains and compresses the small classifiers that tag
//! hadronic jets from their constituents. It includes implementations for:
//!
//! - DeepSets (invariant and equivariant) and interaction networks with
//!   quantization-aware layers
//! - Knowledge distillation into a dense student and random search over its
//!   hyperparameters
//! - Evaluation with ROC data and FLOPs counting

pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod flops;
pub mod layers;
pub mod model;
pub mod networks;
pub mod optimization;
pub mod pipeline;
pub mod runtime;
pub mod training;

pub use config::RunConfig;
pub use data::JetData;
pub use error::{QjetError, Result};
pub use model::{Hyperparameters, LayerInfo, Model, ModelInfo};
pub use networks::{Architecture, JetNetwork};
pub use optimization::{Distiller, RandomSearch};
pub use runtime::{Precision, Runtime};
pub use training::{History, Trainer};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the qjet core library with logging
pub fn init() -> Result<()> {
    // Try to initialize logger, but don't fail if already initialized
    let _ = env_logger::try_init();
    log::info!("qjet Core v{} initialized", VERSION);
    Ok(())
}
