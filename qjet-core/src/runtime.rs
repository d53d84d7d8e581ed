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

//! Process-wide runtime settings
//!
//! Numeric precision, compute device and log verbosity are decided once at
//! startup and handed to every component that creates tensors.

use crate::{QjetError, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Floating point precision used for parameters and activations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F64,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
        }
    }
}

/// Runtime section of the run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Parameter precision, `f32` unless a run asks for `f64`
    #[serde(default)]
    pub precision: Precision,
    /// `cpu` or `cuda:<ordinal>`
    #[serde(default = "default_device")]
    pub device: String,
    /// Log level filter applied to the env_logger backend
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seed for weight initialisation, batch shuffling and search trials
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_seed() -> u64 {
    123
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            precision: Precision::F32,
            device: default_device(),
            log_level: default_log_level(),
            seed: default_seed(),
        }
    }
}

/// Resolved runtime: the device and dtype every tensor is created with
#[derive(Debug, Clone)]
pub struct Runtime {
    pub device: Device,
    pub dtype: DType,
    pub seed: u64,
}

impl Runtime {
    /// CPU, single precision
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            seed: default_seed(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let device = match config.device.as_str() {
            "cpu" => Device::Cpu,
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .and_then(|o| o.parse::<usize>().ok())
                    .ok_or_else(|| {
                        QjetError::Configuration(format!("unknown device '{}'", other))
                    })?;
                Device::new_cuda(ordinal)?
            }
        };

        Ok(Self {
            device,
            dtype: config.precision.dtype(),
            seed: config.seed,
        })
    }

    /// Log the device the run is going to use
    pub fn describe(&self) {
        let name = if self.device.is_cpu() { "cpu" } else { "cuda" };
        log::info!("Device: {} | dtype: {:?} | seed: {}", name, self.dtype, self.seed);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::cpu()
    }
}

/// Initialise the logger with an explicit level filter.
///
/// Repeated calls are harmless; only the first one installs the backend.
pub fn init_logging(level: &str) -> Result<()> {
    let filter: log::LevelFilter = level
        .parse()
        .map_err(|_| QjetError::Configuration(format!("unknown log level '{}'", level)))?;

    let _ = env_logger::Builder::new()
        .filter_level(filter)
        .format_timestamp_secs()
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_dtype() {
        assert_eq!(Precision::F32.dtype(), DType::F32);
        assert_eq!(Precision::F64.dtype(), DType::F64);
    }

    #[test]
    fn test_runtime_from_default_config() {
        let runtime = Runtime::from_config(&RuntimeConfig::default()).unwrap();
        assert!(runtime.device.is_cpu());
        assert_eq!(runtime.dtype, DType::F32);
        assert_eq!(runtime.seed, 123);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let config = RuntimeConfig {
            device: "tpu".to_string(),
            ..Default::default()
        };
        assert!(Runtime::from_config(&config).is_err());
    }

    #[test]
    fn test_init_logging_levels() {
        assert!(init_logging("warn").is_ok());
        assert!(init_logging("debug").is_ok());
        assert!(init_logging("chatty").is_err());
    }
}
