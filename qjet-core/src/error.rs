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

//! Error handling for qjet

use thiserror::Error;

/// Result type alias for qjet operations
pub type Result<T> = std::result::Result<T, QjetError>;

/// Error types for network construction, training and evaluation
#[derive(Error, Debug)]
pub enum QjetError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Unknown architecture: {name}")]
    UnknownArchitecture { name: String },

    #[error("Unsupported quantization: {0} bits")]
    UnsupportedQuantization(u8),

    #[error("Model loading error: {0}")]
    ModelLoad(String),

    #[error("Tensor operation error: {message}")]
    TensorError { message: String },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Training failed: {reason}")]
    TrainingFailed { reason: String },

    #[error("Search failed: {reason}")]
    SearchFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<candle_core::Error> for QjetError {
    fn from(err: candle_core::Error) -> Self {
        QjetError::TensorError {
            message: format!("Candle error: {}", err),
        }
    }
}

impl From<toml::de::Error> for QjetError {
    fn from(err: toml::de::Error) -> Self {
        QjetError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for QjetError {
    fn from(err: toml::ser::Error) -> Self {
        QjetError::Configuration(err.to_string())
    }
}
