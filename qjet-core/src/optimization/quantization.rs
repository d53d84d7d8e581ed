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

//! Quantizer descriptors and quantization-aware forward passes
//!
//! A single bit-width selects the quantizer family used for weights, biases
//! and activations: 1 bit is binary, 2 bits is ternary and anything wider is
//! a fixed-point grid. Descriptors render to the strings the HLS toolchain
//! expects, and [`QuantizerSpec::quantize`] simulates the reduced precision
//! during training with a straight-through gradient.

use crate::{QjetError, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Activation functions available to the network builders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Elu,
    Tanh,
    Sigmoid,
    Linear,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Elu => "elu",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::Linear => "linear",
        }
    }

    /// Activations whose output is never negative quantize onto an unsigned grid
    pub fn is_non_negative(&self) -> bool {
        matches!(self, Self::Relu | Self::Sigmoid)
    }

    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Relu => xs.relu()?,
            Self::Elu => xs.elu(1.0)?,
            Self::Tanh => xs.tanh()?,
            Self::Sigmoid => candle_nn::ops::sigmoid(xs)?,
            Self::Linear => xs.clone(),
        };
        Ok(out)
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = QjetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(Self::Relu),
            "elu" => Ok(Self::Elu),
            "tanh" => Ok(Self::Tanh),
            "sigmoid" => Ok(Self::Sigmoid),
            "linear" | "none" => Ok(Self::Linear),
            other => Err(QjetError::Configuration(format!(
                "unknown activation '{}'",
                other
            ))),
        }
    }
}

/// Weight/bias quantizer family selected by the bit-width
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuantizerSpec {
    /// 1-bit: values in {-alpha, +alpha}
    Binary { alpha: f64 },
    /// 2-bit: values in {-alpha, 0, +alpha}
    Ternary { alpha: f64 },
    /// Signed fixed point with `integer` integer bits out of `bits`
    QuantizedBits { bits: u8, integer: u8, alpha: f64 },
}

impl QuantizerSpec {
    /// Pick the quantizer for a bit-width
    pub fn from_bits(nbits: u8) -> Result<Self> {
        match nbits {
            0 => Err(QjetError::UnsupportedQuantization(nbits)),
            1 => Ok(Self::Binary { alpha: 1.0 }),
            2 => Ok(Self::Ternary { alpha: 1.0 }),
            bits => Ok(Self::QuantizedBits {
                bits,
                integer: 0,
                alpha: 1.0,
            }),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Self::Binary { .. } => 1,
            Self::Ternary { .. } => 2,
            Self::QuantizedBits { bits, .. } => *bits,
        }
    }

    /// Number of distinct representable values
    pub fn levels(&self) -> usize {
        match self {
            Self::Binary { .. } => 2,
            Self::Ternary { .. } => 3,
            Self::QuantizedBits { bits, .. } => 1usize << *bits,
        }
    }

    /// Quantize `xs` in the forward pass while letting gradients through
    /// unchanged.
    pub fn quantize(&self, xs: &Tensor) -> Result<Tensor> {
        let q = self.quantize_values(xs)?;
        straight_through(xs, &q)
    }

    /// Forward-only quantization, no gradient path
    pub fn quantize_values(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let q = match *self {
            Self::Binary { alpha } => xs.ge(0.0)?.to_dtype(dtype)?.affine(2.0 * alpha, -alpha)?,
            Self::Ternary { alpha } => {
                let threshold = alpha / 2.0;
                let pos = xs.gt(threshold)?.to_dtype(dtype)?;
                let neg = xs.lt(-threshold)?.to_dtype(dtype)?;
                (pos - neg)?.affine(alpha, 0.0)?
            }
            Self::QuantizedBits {
                bits,
                integer,
                alpha,
            } => {
                if integer >= bits {
                    return Err(QjetError::Configuration(format!(
                        "quantized_bits({}, {}) leaves no sign bit",
                        bits, integer
                    )));
                }
                let scale = 2f64.powi(bits as i32 - 1 - integer as i32);
                let max_code = 2f64.powi(bits as i32 - 1);
                xs.affine(scale, 0.0)?
                    .round()?
                    .clamp(-max_code, max_code - 1.0)?
                    .affine(alpha / scale, 0.0)?
            }
        };
        Ok(q)
    }

    /// Mean squared error introduced by quantizing `xs`
    pub fn quantization_error(&self, xs: &Tensor) -> Result<f64> {
        let q = self.quantize_values(xs)?;
        let mse = (q - xs)?
            .sqr()?
            .mean_all()?
            .to_dtype(candle_core::DType::F64)?
            .to_scalar::<f64>()?;
        Ok(mse)
    }
}

impl fmt::Display for QuantizerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary { alpha } => write!(f, "binary(alpha={})", alpha),
            Self::Ternary { alpha } => write!(f, "ternary(alpha={})", alpha),
            Self::QuantizedBits {
                bits,
                integer,
                alpha,
            } => write!(f, "quantized_bits({}, {}, alpha={})", bits, integer, alpha),
        }
    }
}

/// Activation followed by output quantization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizedActivation {
    pub activation: Activation,
    pub bits: u8,
}

impl QuantizedActivation {
    pub fn new(activation: Activation, bits: u8) -> Result<Self> {
        if bits == 0 {
            return Err(QjetError::UnsupportedQuantization(bits));
        }
        Ok(Self { activation, bits })
    }

    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let activated = self.activation.apply(xs)?;
        let q = if self.activation.is_non_negative() {
            let scale = 2f64.powi(self.bits as i32);
            activated
                .affine(scale, 0.0)?
                .round()?
                .clamp(0.0, scale - 1.0)?
                .affine(1.0 / scale, 0.0)?
        } else {
            let spec = QuantizerSpec::QuantizedBits {
                bits: self.bits.max(2),
                integer: 0,
                alpha: 1.0,
            };
            spec.quantize_values(&activated)?
        };
        straight_through(&activated, &q)
    }
}

impl fmt::Display for QuantizedActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quantized_{}({}, 0)", self.activation, self.bits)
    }
}

/// Format a bit-width as the weight quantizer string used by the synthesis flow
pub fn format_quantizer(nbits: u8) -> Result<String> {
    Ok(QuantizerSpec::from_bits(nbits)?.to_string())
}

/// Format an activation as its quantized counterpart
pub fn format_qactivation(activation: Activation, nbits: u8) -> Result<String> {
    Ok(QuantizedActivation::new(activation, nbits)?.to_string())
}

/// `x + stopgrad(q - x)`: forward value `q`, gradient of the identity
fn straight_through(xs: &Tensor, q: &Tensor) -> Result<Tensor> {
    let delta = q.sub(xs)?.detach();
    Ok(xs.add(&delta)?)
}
