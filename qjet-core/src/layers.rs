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

//! Quantization-aware building blocks shared by every network
//!
//! Dense layers keep full-precision parameters and quantize them on the fly
//! in the forward pass, so the optimizer always updates the float shadow
//! weights while the loss sees the reduced-precision ones.

use crate::optimization::quantization::{Activation, QuantizedActivation, QuantizerSpec};
use crate::Result;
use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

/// Dense projection over the last axis with optional weight/bias quantization
#[derive(Debug, Clone)]
pub struct QDense {
    linear: Linear,
    quantizer: Option<QuantizerSpec>,
    in_dim: usize,
    out_dim: usize,
}

impl QDense {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        use_bias: bool,
        quantizer: Option<QuantizerSpec>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = if use_bias {
            candle_nn::linear(in_dim, out_dim, vb)?
        } else {
            candle_nn::linear_no_bias(in_dim, out_dim, vb)?
        };
        Ok(Self {
            linear,
            quantizer,
            in_dim,
            out_dim,
        })
    }

    /// Plain floating point dense layer
    pub fn float(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Self::new(in_dim, out_dim, true, None, vb)
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn is_quantized(&self) -> bool {
        self.quantizer.is_some()
    }

    pub fn layer_type(&self) -> &'static str {
        if self.is_quantized() {
            "QDense"
        } else {
            "Dense"
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match &self.quantizer {
            None => Ok(self.linear.forward(xs)?),
            Some(q) => {
                let weight = q.quantize(self.linear.weight())?;
                let bias = match self.linear.bias() {
                    Some(b) => Some(q.quantize(b)?),
                    None => None,
                };
                Ok(Linear::new(weight, bias).forward(xs)?)
            }
        }
    }
}

/// Activation, quantized when the network runs at reduced precision
#[derive(Debug, Clone, Copy)]
pub enum ActivationLayer {
    Float(Activation),
    Quantized(QuantizedActivation),
}

impl ActivationLayer {
    pub fn new(activation: Activation, nbits: Option<u8>) -> Result<Self> {
        match nbits {
            None => Ok(Self::Float(activation)),
            Some(bits) => Ok(Self::Quantized(QuantizedActivation::new(activation, bits)?)),
        }
    }

    pub fn layer_type(&self) -> &'static str {
        match self {
            Self::Float(_) => "Activation",
            Self::Quantized(_) => "QActivation",
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Float(act) => act.apply(xs),
            Self::Quantized(qact) => qact.apply(xs),
        }
    }
}

/// Mean over the set axis of a `(batch, set, features)` tensor
pub fn global_average_pool(xs: &Tensor) -> Result<Tensor> {
    Ok(xs.mean(1)?)
}

/// Mean over the set axis keeping it with size one
pub fn global_average_pool_keepdim(xs: &Tensor) -> Result<Tensor> {
    Ok(xs.mean_keepdim(1)?)
}

/// Dropout that is only active in training mode
pub fn dropout(xs: &Tensor, rate: f32, train: bool) -> Result<Tensor> {
    if train && rate > 0.0 {
        Ok(candle_nn::ops::dropout(xs, rate)?)
    } else {
        Ok(xs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_qdense_shapes_on_sets() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let quantizer = QuantizerSpec::from_bits(6).unwrap();
        let dense = QDense::new(3, 8, true, Some(quantizer), vb.pp("d")).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (4, 10, 3), &Device::Cpu).unwrap();
        let out = dense.forward(&xs).unwrap();
        assert_eq!(out.dims(), &[4, 10, 8]);
        assert_eq!(dense.layer_type(), "QDense");
        assert_eq!(varmap.all_vars().len(), 2);
    }

    #[test]
    fn test_quantized_weights_lie_on_grid() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dense = QDense::new(1, 1, false, QuantizerSpec::from_bits(1).ok(), vb).unwrap();

        // with a single binary weight the output is +/- the input
        let xs = Tensor::new(&[[0.5f32], [-2.0]], &Device::Cpu).unwrap();
        let out = dense.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out[0][0].abs(), 0.5);
        assert_eq!(out[1][0].abs(), 2.0);
    }

    #[test]
    fn test_global_average_pool() {
        let xs = Tensor::new(&[[[1f32, 2.0], [3.0, 4.0]]], &Device::Cpu).unwrap();
        let pooled = global_average_pool(&xs).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![2.0, 3.0]]);
        let kept = global_average_pool_keepdim(&xs).unwrap();
        assert_eq!(kept.dims(), &[1, 1, 2]);
    }

    #[test]
    fn test_dropout_inactive_at_inference() {
        let xs = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let out = dropout(&xs, 0.5, false).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), xs.to_vec2::<f32>().unwrap());
    }
}
