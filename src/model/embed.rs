//! Input layers and positional encoding for the stream encoders/decoders.
//!
//! ```text
//! Linear input:  Linear(idim, adim) → LayerNorm → ×√adim + sinusoidal PE
//! Conv2d input:  Conv2d(1, adim, 3, s=2) → ReLU → Conv2d(adim, adim, 3, s=2)
//!                → ReLU → Linear(flatten) → ×√adim + sinusoidal PE   (T/4)
//! Token input:   Embedding(odim, adim) → ×√adim + sinusoidal PE
//! ```
//!
//! The PE table is computed on the fly — no learnable parameters.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};

use super::mask::conv2d_subsampled_len;
use crate::config::InputLayer;
use crate::Result;

/// Scaled sinusoidal positional encoding.
///
/// The input is scaled by `√d_model` before the encoding is added.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    d_model: usize,
    xscale: f64,
}

impl PositionalEncoding {
    pub fn new(d_model: usize) -> Self {
        Self {
            d_model,
            xscale: (d_model as f64).sqrt(),
        }
    }

    /// Encoding table `[1, size, d_model]` for a sequence of `size` steps.
    pub fn table(&self, size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
        let d = self.d_model;
        let half_d = d / 2;
        let mut data = vec![0f32; size * d];
        for pos in 0..size {
            for i in 0..half_d {
                let angle = pos as f64 / 10000f64.powf(2.0 * i as f64 / d as f64);
                data[pos * d + 2 * i] = angle.sin() as f32;
                data[pos * d + 2 * i + 1] = angle.cos() as f32;
            }
        }
        Ok(Tensor::from_vec(data, (1, size, d), device)?.to_dtype(dtype)?)
    }

    /// Scale `xs` by `√d_model` and add the positional encoding.
    ///
    /// `xs`: `[B, T, d_model]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, t, _d) = xs.dims3()?;
        let pe = self.table(t, xs.dtype(), xs.device())?;
        Ok(((xs * self.xscale)?.broadcast_add(&pe))?)
    }
}

/// Feature input layer: projects raw stream features to the attention width.
#[derive(Debug, Clone)]
pub enum FeatureEmbed {
    Linear {
        linear: Linear,
        norm: LayerNorm,
        pos: PositionalEncoding,
    },
    Conv2d {
        conv1: Conv2d,
        conv2: Conv2d,
        out: Linear,
        pos: PositionalEncoding,
    },
}

impl FeatureEmbed {
    pub fn new(kind: InputLayer, idim: usize, adim: usize, vb: VarBuilder) -> Result<Self> {
        let pos = PositionalEncoding::new(adim);
        match kind {
            InputLayer::Linear => {
                let linear = candle_nn::linear(idim, adim, vb.pp("0"))?;
                let norm = candle_nn::layer_norm(adim, 1e-12, vb.pp("1"))?;
                Ok(Self::Linear { linear, norm, pos })
            }
            InputLayer::Conv2d => {
                let cfg = Conv2dConfig {
                    stride: 2,
                    ..Default::default()
                };
                let conv1 = candle_nn::conv2d(1, adim, 3, cfg, vb.pp("conv.0"))?;
                let conv2 = candle_nn::conv2d(adim, adim, 3, cfg, vb.pp("conv.2"))?;
                let freq = conv2d_subsampled_len(idim);
                let out = candle_nn::linear(adim * freq, adim, vb.pp("out.0"))?;
                Ok(Self::Conv2d {
                    conv1,
                    conv2,
                    out,
                    pos,
                })
            }
        }
    }

    /// Project `xs: [B, T, idim]` to `[B, T', adim]` (T' = T, or T/4 for conv).
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear { linear, norm, pos } => {
                let h = norm.forward(&linear.forward(xs)?)?;
                pos.forward(&h)
            }
            Self::Conv2d {
                conv1,
                conv2,
                out,
                pos,
            } => {
                // [B, T, F] → [B, 1, T, F]
                let h = xs.unsqueeze(1)?;
                let h = conv1.forward(&h)?.relu()?;
                let h = conv2.forward(&h)?.relu()?; // [B, adim, T', F']
                let (b, c, t, f) = h.dims4()?;
                // [B, adim, T', F'] → [B, T', adim*F']
                let h = h.transpose(1, 2)?.reshape((b, t, c * f))?;
                pos.forward(&out.forward(&h)?)
            }
        }
    }

    /// Output length for an input of `len` frames.
    pub fn output_len(&self, len: usize) -> usize {
        match self {
            Self::Linear { .. } => len,
            Self::Conv2d { .. } => conv2d_subsampled_len(len),
        }
    }
}

/// Symbol embedding for the stream decoders.
#[derive(Debug, Clone)]
pub struct TokenEmbed {
    emb: Embedding,
    pos: PositionalEncoding,
}

impl TokenEmbed {
    pub fn new(odim: usize, adim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            emb: candle_nn::embedding(odim, adim, vb.pp("0"))?,
            pos: PositionalEncoding::new(adim),
        })
    }

    /// Embed `ys: [B, L]` (u32 ids) to `[B, L, adim]`.
    pub fn forward(&self, ys: &Tensor) -> Result<Tensor> {
        self.pos.forward(&self.emb.forward(ys)?)
    }
}
