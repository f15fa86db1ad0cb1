//! Multi-head scaled dot-product attention.
//!
//! One implementation serves encoder self-attention, decoder self/source
//! attention, and the role-model transform readout. Each instance caches
//! the attention weights of its most recent forward pass behind
//! [`MultiHeadedAttention::last_attention`] so the model can collect them
//! for visualization without scanning module internals.

use std::cell::RefCell;

use candle_core::{Module, Tensor};
use candle_nn::{ops::softmax, Linear, VarBuilder};

use super::mask::additive_mask;
use crate::Result;

/// Multi-head attention with cached weights.
#[derive(Debug, Clone)]
pub struct MultiHeadedAttention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_out: Linear,
    h: usize,
    d_k: usize,
    attn: RefCell<Option<Tensor>>,
}

impl MultiHeadedAttention {
    pub fn new(n_head: usize, n_feat: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_q: candle_nn::linear(n_feat, n_feat, vb.pp("linear_q"))?,
            linear_k: candle_nn::linear(n_feat, n_feat, vb.pp("linear_k"))?,
            linear_v: candle_nn::linear(n_feat, n_feat, vb.pp("linear_v"))?,
            linear_out: candle_nn::linear(n_feat, n_feat, vb.pp("linear_out"))?,
            h: n_head,
            d_k: n_feat / n_head,
            attn: RefCell::new(None),
        })
    }

    /// Attention weights `[B, H, Lq, Lk]` from the most recent forward pass.
    pub fn last_attention(&self) -> Option<Tensor> {
        self.attn.borrow().clone()
    }

    /// Forward pass.
    ///
    /// - `query`: `[B, Lq, D]`
    /// - `key`, `value`: `[B, Lk, D]`
    /// - `mask`: optional u8 validity mask, `[B, 1, Lk]` or `[B, Lq, Lk]`
    ///
    /// Returns `[B, Lq, D]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, l_q, _d) = query.dims3()?;
        let l_k = key.dim(1)?;

        // Project and split heads: [B, L, D] → [B, H, L, d_k]
        let q = self
            .linear_q
            .forward(query)?
            .reshape((b, l_q, self.h, self.d_k))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .linear_k
            .forward(key)?
            .reshape((b, l_k, self.h, self.d_k))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .linear_v
            .forward(value)?
            .reshape((b, l_k, self.h, self.d_k))?
            .transpose(1, 2)?
            .contiguous()?;

        // Scores: [B, H, Lq, Lk]
        let scale = 1.0 / (self.d_k as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let scores = match mask {
            Some(m) => {
                // [B, 1|Lq, Lk] → [B, 1, 1|Lq, Lk], broadcast over heads
                let add = additive_mask(&m.unsqueeze(1)?, scores.dtype())?;
                scores.broadcast_add(&add)?
            }
            None => scores,
        };

        let attn = softmax(&scores, candle_core::D::Minus1)?;
        *self.attn.borrow_mut() = Some(attn.clone());

        // [B, H, Lq, d_k] → [B, Lq, H*d_k]
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, l_q, self.h * self.d_k))?;
        Ok(self.linear_out.forward(&out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_attention_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = MultiHeadedAttention::new(2, 8, vb.pp("attn")).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 3, 8), &dev).unwrap();
        let kv = Tensor::randn(0f32, 1.0, (1, 5, 8), &dev).unwrap();
        let out = attn.forward(&q, &kv, &kv, None).unwrap();
        assert_eq!(out.dims(), &[1, 3, 8]);
    }

    #[test]
    fn test_attention_caches_weights() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = MultiHeadedAttention::new(2, 8, vb.pp("attn")).unwrap();
        assert!(attn.last_attention().is_none());

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &dev).unwrap();
        attn.forward(&x, &x, &x, None).unwrap();
        let weights = attn.last_attention().unwrap();
        assert_eq!(weights.dims(), &[1, 2, 4, 4]);
    }

    #[test]
    fn test_attention_mask_zeroes_padding() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let attn = MultiHeadedAttention::new(1, 4, vb.pp("attn")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 4), &dev).unwrap();
        let mask = crate::model::mask::valid_mask(&[2], 3, &dev).unwrap();
        attn.forward(&x, &x, &x, Some(&mask)).unwrap();
        let weights: Vec<f32> = attn
            .last_attention()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // Every query row: weight on the padded key (index 2) is ~0.
        for row in weights.chunks(3) {
            assert!(row[2] < 1e-6);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }
}
