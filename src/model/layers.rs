//! Transformer layer types shared by the stream encoders and decoders.
//!
//! - [`EncoderLayer`] — pre-norm self-attention + feed-forward
//! - [`DecoderLayer`] — pre-norm self-attention + source attention + feed-forward
//!
//! Both expect a final `LayerNorm` at the stack level (the encoders and
//! decoders own it).

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::MultiHeadedAttention;
use crate::Result;

/// Position-wise feed-forward: `Linear → ReLU → Linear`.
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
}

impl PositionwiseFeedForward {
    pub fn new(adim: usize, units: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_1: candle_nn::linear(adim, units, vb.pp("w_1"))?,
            w_2: candle_nn::linear(units, adim, vb.pp("w_2"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.w_2.forward(&self.w_1.forward(xs)?.relu()?)?)
    }
}

/// Pre-norm transformer encoder layer.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl EncoderLayer {
    pub fn new(adim: usize, aheads: usize, units: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadedAttention::new(aheads, adim, vb.pp("self_attn"))?,
            feed_forward: PositionwiseFeedForward::new(adim, units, vb.pp("feed_forward"))?,
            norm1: candle_nn::layer_norm(adim, 1e-12, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(adim, 1e-12, vb.pp("norm2"))?,
        })
    }

    /// Forward pass.
    ///
    /// - `xs`: `[B, T, adim]`
    /// - `mask`: optional u8 validity mask `[B, 1, T]`
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let h = self.norm1.forward(xs)?;
        let h = (xs + self.self_attn.forward(&h, &h, &h, mask)?)?;

        let ff = self.feed_forward.forward(&self.norm2.forward(&h)?)?;
        Ok((h + ff)?)
    }

    /// Record this layer's cached attention under `prefix`.
    pub fn collect_attentions(
        &self,
        prefix: &str,
        out: &mut std::collections::HashMap<String, Tensor>,
    ) {
        if let Some(attn) = self.self_attn.last_attention() {
            out.insert(format!("{prefix}.self_attn"), attn);
        }
    }
}

/// Pre-norm transformer decoder layer with source attention.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: MultiHeadedAttention,
    src_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl DecoderLayer {
    pub fn new(adim: usize, aheads: usize, units: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadedAttention::new(aheads, adim, vb.pp("self_attn"))?,
            src_attn: MultiHeadedAttention::new(aheads, adim, vb.pp("src_attn"))?,
            feed_forward: PositionwiseFeedForward::new(adim, units, vb.pp("feed_forward"))?,
            norm1: candle_nn::layer_norm(adim, 1e-12, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(adim, 1e-12, vb.pp("norm2"))?,
            norm3: candle_nn::layer_norm(adim, 1e-12, vb.pp("norm3"))?,
        })
    }

    /// Forward pass.
    ///
    /// - `tgt`: `[B, L, adim]`
    /// - `tgt_mask`: optional u8 mask `[B, L, L]` (validity ∧ subsequent)
    /// - `memory`: encoder output `[B, T, adim]`
    /// - `memory_mask`: optional u8 validity mask `[B, 1, T]`
    pub fn forward(
        &self,
        tgt: &Tensor,
        tgt_mask: Option<&Tensor>,
        memory: &Tensor,
        memory_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let h = self.norm1.forward(tgt)?;
        let h = (tgt + self.self_attn.forward(&h, &h, &h, tgt_mask)?)?;

        let q = self.norm2.forward(&h)?;
        let h = (h + self.src_attn.forward(&q, memory, memory, memory_mask)?)?;

        let ff = self.feed_forward.forward(&self.norm3.forward(&h)?)?;
        Ok((h + ff)?)
    }

    /// Record this layer's cached attentions under `prefix`.
    pub fn collect_attentions(
        &self,
        prefix: &str,
        out: &mut std::collections::HashMap<String, Tensor>,
    ) {
        if let Some(attn) = self.self_attn.last_attention() {
            out.insert(format!("{prefix}.self_attn"), attn);
        }
        if let Some(attn) = self.src_attn.last_attention() {
            out.insert(format!("{prefix}.src_attn"), attn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_encoder_layer_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let layer = EncoderLayer::new(8, 2, 16, vb.pp("layer")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &dev).unwrap();
        let y = layer.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[2, 5, 8]);
    }

    #[test]
    fn test_decoder_layer_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let layer = DecoderLayer::new(8, 2, 16, vb.pp("layer")).unwrap();
        let tgt = Tensor::randn(0f32, 1.0, (1, 3, 8), &dev).unwrap();
        let mem = Tensor::randn(0f32, 1.0, (1, 7, 8), &dev).unwrap();
        let tgt_mask = crate::model::mask::target_mask(&[3], 3, &dev).unwrap();
        let y = layer.forward(&tgt, Some(&tgt_mask), &mem, None).unwrap();
        assert_eq!(y.dims(), &[1, 3, 8]);
    }

    #[test]
    fn test_decoder_layer_collects_two_attentions() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let layer = DecoderLayer::new(8, 2, 16, vb.pp("layer")).unwrap();
        let tgt = Tensor::randn(0f32, 1.0, (1, 3, 8), &dev).unwrap();
        let mem = Tensor::randn(0f32, 1.0, (1, 7, 8), &dev).unwrap();
        layer.forward(&tgt, None, &mem, None).unwrap();

        let mut map = std::collections::HashMap::new();
        layer.collect_attentions("decoders.0", &mut map);
        assert!(map.contains_key("decoders.0.self_attn"));
        assert!(map.contains_key("decoders.0.src_attn"));
    }
}
