//! Stream decoders.
//!
//! Each modality stream owns a [`StreamDecoder`]: an autoregressive
//! transformer decoder cross-attending to that stream's encoder output.
//! Besides the symbol logits it produces a *transform* readout — a
//! cross-attention over the stream's role-model hidden sequence — which
//! the fusion network consumes alongside the symbol distributions.

use candle_core::{IndexOp, Tensor};
use candle_nn::{ops::softmax, LayerNorm, Linear, Module, VarBuilder};

use super::attention::MultiHeadedAttention;
use super::embed::TokenEmbed;
use super::layers::DecoderLayer;
use super::mask::subsequent_mask;
use crate::Result;

/// Autoregressive decoder for one modality stream.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    embed: TokenEmbed,
    decoders: Vec<DecoderLayer>,
    after_norm: LayerNorm,
    output_layer: Linear,
    rm_attn: MultiHeadedAttention,
}

impl StreamDecoder {
    pub fn new(
        odim: usize,
        adim: usize,
        aheads: usize,
        units: usize,
        num_blocks: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut decoders = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            decoders.push(DecoderLayer::new(
                adim,
                aheads,
                units,
                vb.pp(format!("decoders.{i}")),
            )?);
        }
        Ok(Self {
            embed: TokenEmbed::new(odim, adim, vb.pp("embed"))?,
            decoders,
            after_norm: candle_nn::layer_norm(adim, 1e-12, vb.pp("after_norm"))?,
            output_layer: candle_nn::linear(adim, odim, vb.pp("output_layer"))?,
            rm_attn: MultiHeadedAttention::new(aheads, adim, vb.pp("rm_attn"))?,
        })
    }

    /// Full-sequence forward pass (training).
    ///
    /// - `ys_in`: `[B, L]` u32 symbol ids (start symbol prepended)
    /// - `ys_mask`: `[B, L, L]` u8 target mask
    /// - `memory`: stream encoder output `[B, T, adim]`
    /// - `memory_mask`: optional `[B, 1, T]` u8 validity mask
    /// - `rm_memory`: role-model encoder output `[B, T, adim]`
    ///
    /// Returns `(logits [B, L, odim], transform [B, L, adim])`.
    pub fn forward(
        &self,
        ys_in: &Tensor,
        ys_mask: &Tensor,
        memory: &Tensor,
        memory_mask: Option<&Tensor>,
        rm_memory: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let mut h = self.embed.forward(ys_in)?;
        for layer in &self.decoders {
            h = layer.forward(&h, Some(ys_mask), memory, memory_mask)?;
        }
        let h = self.after_norm.forward(&h)?;
        let transform = self.rm_attn.forward(&h, rm_memory, rm_memory, None)?;
        let logits = self.output_layer.forward(&h)?;
        Ok((logits, transform))
    }

    /// One-step forward for incremental decoding.
    ///
    /// The mask is derived from the current partial length only; the full
    /// history is re-attended each step.
    ///
    /// - `ys`: `[1, L]` u32 symbol history (start symbol first)
    ///
    /// Returns `(probs [1, odim] — softmax over symbols at the last
    /// position, transform [1, adim])`.
    pub fn recognize_step(
        &self,
        ys: &Tensor,
        memory: &Tensor,
        rm_memory: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let len = ys.dim(1)?;
        let ys_mask = subsequent_mask(len, ys.device())?.unsqueeze(0)?;
        let (logits, transform) = self.forward(ys, &ys_mask, memory, None, rm_memory)?;
        let last_logits = logits.i((.., len - 1, ..))?; // [1, odim]
        let probs = softmax(&last_logits, candle_core::D::Minus1)?;
        let last_transform = transform.i((.., len - 1, ..))?; // [1, adim]
        Ok((probs, last_transform))
    }

    /// Record cached attentions (per-block self/source + transform readout).
    pub fn collect_attentions(
        &self,
        prefix: &str,
        out: &mut std::collections::HashMap<String, Tensor>,
    ) {
        for (i, layer) in self.decoders.iter().enumerate() {
            layer.collect_attentions(&format!("{prefix}.decoders.{i}"), out);
        }
        if let Some(attn) = self.rm_attn.last_attention() {
            out.insert(format!("{prefix}.rm_attn"), attn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::target_mask;
    use candle_core::{DType, Device};

    fn small_decoder(dev: &Device) -> StreamDecoder {
        let vb = VarBuilder::zeros(DType::F32, dev);
        StreamDecoder::new(11, 8, 2, 16, 1, vb.pp("dec")).unwrap()
    }

    #[test]
    fn test_decoder_forward_shapes() {
        let dev = Device::Cpu;
        let dec = small_decoder(&dev);
        let ys = Tensor::from_vec(vec![10u32, 3, 4], (1, 3), &dev).unwrap();
        let ys_mask = target_mask(&[3], 3, &dev).unwrap();
        let mem = Tensor::randn(0f32, 1.0, (1, 7, 8), &dev).unwrap();
        let rm = Tensor::randn(0f32, 1.0, (1, 7, 8), &dev).unwrap();
        let (logits, transform) = dec.forward(&ys, &ys_mask, &mem, None, &rm).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 11]);
        assert_eq!(transform.dims(), &[1, 3, 8]);
    }

    #[test]
    fn test_recognize_step_returns_distribution() {
        let dev = Device::Cpu;
        let dec = small_decoder(&dev);
        let ys = Tensor::from_vec(vec![10u32, 3], (1, 2), &dev).unwrap();
        let mem = Tensor::randn(0f32, 1.0, (1, 5, 8), &dev).unwrap();
        let rm = Tensor::randn(0f32, 1.0, (1, 5, 8), &dev).unwrap();
        let (probs, transform) = dec.recognize_step(&ys, &mem, &rm).unwrap();
        assert_eq!(probs.dims(), &[1, 11]);
        assert_eq!(transform.dims(), &[1, 8]);
        let sum: f32 = probs.sum_all().unwrap().to_scalar().unwrap();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
