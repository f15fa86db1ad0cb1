//! Stream encoders.
//!
//! Four instances share [`StreamEncoder`]: the audio stream, both
//! role-model streams, and the CTC re-encoders. [`VideoEncoder`] wraps a
//! fifth instance and first aligns the video frame rate to the audio
//! stream. Every encoder returns `(hidden, derived validity mask)`.

use candle_core::Tensor;
use candle_nn::{LayerNorm, Module, VarBuilder};

use super::embed::FeatureEmbed;
use super::layers::EncoderLayer;
use super::mask::valid_mask;
use crate::config::InputLayer;
use crate::Result;

/// Transformer encoder over one padded feature stream.
#[derive(Debug, Clone)]
pub struct StreamEncoder {
    embed: FeatureEmbed,
    encoders: Vec<EncoderLayer>,
    after_norm: LayerNorm,
}

impl StreamEncoder {
    pub fn new(
        idim: usize,
        adim: usize,
        aheads: usize,
        units: usize,
        num_blocks: usize,
        input_layer: InputLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embed = FeatureEmbed::new(input_layer, idim, adim, vb.pp("embed"))?;
        let mut encoders = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            encoders.push(EncoderLayer::new(
                adim,
                aheads,
                units,
                vb.pp(format!("encoders.{i}")),
            )?);
        }
        Ok(Self {
            embed,
            encoders,
            after_norm: candle_nn::layer_norm(adim, 1e-12, vb.pp("after_norm"))?,
        })
    }

    /// Encode `xs: [B, T, idim]` into `([B, T', adim], mask')`.
    ///
    /// The mask is passed through for length-preserving input layers and
    /// re-derived from the per-entry valid lengths after subsampling.
    pub fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let t_in = xs.dim(1)?;
        let h = self.embed.forward(xs)?;
        let t_out = h.dim(1)?;

        let mask = match mask {
            Some(m) if t_out != t_in => Some(self.subsample_mask(m, t_out)?),
            Some(m) => Some(m.clone()),
            None => None,
        };

        let mut h = h;
        for layer in &self.encoders {
            h = layer.forward(&h, mask.as_ref())?;
        }
        Ok((self.after_norm.forward(&h)?, mask))
    }

    /// Rebuild a `[B, 1, T']` validity mask from per-entry valid lengths.
    fn subsample_mask(&self, mask: &Tensor, t_out: usize) -> Result<Tensor> {
        let sums = mask.to_dtype(candle_core::DType::F32)?.sum(2)?; // [B, 1]
        let lens: Vec<f32> = sums.flatten_all()?.to_vec1()?;
        let lens: Vec<usize> = lens
            .iter()
            .map(|&l| self.embed.output_len(l as usize))
            .collect();
        Ok(valid_mask(&lens, t_out, mask.device())?)
    }

    /// Record the cached attention of every block under `prefix`.
    pub fn collect_attentions(
        &self,
        prefix: &str,
        out: &mut std::collections::HashMap<String, Tensor>,
    ) {
        for (i, layer) in self.encoders.iter().enumerate() {
            layer.collect_attentions(&format!("{prefix}.encoders.{i}"), out);
        }
    }
}

/// Video stream encoder with frame-rate alignment.
///
/// Video features arrive at their own frame rate; before encoding, the
/// sequence is resampled to the audio stream's length by nearest-index
/// selection so all streams share one time base.
#[derive(Debug, Clone)]
pub struct VideoEncoder {
    inner: StreamEncoder,
}

impl VideoEncoder {
    pub fn new(
        idim: usize,
        adim: usize,
        aheads: usize,
        units: usize,
        num_blocks: usize,
        input_layer: InputLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            inner: StreamEncoder::new(idim, adim, aheads, units, num_blocks, input_layer, vb)?,
        })
    }

    /// Encode `xs: [B, Tv, idim]`, first aligned to `audio_len` frames.
    pub fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        audio_len: usize,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let aligned = align_to(xs, audio_len)?;
        self.inner.forward(&aligned, mask)
    }

    /// See [`StreamEncoder::collect_attentions`].
    pub fn collect_attentions(
        &self,
        prefix: &str,
        out: &mut std::collections::HashMap<String, Tensor>,
    ) {
        self.inner.collect_attentions(prefix, out);
    }
}

/// Resample `xs: [B, T, D]` to `target_len` frames by nearest index.
fn align_to(xs: &Tensor, target_len: usize) -> Result<Tensor> {
    let t = xs.dim(1)?;
    if t == target_len {
        return Ok(xs.clone());
    }
    let idx: Vec<u32> = (0..target_len)
        .map(|j| ((j * t) / target_len) as u32)
        .collect();
    let idx = Tensor::from_vec(idx, target_len, xs.device())?;
    Ok(xs.index_select(&idx, 1)?)
}
