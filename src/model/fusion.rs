//! Fusion network — merges both modality streams into one prediction.
//!
//! Takes the concatenation of both stream decoders' symbol probability
//! distributions and both role-model transform readouts (width
//! `2·odim + 2·adim`) and maps it through a learned transform to symbol
//! logits of width `odim`. Pure function of its inputs; serves both the
//! full-sequence training path and single-step beam-search scoring.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::Result;

/// Learned gating transform over the concatenated stream features.
#[derive(Debug, Clone)]
pub struct FusionNet {
    proj: Linear,
    in_width: usize,
}

impl FusionNet {
    pub fn new(odim: usize, adim: usize, vb: VarBuilder) -> Result<Self> {
        let in_width = 2 * odim + 2 * adim;
        Ok(Self {
            proj: candle_nn::linear(in_width, odim, vb.pp("proj"))?,
            in_width,
        })
    }

    /// Expected input width (`2·odim + 2·adim`).
    pub fn in_width(&self) -> usize {
        self.in_width
    }

    /// Map concatenated stream features to symbol logits.
    ///
    /// Accepts `[B, L, 2·odim + 2·adim]` (full padded sequence),
    /// `[B, 2·odim + 2·adim]` (a batch of single steps), or an unbatched
    /// `[2·odim + 2·adim]` vector; the output keeps the leading shape
    /// with the last dimension mapped to `odim`.
    pub fn forward(&self, feats: &Tensor) -> Result<Tensor> {
        match feats.rank() {
            1 => {
                let out = self.proj.forward(&feats.unsqueeze(0)?)?;
                Ok(out.squeeze(0)?)
            }
            _ => Ok(self.proj.forward(feats)?),
        }
    }
}
