//! Label-smoothing loss for the fused attention branch.
//!
//! KL divergence between the smoothed one-hot target distribution and the
//! predicted log-probabilities. Positions carrying the ignore marker
//! contribute nothing; the loss is normalized by token count or batch
//! size depending on `normalize_length`.

use candle_core::Tensor;
use candle_nn::ops::log_softmax;

use crate::config::IGNORE_ID;
use crate::{Error, Result};

/// Smoothed cross-entropy criterion.
#[derive(Debug, Clone)]
pub struct LabelSmoothingLoss {
    odim: usize,
    smoothing: f64,
    normalize_length: bool,
}

impl LabelSmoothingLoss {
    pub fn new(odim: usize, smoothing: f64, normalize_length: bool) -> Self {
        Self {
            odim,
            smoothing,
            normalize_length,
        }
    }

    /// Compute the loss.
    ///
    /// - `logits`: `[B, L, odim]`
    /// - `targets`: `[B, L]` i64 symbol ids, padded with the ignore marker
    ///
    /// Returns a scalar tensor.
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (b, l, v) = logits.dims3()?;
        if v != self.odim {
            return Err(Error::Input(format!(
                "logit width {v} does not match vocabulary size {}",
                self.odim
            )));
        }
        let target_ids = targets.to_vec2::<i64>()?;

        let confidence = 1.0 - self.smoothing;
        let off = if v > 1 {
            self.smoothing / (v as f64 - 1.0)
        } else {
            0.0
        };

        // Smoothed target distribution; all-zero rows for ignored positions.
        let mut dist = vec![0f32; b * l * v];
        let mut tokens = 0usize;
        for (bi, row) in target_ids.iter().enumerate() {
            for (li, &tid) in row.iter().enumerate() {
                if tid == IGNORE_ID {
                    continue;
                }
                tokens += 1;
                let base = (bi * l + li) * v;
                for entry in dist.iter_mut().skip(base).take(v) {
                    *entry = off as f32;
                }
                dist[base + tid as usize] = confidence as f32;
            }
        }

        // Σ d·ln d per row is a data-independent constant.
        let mut row_entropy = 0.0;
        if confidence > 0.0 {
            row_entropy += confidence * confidence.ln();
        }
        if off > 0.0 {
            row_entropy += (v as f64 - 1.0) * off * off.ln();
        }
        let const_term = row_entropy * tokens as f64;

        let log_probs = log_softmax(logits, candle_core::D::Minus1)?;
        let dist = Tensor::from_vec(dist, (b, l, v), logits.device())?;
        let cross = (dist * log_probs)?.sum_all()?;

        let denom = if self.normalize_length {
            tokens.max(1) as f64
        } else {
            b as f64
        };
        // KL = Σ d·(ln d − log p) = const − Σ d·log p
        Ok(((cross.neg()? + const_term)? / denom)?)
    }
}
