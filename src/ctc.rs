//! Fused CTC head and prefix scoring.
//!
//! [`Ctc`] projects the concatenation of both re-encoded streams plus the
//! role-model info block onto the vocabulary and provides `loss`,
//! `log_softmax`, and `argmax` over that fused distribution. Blank is
//! symbol 0.
//!
//! [`CtcPrefixScorer`] computes incremental prefix scores during beam
//! search: for a hypothesis `g` and candidate symbol `c`, the probability
//! that the network output starts with `g·c`. The forward variables track
//! blank/non-blank endings per frame and are carried in the hypothesis as
//! an opaque state.

use candle_core::{IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::config::{CtcType, IGNORE_ID};
use crate::{Error, Result};

/// Log-domain zero floor; keeps the recursions finite.
pub(crate) const LOG_ZERO: f32 = -1e10;

/// `log(exp(a) + exp(b))` with a floor at [`LOG_ZERO`].
pub(crate) fn log_add(a: f32, b: f32) -> f32 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi <= LOG_ZERO {
        return LOG_ZERO;
    }
    hi + (1.0 + (lo - hi).exp()).ln()
}

/// Fused CTC head over both stream re-encodings.
#[derive(Debug, Clone)]
pub struct Ctc {
    ctc_lo: Linear,
    odim: usize,
}

impl Ctc {
    /// `adim` is the per-stream width; the fused input is
    /// `audio (adim) + video (adim) + role-model info (2·adim)`.
    pub fn new(odim: usize, adim: usize, ctc_type: CtcType, vb: VarBuilder) -> Result<Self> {
        if ctc_type == CtcType::Warp {
            tracing::warn!("warp-ctc backend not available, falling back to builtin");
        }
        Ok(Self {
            ctc_lo: candle_nn::linear(4 * adim, odim, vb.pp("ctc_lo"))?,
            odim,
        })
    }

    /// Concatenate the streams and project to vocabulary logits `[B, T, odim]`.
    fn fuse(&self, ahs: &Tensor, vhs: &Tensor, rm_info: &Tensor) -> Result<Tensor> {
        let cat = Tensor::cat(&[ahs, vhs, rm_info], candle_core::D::Minus1)?;
        Ok(self.ctc_lo.forward(&cat)?)
    }

    /// Frame-level log-probabilities `[B, T, odim]` of the fused streams.
    pub fn log_softmax(&self, ahs: &Tensor, vhs: &Tensor, rm_info: &Tensor) -> Result<Tensor> {
        let logits = self.fuse(ahs, vhs, rm_info)?;
        Ok(candle_nn::ops::log_softmax(&logits, candle_core::D::Minus1)?)
    }

    /// Frame-level argmax `[B, T]` of the fused streams.
    pub fn argmax(&self, ahs: &Tensor, vhs: &Tensor, rm_info: &Tensor) -> Result<Tensor> {
        let logits = self.fuse(ahs, vhs, rm_info)?;
        Ok(logits.argmax(candle_core::D::Minus1)?)
    }

    /// CTC loss of the fused streams against the padded targets.
    ///
    /// - `hlens`: valid frame count per batch entry
    /// - `ys_pad`: `[B, Lmax]` i64 targets padded with the ignore marker
    ///
    /// Mean-reduced over the batch; returned as a scalar tensor.
    pub fn loss(
        &self,
        ahs: &Tensor,
        vhs: &Tensor,
        rm_info: &Tensor,
        hlens: &[usize],
        ys_pad: &Tensor,
    ) -> Result<Tensor> {
        let log_probs = self.log_softmax(ahs, vhs, rm_info)?;
        let (b, t_max, v) = log_probs.dims3()?;
        if hlens.len() != b {
            return Err(Error::Input(format!(
                "hlens has {} entries for a batch of {b}",
                hlens.len()
            )));
        }
        let targets = ys_pad.to_vec2::<i64>()?;

        let mut total = 0f32;
        for bi in 0..b {
            let frames: Vec<f32> = log_probs.i(bi)?.flatten_all()?.to_vec1()?;
            let t_len = hlens[bi].min(t_max);
            let ys: Vec<u32> = targets[bi]
                .iter()
                .filter(|&&y| y != IGNORE_ID)
                .map(|&y| y as u32)
                .collect();
            total += ctc_forward(&frames, t_len, v, &ys, 0);
        }
        let mean = total / b as f32;
        Ok(Tensor::new(mean, ahs.device())?)
    }

    /// Vocabulary size (including blank).
    pub fn odim(&self) -> usize {
        self.odim
    }
}

/// Negative log-likelihood of `target` under the CTC alignment model.
///
/// `log_probs` is a `[t_len, vocab]` row-major slice; `blank` is the
/// blank symbol id. Log-domain alpha recursion over the blank-extended
/// target.
fn ctc_forward(log_probs: &[f32], t_len: usize, vocab: usize, target: &[u32], blank: u32) -> f32 {
    let l = target.len();
    let ext_len = 2 * l + 1;
    // Extended label at position s: blank for even s, target[s/2] otherwise.
    let ext = |s: usize| -> u32 {
        if s % 2 == 0 {
            blank
        } else {
            target[s / 2]
        }
    };
    if t_len == 0 {
        return -LOG_ZERO;
    }

    let emit = |t: usize, sym: u32| log_probs[t * vocab + sym as usize];

    let mut alpha = vec![LOG_ZERO; ext_len];
    alpha[0] = emit(0, blank);
    if ext_len > 1 {
        alpha[1] = emit(0, ext(1));
    }

    for t in 1..t_len {
        let prev = alpha.clone();
        for s in 0..ext_len {
            let mut acc = prev[s];
            if s >= 1 {
                acc = log_add(acc, prev[s - 1]);
            }
            // Skip transition only between distinct non-blank labels.
            if s >= 2 && ext(s) != blank && ext(s) != ext(s - 2) {
                acc = log_add(acc, prev[s - 2]);
            }
            alpha[s] = acc + emit(t, ext(s));
        }
    }

    let mut ll = alpha[ext_len - 1];
    if ext_len > 1 {
        ll = log_add(ll, alpha[ext_len - 2]);
    }
    -ll
}

/// Forward variables of one prefix: `(non-blank, blank)` ending per frame.
#[derive(Debug, Clone)]
pub struct CtcPrefixState {
    r: Vec<[f32; 2]>,
}

/// Prefix scorer over one utterance's fused CTC log-probabilities.
pub struct CtcPrefixScorer {
    x: Vec<f32>,
    t_len: usize,
    vocab: usize,
    blank: u32,
    eos: u32,
}

impl CtcPrefixScorer {
    /// `log_probs`: `[T, V]` fused frame log-probabilities.
    pub fn new(log_probs: &Tensor, blank: u32, eos: u32) -> Result<Self> {
        let (t_len, vocab) = log_probs.dims2()?;
        let x: Vec<f32> = log_probs.flatten_all()?.to_vec1()?;
        Ok(Self {
            x,
            t_len,
            vocab,
            blank,
            eos,
        })
    }

    /// Vocabulary size of the scored distribution.
    pub fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn emit(&self, t: usize, sym: u32) -> f32 {
        self.x[t * self.vocab + sym as usize]
    }

    /// State of the empty prefix: only all-blank paths are alive.
    pub fn initial_state(&self) -> CtcPrefixState {
        let mut r = vec![[LOG_ZERO; 2]; self.t_len];
        if self.t_len > 0 {
            r[0][1] = self.emit(0, self.blank);
            for t in 1..self.t_len {
                r[t][1] = r[t - 1][1] + self.emit(t, self.blank);
            }
        }
        CtcPrefixState { r }
    }

    /// Cumulative prefix scores for extending `yseq` with each candidate.
    ///
    /// - `yseq`: symbol history including the start symbol
    /// - `cands`: candidate symbol ids, scored in order
    /// - `prev`: the forward state carried by the hypothesis
    ///
    /// Returns `(log prefix scores, per-candidate successor states)`. The
    /// end symbol scores as the probability of the whole prefix ending;
    /// the blank candidate is excluded (scored as log-zero).
    pub fn score(
        &self,
        yseq: &[u32],
        cands: &[u32],
        prev: &CtcPrefixState,
    ) -> (Vec<f32>, Vec<CtcPrefixState>) {
        let t_len = self.t_len;
        let w = cands.len();
        let output_length = yseq.len().saturating_sub(1); // start symbol excluded

        if t_len == 0 || w == 0 {
            let states = vec![CtcPrefixState { r: Vec::new() }; w];
            return (vec![LOG_ZERO; w], states);
        }
        // A prefix longer than the frame count has no alignment left.
        if output_length >= t_len {
            return (vec![LOG_ZERO; w], vec![prev.clone(); w]);
        }

        // r_n/r_b[t*w + i]: prefix + cands[i] ending non-blank / blank at t.
        let mut r_n = vec![LOG_ZERO; t_len * w];
        let mut r_b = vec![LOG_ZERO; t_len * w];
        if output_length == 0 {
            for (i, &c) in cands.iter().enumerate() {
                r_n[i] = self.emit(0, c);
            }
        }

        // r_sum[t] = log(r_prev_n + r_prev_b)
        let r_sum: Vec<f32> = prev.r.iter().map(|rt| log_add(rt[0], rt[1])).collect();

        // Forward probability of the prefix before each candidate label:
        // the blank-ending mass when the candidate repeats the last label.
        let last = *yseq.last().unwrap_or(&self.eos);
        let mut log_phi = vec![0f32; t_len * w];
        for t in 0..t_len {
            for (i, &c) in cands.iter().enumerate() {
                log_phi[t * w + i] = if output_length > 0 && c == last {
                    prev.r[t][1]
                } else {
                    r_sum[t]
                };
            }
        }

        let start = output_length.max(1);
        let mut log_psi: Vec<f32> = (0..w).map(|i| r_n[(start - 1) * w + i]).collect();
        for t in start..t_len {
            let blank_emit = self.emit(t, self.blank);
            for (i, &c) in cands.iter().enumerate() {
                let prev_n = r_n[(t - 1) * w + i];
                let prev_b = r_b[(t - 1) * w + i];
                let phi = log_phi[(t - 1) * w + i];
                r_n[t * w + i] = log_add(prev_n, phi) + self.emit(t, c);
                r_b[t * w + i] = log_add(prev_n, prev_b) + blank_emit;
                log_psi[i] = log_add(log_psi[i], phi + self.emit(t, c));
            }
        }

        for (i, &c) in cands.iter().enumerate() {
            if c == self.eos {
                // Ending here scores the prefix itself.
                log_psi[i] = r_sum[t_len - 1];
            } else if c == self.blank {
                log_psi[i] = LOG_ZERO;
            }
        }

        let states = (0..w)
            .map(|i| CtcPrefixState {
                r: (0..t_len).map(|t| [r_n[t * w + i], r_b[t * w + i]]).collect(),
            })
            .collect();
        (log_psi, states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn uniform_log_probs(t_len: usize, vocab: usize, dev: &Device) -> Tensor {
        let l = (1.0 / vocab as f32).ln();
        Tensor::full(l, (t_len, vocab), dev).unwrap()
    }

    #[test]
    fn test_log_add() {
        let v = log_add(0f32.ln().max(LOG_ZERO), 0.5f32.ln());
        assert!((v - 0.5f32.ln()).abs() < 1e-4);
        let v = log_add(0.25f32.ln(), 0.25f32.ln());
        assert!((v - 0.5f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_forward_single_frame() {
        // T=1, one label: the only path is the label itself.
        let log_probs = vec![0.6f32.ln(), 0.3f32.ln(), 0.1f32.ln()];
        let nll = ctc_forward(&log_probs, 1, 3, &[1], 0);
        assert!((nll - -(0.3f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_forward_two_frames() {
        // T=2, uniform over 3 symbols, one label: paths (b,y), (y,b), (y,y).
        let l = (1.0f32 / 3.0).ln();
        let log_probs = vec![l; 6];
        let nll = ctc_forward(&log_probs, 2, 3, &[1], 0);
        assert!((nll - -(3.0f32 / 9.0).ln()).abs() < 1e-4);
    }

    #[test]
    fn test_ctc_forward_repeated_label_needs_separator() {
        // "aa" within 2 frames is impossible (needs a blank between).
        let l = (1.0f32 / 3.0).ln();
        let log_probs = vec![l; 6];
        let nll = ctc_forward(&log_probs, 2, 3, &[1, 1], 0);
        assert!(nll > 1e9);
    }

    #[test]
    fn test_prefix_scorer_first_expansion() {
        let dev = Device::Cpu;
        // V=3: blank=0, 'a'=1, eos=2; T=2 uniform.
        let scorer = CtcPrefixScorer::new(&uniform_log_probs(2, 3, &dev), 0, 2).unwrap();
        let state = scorer.initial_state();
        let (scores, states) = scorer.score(&[2], &[1, 2, 0], &state);

        // ψ('a') over 2 frames = 4/9 (paths ba, ab, aa, a·eos-symbol).
        assert!((scores[0] - (4.0f32 / 9.0).ln()).abs() < 1e-4);
        // eos candidate: probability of the empty output = bb = 1/9.
        assert!((scores[1] - (1.0f32 / 9.0).ln()).abs() < 1e-4);
        // Blank candidate is excluded.
        assert!(scores[2] <= LOG_ZERO);
        assert_eq!(states.len(), 3);
    }

    #[test]
    fn test_prefix_scorer_second_expansion_ends_sequence() {
        let dev = Device::Cpu;
        let scorer = CtcPrefixScorer::new(&uniform_log_probs(2, 3, &dev), 0, 2).unwrap();
        let init = scorer.initial_state();
        let (_, states) = scorer.score(&[2], &[1], &init);
        // After emitting 'a', ending the sequence scores P(output == "a") = 3/9.
        let (scores, _) = scorer.score(&[2, 1], &[2], &states[0]);
        assert!((scores[0] - (3.0f32 / 9.0).ln()).abs() < 1e-4);
    }

    #[test]
    fn test_ctc_head_shapes() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let ctc = Ctc::new(11, 4, CtcType::Builtin, vb.pp("ctc")).unwrap();
        let ahs = Tensor::randn(0f32, 1.0, (2, 6, 4), &dev).unwrap();
        let vhs = Tensor::randn(0f32, 1.0, (2, 6, 4), &dev).unwrap();
        let rm = Tensor::randn(0f32, 1.0, (2, 6, 8), &dev).unwrap();

        let lp = ctc.log_softmax(&ahs, &vhs, &rm).unwrap();
        assert_eq!(lp.dims(), &[2, 6, 11]);
        let ids = ctc.argmax(&ahs, &vhs, &rm).unwrap();
        assert_eq!(ids.dims(), &[2, 6]);
    }

    #[test]
    fn test_ctc_loss_uniform() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let ctc = Ctc::new(3, 1, CtcType::Builtin, vb.pp("ctc")).unwrap();
        // Zero weights → uniform distribution over 3 symbols.
        let ahs = Tensor::zeros((1, 2, 1), DType::F32, &dev).unwrap();
        let vhs = Tensor::zeros((1, 2, 1), DType::F32, &dev).unwrap();
        let rm = Tensor::zeros((1, 2, 2), DType::F32, &dev).unwrap();
        let ys = Tensor::from_vec(vec![1i64, IGNORE_ID], (1, 2), &dev).unwrap();
        let loss: f32 = ctc
            .loss(&ahs, &vhs, &rm, &[2], &ys)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - -(3.0f32 / 9.0).ln()).abs() < 1e-4);
    }
}
