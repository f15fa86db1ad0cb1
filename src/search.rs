//! CTC/attention joint beam search.
//!
//! Drives autoregressive decoding over fused stream scores:
//!
//! 1. every active hypothesis is scored one step via a [`StepScorer`]
//! 2. an optional [`LanguageModel`] adds weighted token scores
//! 3. with CTC enabled, the top `ctc_beam` candidates are re-scored by the
//!    prefix scorer and combined under a [`CtcAttWeights`] policy
//! 4. the best `beam` expansions per hypothesis are kept, then the global
//!    top `beam` survive the step
//!
//! Hypotheses ending in the end symbol move to the finished set (with the
//! length penalty applied once); decoding stops on `maxlen`, an empty
//! active set, or the end-detection heuristic. An empty result triggers a
//! bounded retry with a relaxed minimum-length ratio on a private copy of
//! the configuration.

use std::any::Any;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::config::RecognizeConfig;
use crate::ctc::{CtcPrefixScorer, CtcPrefixState};
use crate::{Error, Result};

/// Candidate pool ratio for CTC pre-pruning (`ctc_beam = beam × ratio`).
pub const CTC_SCORING_RATIO: f32 = 1.5;

/// End detection: number of recent lengths inspected.
const END_DETECT_WINDOW: usize = 3;

/// End detection: log-probability gap below the global best.
const END_DETECT_GAP: f32 = -10.0;

/// Opaque language-model state, shared between sibling expansions.
pub type LmState = Rc<dyn Any>;

/// External language model collaborator.
pub trait LanguageModel {
    /// Advance the model by one token. `state` is `None` at the first step.
    ///
    /// Returns the successor state and per-symbol log scores.
    fn predict(&self, state: Option<&LmState>, token: u32) -> Result<(LmState, Vec<f32>)>;

    /// Final score added when a hypothesis ends.
    fn final_score(&self, state: Option<&LmState>) -> f32;
}

/// Produces fused log-probability scores for one decode step.
///
/// Implemented by the model over its stream decoders + fusion network;
/// tests drive the search with stub scorers.
pub trait StepScorer {
    /// Output vocabulary size V.
    fn vocab_size(&self) -> usize;

    /// Log-probabilities over V symbols given the symbol history
    /// (start symbol first).
    fn score_step(&self, yseq: &[u32]) -> Result<Vec<f32>>;
}

/// Per-step interpolation policy between attention and CTC scores.
///
/// Given the candidate subset's attention log-scores and incremental CTC
/// log-scores (same order), returns the `(attention, ctc)` weight pair.
/// Weights must be finite.
pub trait CtcAttWeights {
    fn weights(&self, att: &[f32], ctc: &[f32]) -> (f32, f32);
}

/// Adaptive policy: each stream is weighted by its confidence.
///
/// Confidence is `max(s) − logsumexp(s)` (the log of the normalized top
/// probability); the pair is the softmax of the two confidences, so the
/// weights always sum to 1.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveWeights;

impl CtcAttWeights for AdaptiveWeights {
    fn weights(&self, att: &[f32], ctc: &[f32]) -> (f32, f32) {
        let conf = |s: &[f32]| -> f32 {
            if s.is_empty() {
                return 0.0;
            }
            let max = s.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            max - log_sum_exp(s)
        };
        let (ca, cc) = (conf(att), conf(ctc));
        let attw = 1.0 / (1.0 + (cc - ca).exp());
        (attw, 1.0 - attw)
    }
}

/// Fixed interpolation: `(1 − w, w)` for a configured CTC weight.
#[derive(Debug, Clone)]
pub struct FixedWeights {
    pub ctc_weight: f32,
}

impl CtcAttWeights for FixedWeights {
    fn weights(&self, _att: &[f32], _ctc: &[f32]) -> (f32, f32) {
        (1.0 - self.ctc_weight, self.ctc_weight)
    }
}

fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
}

/// One partial or complete output sequence.
///
/// Immutable: expansion goes through [`Hypothesis::with_appended`], which
/// leaves the parent untouched for sibling expansions.
#[derive(Clone)]
pub struct Hypothesis {
    /// Emitted symbol ids, start symbol first.
    pub yseq: Vec<u32>,
    /// Cumulative log-domain score.
    pub score: f32,
    ctc_state: Option<CtcPrefixState>,
    ctc_score: f32,
    lm_state: Option<LmState>,
}

impl Hypothesis {
    fn initial(sos: u32, ctc_state: Option<CtcPrefixState>) -> Self {
        Self {
            yseq: vec![sos],
            score: 0.0,
            ctc_state,
            ctc_score: 0.0,
            lm_state: None,
        }
    }

    /// New hypothesis with `token` appended and `score_delta` added;
    /// CTC/LM state carry over until replaced.
    pub fn with_appended(&self, token: u32, score_delta: f32) -> Self {
        let mut yseq = Vec::with_capacity(self.yseq.len() + 1);
        yseq.extend_from_slice(&self.yseq);
        yseq.push(token);
        Self {
            yseq,
            score: self.score + score_delta,
            ctc_state: self.ctc_state.clone(),
            ctc_score: self.ctc_score,
            lm_state: self.lm_state.clone(),
        }
    }

    fn with_ctc(mut self, state: CtcPrefixState, score: f32) -> Self {
        self.ctc_state = Some(state);
        self.ctc_score = score;
        self
    }

    fn with_lm(mut self, state: LmState) -> Self {
        self.lm_state = Some(state);
        self
    }

    fn with_score_added(mut self, delta: f32) -> Self {
        self.score += delta;
        self
    }

    /// Total log probability.
    pub fn log_prob(&self) -> f32 {
        self.score
    }

    /// Log probability normalized by sequence length.
    pub fn normalized_log_prob(&self) -> f32 {
        self.score / self.yseq.len() as f32
    }
}

impl std::fmt::Debug for Hypothesis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hypothesis")
            .field("yseq", &self.yseq)
            .field("score", &self.score)
            .finish()
    }
}

/// Top-`k` indices of `scores`, descending, ties broken by lower index.
fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    idx.into_iter().take(k).map(|i| (i, scores[i])).collect()
}

/// Repeated-length heuristic over finished hypotheses.
///
/// Fires when, for each of the last [`END_DETECT_WINDOW`] lengths, the
/// best finished hypothesis of that length falls [`END_DETECT_GAP`] below
/// the global best.
fn end_detect(ended: &[Hypothesis], step: usize) -> bool {
    if ended.is_empty() {
        return false;
    }
    let best = ended
        .iter()
        .map(|h| h.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut count = 0;
    for m in 0..END_DETECT_WINDOW {
        if step < m {
            continue;
        }
        let target_len = step - m;
        let best_same = ended
            .iter()
            .filter(|h| h.yseq.len() == target_len)
            .map(|h| h.score)
            .fold(f32::NEG_INFINITY, f32::max);
        if best_same.is_finite() && best_same - best < END_DETECT_GAP {
            count += 1;
        }
    }
    count == END_DETECT_WINDOW
}

/// Beam search driver.
pub struct BeamSearch {
    config: RecognizeConfig,
    weights: Box<dyn CtcAttWeights>,
    char_list: Option<Vec<String>>,
}

impl BeamSearch {
    pub fn new(config: RecognizeConfig) -> Self {
        Self {
            config,
            weights: Box::new(AdaptiveWeights),
            char_list: None,
        }
    }

    /// Replace the CTC/attention weight policy.
    pub fn with_weight_policy(mut self, weights: Box<dyn CtcAttWeights>) -> Self {
        self.weights = weights;
        self
    }

    /// Attach a symbol table for per-step hypothesis logging.
    pub fn with_symbol_table(mut self, char_list: Vec<String>) -> Self {
        self.char_list = Some(char_list);
        self
    }

    /// Render a hypothesis (start symbol dropped) through the symbol table.
    fn render(&self, hyp: &Hypothesis) -> Option<String> {
        let chars = self.char_list.as_ref()?;
        Some(
            hyp.yseq[1..]
                .iter()
                .map(|&id| chars.get(id as usize).map(String::as_str).unwrap_or("<unk>"))
                .collect(),
        )
    }

    /// Decode; returns the n-best finished hypotheses, best first.
    ///
    /// - `n_frames`: encoder frame count, the base for the length bounds
    /// - `ctc`: prefix scorer when CTC joint scoring is enabled
    /// - `lm`: optional language model
    ///
    /// An empty finished set triggers a retry with `minlenratio` lowered
    /// by 0.1 (floored at 0) on a private copy of the configuration; after
    /// a failed attempt at 0 an empty list is returned.
    pub fn recognize(
        &self,
        scorer: &dyn StepScorer,
        n_frames: usize,
        ctc: Option<&CtcPrefixScorer>,
        lm: Option<&dyn LanguageModel>,
    ) -> Result<Vec<Hypothesis>> {
        let v = scorer.vocab_size();
        self.config.validate(v)?;
        if n_frames == 0 {
            return Err(Error::Decode("cannot decode zero encoder frames".into()));
        }
        if let Some(ctc) = ctc {
            if ctc.vocab_size() != v {
                return Err(Error::Decode(format!(
                    "CTC vocabulary ({}) does not match the decoder vocabulary ({v})",
                    ctc.vocab_size()
                )));
            }
        }

        let mut config = self.config.clone();
        loop {
            let nbest = self.search(&config, scorer, n_frames, ctc, lm)?;
            if !nbest.is_empty() {
                info!("total log probability: {}", nbest[0].log_prob());
                info!(
                    "normalized log probability: {}",
                    nbest[0].normalized_log_prob()
                );
                return Ok(nbest);
            }
            if config.minlenratio <= 0.0 {
                warn!("no n-best results even with minlenratio 0");
                return Ok(Vec::new());
            }
            config.minlenratio = (config.minlenratio - 0.1).max(0.0);
            warn!(
                "there is no n-best result, performing recognition again with minlenratio {}",
                config.minlenratio
            );
        }
    }

    fn search(
        &self,
        config: &RecognizeConfig,
        scorer: &dyn StepScorer,
        n_frames: usize,
        ctc: Option<&CtcPrefixScorer>,
        lm: Option<&dyn LanguageModel>,
    ) -> Result<Vec<Hypothesis>> {
        let v = scorer.vocab_size();
        let eos = (v - 1) as u32;
        let beam = config.beam_size;

        let maxlen = if config.maxlenratio == 0.0 {
            n_frames
        } else {
            ((config.maxlenratio * n_frames as f32) as usize).max(1)
        };
        let minlen = (config.minlenratio * n_frames as f32) as usize;
        info!("input lengths: {n_frames}");
        info!("max output length: {maxlen}");
        info!("min output length: {minlen}");

        let ctc_beam = if config.ctc_weight == 1.0 {
            v
        } else {
            v.min((beam as f32 * CTC_SCORING_RATIO) as usize)
        };

        let mut hyps = vec![Hypothesis::initial(eos, ctc.map(|c| c.initial_state()))];
        let mut ended: Vec<Hypothesis> = Vec::new();

        for i in 0..maxlen {
            debug!("position {i}");

            let mut best_kept: Vec<Hypothesis> = Vec::new();
            for hyp in &hyps {
                let local_att = scorer.score_step(&hyp.yseq)?;
                if local_att.len() != v {
                    return Err(Error::Decode(format!(
                        "step scorer returned {} scores for vocabulary {v}",
                        local_att.len()
                    )));
                }

                let last_token = *hyp.yseq.last().unwrap_or(&eos);
                let lm_out = match lm {
                    Some(lm) => Some(lm.predict(hyp.lm_state.as_ref(), last_token)?),
                    None => None,
                };

                let local_scores: Vec<f32> = match &lm_out {
                    Some((_, lm_scores)) => local_att
                        .iter()
                        .zip(lm_scores)
                        .map(|(a, l)| a + config.lm_weight * l)
                        .collect(),
                    None => local_att.clone(),
                };

                if let Some(ctc_scorer) = ctc {
                    // Pre-prune to the ctc_beam best candidates before the
                    // (expensive) prefix rescoring.
                    let presel = if lm.is_some() { &local_scores } else { &local_att };
                    let cands = top_k(presel, ctc_beam);
                    let cand_ids: Vec<u32> = cands.iter().map(|&(c, _)| c as u32).collect();

                    let state = hyp.ctc_state.as_ref().ok_or_else(|| {
                        Error::Decode("hypothesis lost its CTC state".into())
                    })?;
                    let (ctc_scores, ctc_states) =
                        ctc_scorer.score(&hyp.yseq, &cand_ids, state);

                    let att_sel: Vec<f32> =
                        cand_ids.iter().map(|&c| local_att[c as usize]).collect();
                    let ctc_delta: Vec<f32> =
                        ctc_scores.iter().map(|s| s - hyp.ctc_score).collect();
                    let (attw, ctcw) = self.weights.weights(&att_sel, &ctc_delta);
                    if !attw.is_finite() || !ctcw.is_finite() {
                        return Err(Error::Decode(format!(
                            "weight policy returned non-finite weights ({attw}, {ctcw})"
                        )));
                    }

                    let mut combined: Vec<f32> = att_sel
                        .iter()
                        .zip(&ctc_delta)
                        .map(|(a, c)| attw * a + ctcw * c)
                        .collect();
                    if let Some((_, lm_scores)) = &lm_out {
                        for (j, &c) in cand_ids.iter().enumerate() {
                            combined[j] += config.lm_weight * lm_scores[c as usize];
                        }
                    }

                    for (j, delta) in top_k(&combined, beam) {
                        let mut new_hyp = hyp
                            .with_appended(cand_ids[j], delta)
                            .with_ctc(ctc_states[j].clone(), ctc_scores[j]);
                        if let Some((lm_state, _)) = &lm_out {
                            new_hyp = new_hyp.with_lm(lm_state.clone());
                        }
                        best_kept.push(new_hyp);
                    }
                } else {
                    for (token, delta) in top_k(&local_scores, beam) {
                        let mut new_hyp = hyp.with_appended(token as u32, delta);
                        if let Some((lm_state, _)) = &lm_out {
                            new_hyp = new_hyp.with_lm(lm_state.clone());
                        }
                        best_kept.push(new_hyp);
                    }
                }
            }

            // Global pruning across all expansions.
            best_kept.sort_by(|a, b| b.score.total_cmp(&a.score));
            best_kept.truncate(beam);
            hyps = best_kept;
            debug!("number of pruned hypotheses: {}", hyps.len());
            if let Some(text) = hyps.first().and_then(|h| self.render(h)) {
                debug!("best hypo: {text}");
            }

            // Force the end symbol at the last step so every survivor can end.
            if i == maxlen - 1 {
                info!("adding <eos> in the last position in the loop");
                hyps = hyps.iter().map(|h| h.with_appended(eos, 0.0)).collect();
            }

            // Move ended hypotheses (length permitting) to the finished set.
            let mut remained = Vec::new();
            for hyp in hyps {
                if hyp.yseq.last() == Some(&eos) {
                    if hyp.yseq.len() > minlen {
                        let mut done =
                            hyp.with_score_added((i + 1) as f32 * config.penalty);
                        if let Some(lm) = lm {
                            let final_score =
                                config.lm_weight * lm.final_score(done.lm_state.as_ref());
                            done = done.with_score_added(final_score);
                        }
                        ended.push(done);
                    }
                } else {
                    remained.push(hyp);
                }
            }

            if end_detect(&ended, i) && config.maxlenratio == 0.0 {
                info!("end detected at {i}");
                break;
            }

            hyps = remained;
            if hyps.is_empty() {
                info!("no hypothesis, finishing decoding");
                break;
            }
            debug!("remaining hypotheses: {}", hyps.len());
            debug!("number of ended hypotheses: {}", ended.len());
        }

        ended.sort_by(|a, b| b.score.total_cmp(&a.score));
        ended.truncate(config.nbest.min(ended.len()));
        Ok(ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctc::CtcPrefixScorer;
    use candle_core::{Device, Tensor};

    /// Scores from a fixed table keyed by the number of emitted symbols.
    struct StubScorer {
        vocab: usize,
        by_emitted: Vec<Vec<f32>>,
    }

    impl StepScorer for StubScorer {
        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn score_step(&self, yseq: &[u32]) -> Result<Vec<f32>> {
            let emitted = yseq.len() - 1;
            let row = emitted.min(self.by_emitted.len() - 1);
            Ok(self.by_emitted[row].clone())
        }
    }

    /// V=5 stub: content symbols early, the end symbol after two steps.
    fn eos_after_two() -> StubScorer {
        StubScorer {
            vocab: 5,
            by_emitted: vec![
                vec![-1.0, -2.0, -3.0, -4.0, -20.0],
                vec![-2.0, -1.0, -3.0, -4.0, -20.0],
                vec![-20.0, -20.0, -20.0, -20.0, -0.1],
            ],
        }
    }

    #[test]
    fn test_end_to_end_scenario() {
        let config = RecognizeConfig {
            beam_size: 2,
            nbest: 2,
            ctc_weight: 0.0,
            maxlenratio: 1.0, // maxlen = 4 frames
            minlenratio: 0.0,
            ..Default::default()
        };
        let scorer = eos_after_two();
        let nbest = BeamSearch::new(config)
            .recognize(&scorer, 4, None, None)
            .unwrap();

        assert!(!nbest.is_empty());
        let best = &nbest[0];
        assert_eq!(best.yseq.len(), 4);
        assert_eq!(best.yseq[0], 4);
        assert_eq!(*best.yseq.last().unwrap(), 4);
        assert!(best.yseq[1] < 4 && best.yseq[2] < 4);
    }

    #[test]
    fn test_determinism() {
        let config = RecognizeConfig {
            beam_size: 3,
            nbest: 3,
            ctc_weight: 0.0,
            ..Default::default()
        };
        let scorer = eos_after_two();
        let search = BeamSearch::new(config);
        let a = search.recognize(&scorer, 4, None, None).unwrap();
        let b = search.recognize(&scorer, 4, None, None).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.yseq, y.yseq);
            assert_eq!(x.score, y.score);
        }
    }

    #[test]
    fn test_nbest_bounded_and_sorted() {
        let config = RecognizeConfig {
            beam_size: 4,
            nbest: 2,
            ctc_weight: 0.0,
            ..Default::default()
        };
        let scorer = eos_after_two();
        let nbest = BeamSearch::new(config)
            .recognize(&scorer, 6, None, None)
            .unwrap();
        assert!(nbest.len() <= 2);
        for pair in nbest.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_penalty_applied_once_on_ending() {
        // eos is immediately the best symbol.
        let scorer = StubScorer {
            vocab: 3,
            by_emitted: vec![vec![-5.0, -5.0, -0.5]],
        };
        let config = RecognizeConfig {
            beam_size: 1,
            nbest: 1,
            ctc_weight: 0.0,
            penalty: 0.7,
            ..Default::default()
        };
        let nbest = BeamSearch::new(config)
            .recognize(&scorer, 4, None, None)
            .unwrap();
        let best = &nbest[0];
        assert_eq!(best.yseq, vec![2, 2]);
        // Ended at step 0: score = -0.5 + (0 + 1) × 0.7.
        assert!((best.score - (-0.5 + 0.7)).abs() < 1e-6);
    }

    #[test]
    fn test_minlen_is_strict() {
        let scorer = StubScorer {
            vocab: 3,
            by_emitted: vec![vec![-5.0, -5.0, -0.5]],
        };
        // minlen = 2 with 4 frames; a [eos, eos] ending has length 2,
        // which is not > 2, so it must be dropped.
        let config = RecognizeConfig {
            beam_size: 2,
            nbest: 5,
            ctc_weight: 0.0,
            minlenratio: 0.5,
            ..Default::default()
        };
        let nbest = BeamSearch::new(config)
            .recognize(&scorer, 4, None, None)
            .unwrap();
        for hyp in &nbest {
            assert!(hyp.yseq.len() > 2);
        }
    }

    #[test]
    fn test_retry_relaxes_minlenratio_and_keeps_caller_config() {
        let scorer = eos_after_two();
        let config = RecognizeConfig {
            beam_size: 2,
            nbest: 1,
            ctc_weight: 0.0,
            minlenratio: 2.0, // unreachable: minlen 8 > any possible length
            ..Default::default()
        };
        let before = config.clone();
        let search = BeamSearch::new(config.clone());
        let nbest = search.recognize(&scorer, 4, None, None).unwrap();
        // Relaxation eventually admits the maxlen-forced ending.
        assert!(!nbest.is_empty());
        assert_eq!(config, before);
    }

    #[test]
    fn test_invalid_config_fails_before_decoding() {
        let scorer = eos_after_two();
        let config = RecognizeConfig {
            beam_size: 0,
            ..Default::default()
        };
        let err = BeamSearch::new(config).recognize(&scorer, 4, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_joint_ctc_scoring_smoke() {
        let dev = Device::Cpu;
        let l = (1.0f32 / 5.0).ln();
        let lpz = Tensor::full(l, (4, 5), &dev).unwrap();
        let prefix = CtcPrefixScorer::new(&lpz, 0, 4).unwrap();

        let config = RecognizeConfig {
            beam_size: 2,
            nbest: 2,
            ctc_weight: 0.5,
            ..Default::default()
        };
        let scorer = eos_after_two();
        let nbest = BeamSearch::new(config)
            .recognize(&scorer, 4, Some(&prefix), None)
            .unwrap();
        assert!(!nbest.is_empty());
        for hyp in &nbest {
            assert!(hyp.score.is_finite());
            assert_eq!(*hyp.yseq.last().unwrap(), 4);
        }
    }

    /// LM that strongly favors one token and charges a known final score.
    struct BiasLm {
        favorite: u32,
        vocab: usize,
    }

    impl LanguageModel for BiasLm {
        fn predict(&self, state: Option<&LmState>, _token: u32) -> Result<(LmState, Vec<f32>)> {
            let steps = state
                .and_then(|s| s.downcast_ref::<usize>())
                .copied()
                .unwrap_or(0);
            let mut scores = vec![-10.0; self.vocab];
            scores[self.favorite as usize] = 10.0;
            Ok((Rc::new(steps + 1), scores))
        }

        fn final_score(&self, state: Option<&LmState>) -> f32 {
            let steps = state
                .and_then(|s| s.downcast_ref::<usize>())
                .copied()
                .unwrap_or(0);
            -(steps as f32)
        }
    }

    #[test]
    fn test_language_model_biases_selection() {
        let config = RecognizeConfig {
            beam_size: 2,
            nbest: 1,
            ctc_weight: 0.0,
            lm_weight: 1.0,
            ..Default::default()
        };
        let scorer = eos_after_two();
        let lm = BiasLm {
            favorite: 3,
            vocab: 5,
        };
        let nbest = BeamSearch::new(config)
            .recognize(&scorer, 4, None, Some(&lm))
            .unwrap();
        let best = &nbest[0];
        // Without the LM the stub prefers 0 then 1; the LM flips both to 3.
        assert_eq!(best.yseq[1], 3);
        assert_eq!(best.yseq[2], 3);
    }

    #[test]
    fn test_adaptive_weights_finite_and_normalized() {
        let policy = AdaptiveWeights;
        let (a, c) = policy.weights(&[-0.1, -5.0, -6.0], &[-2.0, -2.1, -2.2]);
        assert!(a.is_finite() && c.is_finite());
        assert!((a + c - 1.0).abs() < 1e-6);
        // The peaked attention distribution earns the larger weight.
        assert!(a > c);
    }

    #[test]
    fn test_fixed_weights() {
        let policy = FixedWeights { ctc_weight: 0.3 };
        let (a, c) = policy.weights(&[], &[]);
        assert!((a - 0.7).abs() < 1e-6);
        assert!((c - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_end_detect_requires_stagnation() {
        let mk = |len: usize, score: f32| {
            let mut h = Hypothesis::initial(0, None);
            h.yseq = vec![0; len];
            h.score = score;
            h
        };
        // A fresh competitive hypothesis keeps decoding alive.
        let ended = vec![mk(3, -1.0), mk(4, -1.5), mk(5, -2.0)];
        assert!(!end_detect(&ended, 4));
        // All recently finishing lengths are far below the best → stop.
        let ended = vec![mk(6, -1.0), mk(2, -50.0), mk(3, -60.0), mk(4, -70.0)];
        assert!(end_detect(&ended, 4));
    }
}
