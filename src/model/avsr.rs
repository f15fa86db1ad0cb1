//! Top-level audio-visual recognition model combining all components.
//!
//! `AvsrModel` orchestrates:
//! - four stream encoders (audio, video, acoustic/visual role-model)
//! - two attention decoders with role-model transform readouts
//! - the fusion network merging both streams into one prediction
//! - the fused CTC head and its re-encoders
//! - beam-search decoding with joint CTC/attention scoring
//!
//! ```text
//! audio ──→ aencoder ──┬─→ adecoder ─┐
//! video ──→ vencoder ──┼─→ vdecoder ─┼─→ fusion ─→ prediction
//! rm[..11] → armencoder┤             │
//! rm[11..] → vrmencoder┴─── ctcinfo ─┴─→ ctc head (loss / prefix scores)
//! ```

use std::collections::HashMap;

use candle_core::{IndexOp, Tensor};
use candle_nn::{ops::softmax, VarBuilder};
use tracing::warn;

use super::decoder::StreamDecoder;
use super::encoder::{StreamEncoder, VideoEncoder};
use super::fusion::FusionNet;
use super::loss::LabelSmoothingLoss;
use super::mask::{target_mask, valid_mask};
use crate::config::{ModelConfig, RecognizeConfig, AUDIO_RM_DIM, IGNORE_ID, VIDEO_RM_DIM};
use crate::ctc::{Ctc, CtcPrefixScorer};
use crate::metrics::{th_accuracy, ErrorCalculator, Reporter, StepMetrics};
use crate::search::{BeamSearch, Hypothesis, LanguageModel, StepScorer};
use crate::{Error, Result};

/// Losses above this are treated as numerically broken and not reported.
const CTC_LOSS_THRESHOLD: f32 = 1e4;

/// Output of one training forward pass.
#[derive(Debug)]
pub struct ForwardOutput {
    /// Combined loss (scalar tensor).
    pub loss: Tensor,
    /// Per-step metric values (also pushed to the reporter when sane).
    pub metrics: StepMetrics,
}

/// Joint audio-visual speech recognition model.
pub struct AvsrModel {
    config: ModelConfig,
    aencoder: StreamEncoder,
    vencoder: VideoEncoder,
    armencoder: StreamEncoder,
    vrmencoder: StreamEncoder,
    adecoder: StreamDecoder,
    vdecoder: StreamDecoder,
    fusion: FusionNet,
    actcencoder: StreamEncoder,
    vctcencoder: StreamEncoder,
    ctc: Option<Ctc>,
    criterion: LabelSmoothingLoss,
    error_calculator: Option<ErrorCalculator>,
    reporter: Reporter,
}

impl AvsrModel {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let c = &config;

        let aencoder = StreamEncoder::new(
            c.aidim,
            c.adim,
            c.aheads,
            c.eunits,
            c.elayers,
            c.input_layer,
            vb.pp("aencoder"),
        )?;
        let vencoder = VideoEncoder::new(
            c.vidim,
            c.adim,
            c.aheads,
            c.eunits,
            c.elayers,
            c.input_layer,
            vb.pp("vencoder"),
        )?;
        let armencoder = StreamEncoder::new(
            AUDIO_RM_DIM,
            c.adim,
            c.aheads,
            c.eunits,
            c.elayers,
            c.input_layer,
            vb.pp("armencoder"),
        )?;
        let vrmencoder = StreamEncoder::new(
            VIDEO_RM_DIM,
            c.adim,
            c.aheads,
            c.eunits,
            c.elayers,
            c.input_layer,
            vb.pp("vrmencoder"),
        )?;
        let adecoder = StreamDecoder::new(
            c.odim,
            c.adim,
            c.aheads,
            c.dunits,
            c.dlayers,
            vb.pp("adecoder"),
        )?;
        let vdecoder = StreamDecoder::new(
            c.odim,
            c.adim,
            c.aheads,
            c.dunits,
            c.dlayers,
            vb.pp("vdecoder"),
        )?;
        let fusion = FusionNet::new(c.odim, c.adim, vb.pp("fusion"))?;
        let actcencoder = StreamEncoder::new(
            c.adim,
            c.adim,
            c.aheads,
            c.eunits,
            c.ctc_blocks,
            crate::config::InputLayer::Linear,
            vb.pp("actcencoder"),
        )?;
        let vctcencoder = StreamEncoder::new(
            c.adim,
            c.adim,
            c.aheads,
            c.eunits,
            c.ctc_blocks,
            crate::config::InputLayer::Linear,
            vb.pp("vctcencoder"),
        )?;

        let ctc = if c.mtlalpha > 0.0 {
            Some(Ctc::new(c.odim, c.adim, c.ctc_type, vb.pp("ctc"))?)
        } else {
            None
        };

        let error_calculator = if c.report_cer || c.report_wer {
            Some(ErrorCalculator::new(
                c.char_list.clone(),
                c.sym_space.clone(),
                c.sym_blank.clone(),
                c.report_cer,
                c.report_wer,
            ))
        } else {
            None
        };

        let criterion =
            LabelSmoothingLoss::new(c.odim, c.lsm_weight, c.length_normalized_loss);

        Ok(Self {
            config,
            aencoder,
            vencoder,
            armencoder,
            vrmencoder,
            adecoder,
            vdecoder,
            fusion,
            actcencoder,
            vctcencoder,
            ctc,
            criterion,
            error_calculator,
            reporter: Reporter::new(),
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Metric reporter fed by [`AvsrModel::forward`].
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Strip ignore markers, prepend the start symbol, append the end
    /// symbol. Inputs pad with `eos`, outputs with the ignore marker.
    ///
    /// Returns `(ys_in [B, L+1] u32, ys_out [B, L+1] i64, lengths)`.
    fn add_sos_eos(&self, ys_pad: &Tensor) -> Result<(Tensor, Tensor, Vec<usize>)> {
        let rows = ys_pad.to_vec2::<i64>()?;
        let sos = self.config.sos();
        let eos = self.config.eos();
        let lmax = rows
            .iter()
            .map(|r| r.iter().filter(|&&y| y != IGNORE_ID).count())
            .max()
            .unwrap_or(0)
            + 1;

        let b = rows.len();
        let mut ys_in = vec![eos; b * lmax];
        let mut ys_out = vec![IGNORE_ID; b * lmax];
        let mut lens = Vec::with_capacity(b);
        for (bi, row) in rows.iter().enumerate() {
            let ys: Vec<i64> = row.iter().copied().filter(|&y| y != IGNORE_ID).collect();
            ys_in[bi * lmax] = sos;
            for (j, &y) in ys.iter().enumerate() {
                ys_in[bi * lmax + j + 1] = y as u32;
                ys_out[bi * lmax + j] = y;
            }
            ys_out[bi * lmax + ys.len()] = eos as i64;
            lens.push(ys.len() + 1);
        }

        let device = ys_pad.device();
        Ok((
            Tensor::from_vec(ys_in, (b, lmax), device)?,
            Tensor::from_vec(ys_out, (b, lmax), device)?,
            lens,
        ))
    }

    /// Split the role-model block into its acoustic and visual sub-vectors.
    fn split_rm(&self, rms: &Tensor, dim: usize) -> Result<(Tensor, Tensor)> {
        let width = rms.dim(dim)?;
        if width != AUDIO_RM_DIM + VIDEO_RM_DIM {
            return Err(Error::Input(format!(
                "role-model features must have width {}, got {width}",
                AUDIO_RM_DIM + VIDEO_RM_DIM
            )));
        }
        let arms = rms.narrow(dim, 0, AUDIO_RM_DIM)?;
        let vrms = rms.narrow(dim, width - VIDEO_RM_DIM, VIDEO_RM_DIM)?;
        Ok((arms, vrms))
    }

    /// Training forward pass.
    ///
    /// - `axs_pad`: `[B, Tmax, aidim]` padded acoustic features
    /// - `vxs_pad`: `[B, Tmax, vidim]` padded visual features
    /// - `rms_pad`: `[B, Tmax, 18]` padded role-model features
    /// - `ilens`: valid input length per batch entry
    /// - `ys_pad`: `[B, Lmax]` i64 targets padded with the ignore marker
    ///
    /// Returns the combined loss (`mtlalpha`-weighted CTC + attention)
    /// and the step metrics. Numerically broken losses are logged and
    /// withheld from the reporter but still returned.
    pub fn forward(
        &mut self,
        axs_pad: &Tensor,
        vxs_pad: &Tensor,
        rms_pad: &Tensor,
        ilens: &[usize],
        ys_pad: &Tensor,
    ) -> Result<ForwardOutput> {
        let b = axs_pad.dim(0)?;
        if vxs_pad.dim(0)? != b || rms_pad.dim(0)? != b || ilens.len() != b {
            return Err(Error::Input("stream batch sizes do not match".into()));
        }
        let max_ilen = ilens.iter().copied().max().unwrap_or(0);
        if max_ilen == 0 {
            return Err(Error::Input("all input lengths are zero".into()));
        }

        // 1. Encode every stream on a shared time base.
        let axs = axs_pad.narrow(1, 0, max_ilen.min(axs_pad.dim(1)?))?;
        let vxs = vxs_pad.narrow(1, 0, max_ilen.min(vxs_pad.dim(1)?))?;
        let rms = rms_pad.narrow(1, 0, max_ilen.min(rms_pad.dim(1)?))?;
        let src_mask = valid_mask(ilens, axs.dim(1)?, axs.device())?;

        let audio_len = axs.dim(1)?;
        let (ahs, ahs_mask) = self.aencoder.forward(&axs, Some(&src_mask))?;
        let (vhs, vhs_mask) = self.vencoder.forward(&vxs, Some(&src_mask), audio_len)?;

        let (arms, vrms) = self.split_rm(&rms, 2)?;
        let (armhs, _) = self.armencoder.forward(&arms, Some(&src_mask))?;
        let (vrmhs, _) = self.vrmencoder.forward(&vrms, Some(&src_mask))?;
        let ctcinfo = Tensor::cat(&[&armhs, &vrmhs], candle_core::D::Minus1)?;

        // 2. Decode both streams against the fused targets.
        let (ys_in, ys_out, olens) = self.add_sos_eos(ys_pad)?;
        let ys_mask = target_mask(&olens, ys_in.dim(1)?, ys_in.device())?;
        let (apred, armored) =
            self.adecoder
                .forward(&ys_in, &ys_mask, &ahs, ahs_mask.as_ref(), &armhs)?;
        let (vpred, vrmpred) =
            self.vdecoder
                .forward(&ys_in, &ys_mask, &vhs, vhs_mask.as_ref(), &vrmhs)?;

        // 3. Fuse the stream distributions with the transform features.
        let transinfo = Tensor::cat(&[&armored, &vrmpred], candle_core::D::Minus1)?;
        let cattransfeats = Tensor::cat(
            &[
                &softmax(&apred, candle_core::D::Minus1)?,
                &softmax(&vpred, candle_core::D::Minus1)?,
                &transinfo,
            ],
            candle_core::D::Minus1,
        )?;
        let pred = self.fusion.forward(&cattransfeats)?;

        // 4. Attention branch loss + accuracy.
        let loss_att = self.criterion.forward(&pred, &ys_out)?;
        let acc = th_accuracy(&pred, &ys_out)?;

        // 5. CTC branch over the re-encoded streams.
        let mut loss_ctc_t: Option<Tensor> = None;
        let mut cer_ctc = None;
        if let Some(ctc) = &self.ctc {
            let hlens = match &ahs_mask {
                Some(m) => mask_lengths(m)?,
                None => ilens.to_vec(),
            };
            let (ahs2, _) = self.actcencoder.forward(&ahs, ahs_mask.as_ref())?;
            let (vhs2, _) = self.vctcencoder.forward(&vhs, vhs_mask.as_ref())?;
            let loss_ctc = ctc.loss(&ahs2, &vhs2, &ctcinfo, &hlens, ys_pad)?;

            if let Some(ec) = &self.error_calculator {
                let ys_hat = ctc.argmax(&ahs2, &vhs2, &ctcinfo)?.to_vec2::<u32>()?;
                let hat: Vec<Vec<i64>> = ys_hat
                    .iter()
                    .zip(&hlens)
                    .map(|(row, &l)| row.iter().take(l).map(|&y| y as i64).collect())
                    .collect();
                cer_ctc = ec.cer_ctc(&hat, &ys_pad.to_vec2::<i64>()?);
            }
            loss_ctc_t = Some(loss_ctc);
        }

        // 6. Attention-branch CER/WER.
        let (mut cer, mut wer) = (None, None);
        if let Some(ec) = &self.error_calculator {
            let refs = ys_out.to_vec2::<i64>()?;
            let ids = pred.argmax(candle_core::D::Minus1)?.to_vec2::<u32>()?;
            let hats: Vec<Vec<i64>> = ids
                .iter()
                .zip(&refs)
                .map(|(row, r)| {
                    let len = r.iter().filter(|&&y| y != IGNORE_ID).count();
                    row.iter().take(len).map(|&y| y as i64).collect()
                })
                .collect();
            let (c, w) = ec.error_rates(&hats, &refs);
            cer = c;
            wer = w;
        }

        // 7. Mix the branches.
        let alpha = self.config.mtlalpha;
        let (loss, loss_att_data, loss_ctc_data) = if alpha == 0.0 {
            let att_val = loss_att.to_scalar::<f32>()?;
            (loss_att, Some(att_val), None)
        } else if alpha == 1.0 {
            let loss_ctc = loss_ctc_t
                .ok_or_else(|| Error::Decode("mtlalpha is 1 but no CTC head exists".into()))?;
            let ctc_val = loss_ctc.to_scalar::<f32>()?;
            (loss_ctc, None, Some(ctc_val))
        } else {
            let loss_ctc = loss_ctc_t
                .ok_or_else(|| Error::Decode("mtlalpha > 0 but no CTC head exists".into()))?;
            let att_val = loss_att.to_scalar::<f32>()?;
            let ctc_val = loss_ctc.to_scalar::<f32>()?;
            let loss = ((loss_ctc * alpha)? + (loss_att * (1.0 - alpha))?)?;
            (loss, Some(att_val), Some(ctc_val))
        };

        let loss_data = loss.to_scalar::<f32>()?;
        let metrics = StepMetrics {
            loss_ctc: loss_ctc_data,
            loss_att: loss_att_data,
            acc,
            cer_ctc,
            cer,
            wer,
            loss: loss_data,
        };
        if loss_data < CTC_LOSS_THRESHOLD && !loss_data.is_nan() {
            self.reporter.report(metrics.clone());
        } else {
            warn!("loss (={loss_data}) is not correct");
        }

        Ok(ForwardOutput { loss, metrics })
    }

    // --- Per-stream encode helpers (inference on unbatched features) ---

    /// Encode unbatched acoustic features `[T, aidim]` → `[1, T', adim]`.
    pub fn encode_audio(&self, afeat: &Tensor) -> Result<Tensor> {
        let (h, _) = self.aencoder.forward(&afeat.unsqueeze(0)?, None)?;
        Ok(h)
    }

    /// Encode unbatched visual features `[Tv, vidim]` → `[1, T', adim]`.
    pub fn encode_video(&self, vfeat: &Tensor, audio_len: usize) -> Result<Tensor> {
        let (h, _) = self
            .vencoder
            .forward(&vfeat.unsqueeze(0)?, None, audio_len)?;
        Ok(h)
    }

    /// Encode the acoustic role-model sub-block `[T, 11]` → `[1, T', adim]`.
    pub fn encode_audio_rm(&self, arms: &Tensor) -> Result<Tensor> {
        let (h, _) = self.armencoder.forward(&arms.unsqueeze(0)?, None)?;
        Ok(h)
    }

    /// Encode the visual role-model sub-block `[T, 7]` → `[1, T', adim]`.
    pub fn encode_video_rm(&self, vrms: &Tensor) -> Result<Tensor> {
        let (h, _) = self.vrmencoder.forward(&vrms.unsqueeze(0)?, None)?;
        Ok(h)
    }

    /// Re-encode audio hiddens for the CTC branch.
    pub fn reencode_audio_ctc(&self, ahs: &Tensor) -> Result<Tensor> {
        let (h, _) = self.actcencoder.forward(ahs, None)?;
        Ok(h)
    }

    /// Re-encode video hiddens for the CTC branch.
    pub fn reencode_video_ctc(&self, vhs: &Tensor) -> Result<Tensor> {
        let (h, _) = self.vctcencoder.forward(vhs, None)?;
        Ok(h)
    }

    /// Prefix scorer over the fused CTC log-probabilities of one utterance.
    pub fn prefix_scorer(
        &self,
        actc: &Tensor,
        vctc: &Tensor,
        ctcinfo: &Tensor,
    ) -> Result<CtcPrefixScorer> {
        let ctc = self
            .ctc
            .as_ref()
            .ok_or_else(|| Error::Config("model was built without a CTC head".into()))?;
        let lpz = ctc.log_softmax(actc, vctc, ctcinfo)?.squeeze(0)?;
        CtcPrefixScorer::new(&lpz, 0, self.config.eos())
    }

    /// Recognize one utterance.
    ///
    /// - `afeat`: `[T, aidim]` acoustic features
    /// - `vfeat`: `[Tv, vidim]` visual features
    /// - `rms`: `[T, 18]` role-model features
    /// - `char_list`: symbol table for per-step hypothesis logging
    /// - `lm`: optional external language model
    ///
    /// Returns the n-best hypotheses, best first. The caller's decode
    /// configuration is never modified.
    pub fn recognize(
        &self,
        afeat: &Tensor,
        vfeat: &Tensor,
        rms: &Tensor,
        recog_config: &RecognizeConfig,
        char_list: Option<&[String]>,
        lm: Option<&dyn LanguageModel>,
    ) -> Result<Vec<Hypothesis>> {
        recog_config.validate(self.config.odim)?;
        if recog_config.ctc_weight > 0.0 && self.ctc.is_none() {
            return Err(Error::Config(
                "ctc_weight > 0 but the model was built without a CTC head".into(),
            ));
        }

        let audio_len = afeat.dim(0)?;
        let (arms, vrms) = self.split_rm(rms, 1)?;

        let aenc = self.encode_audio(afeat)?;
        let venc = self.encode_video(vfeat, audio_len)?;
        let arm = self.encode_audio_rm(&arms)?;
        let vrm = self.encode_video_rm(&vrms)?;
        let ctcinfos = Tensor::cat(&[&arm, &vrm], candle_core::D::Minus1)?;

        let prefix = if recog_config.ctc_weight > 0.0 {
            let actc = self.reencode_audio_ctc(&aenc)?;
            let vctc = self.reencode_video_ctc(&venc)?;
            Some(self.prefix_scorer(&actc, &vctc, &ctcinfos)?)
        } else {
            None
        };

        let n_frames = venc.dim(1)?;
        let scorer = FusedStepScorer {
            model: self,
            aenc,
            venc,
            arm,
            vrm,
        };
        let mut search = BeamSearch::new(recog_config.clone());
        if let Some(chars) = char_list {
            search = search.with_symbol_table(chars.to_vec());
        }
        search.recognize(&scorer, n_frames, prefix.as_ref(), lm)
    }

    /// Attention-weight introspection.
    ///
    /// Runs a forward pass and collects the cached attention weights of
    /// every attention module, keyed by its path. Modules without a
    /// cached tensor are simply absent from the map.
    pub fn calculate_all_attentions(
        &mut self,
        axs_pad: &Tensor,
        vxs_pad: &Tensor,
        rms_pad: &Tensor,
        ilens: &[usize],
        ys_pad: &Tensor,
    ) -> Result<HashMap<String, Tensor>> {
        self.forward(axs_pad, vxs_pad, rms_pad, ilens, ys_pad)?;

        let mut ret = HashMap::new();
        self.aencoder.collect_attentions("aencoder", &mut ret);
        self.vencoder.collect_attentions("vencoder", &mut ret);
        self.armencoder.collect_attentions("armencoder", &mut ret);
        self.vrmencoder.collect_attentions("vrmencoder", &mut ret);
        self.adecoder.collect_attentions("adecoder", &mut ret);
        self.vdecoder.collect_attentions("vdecoder", &mut ret);
        self.actcencoder.collect_attentions("actcencoder", &mut ret);
        self.vctcencoder.collect_attentions("vctcencoder", &mut ret);
        Ok(ret)
    }
}

/// Valid lengths of a `[B, 1, T]` u8 mask.
fn mask_lengths(mask: &Tensor) -> Result<Vec<usize>> {
    let sums = mask.to_dtype(candle_core::DType::F32)?.sum(2)?;
    let lens: Vec<f32> = sums.flatten_all()?.to_vec1()?;
    Ok(lens.into_iter().map(|l| l as usize).collect())
}

/// One-step fused scorer over pre-encoded streams.
struct FusedStepScorer<'a> {
    model: &'a AvsrModel,
    aenc: Tensor,
    venc: Tensor,
    arm: Tensor,
    vrm: Tensor,
}

impl StepScorer for FusedStepScorer<'_> {
    fn vocab_size(&self) -> usize {
        self.model.config.odim
    }

    fn score_step(&self, yseq: &[u32]) -> crate::Result<Vec<f32>> {
        let device = self.aenc.device();
        let ys = Tensor::from_vec(yseq.to_vec(), (1, yseq.len()), device)?;

        let (aprobs, armfeat) = self
            .model
            .adecoder
            .recognize_step(&ys, &self.aenc, &self.arm)?;
        let (vprobs, vrmfeat) = self
            .model
            .vdecoder
            .recognize_step(&ys, &self.venc, &self.vrm)?;

        let feats = Tensor::cat(
            &[&aprobs, &vprobs, &armfeat, &vrmfeat],
            candle_core::D::Minus1,
        )?;
        let logits = self.model.fusion.forward(&feats)?; // [1, odim]
        let log_probs = candle_nn::ops::log_softmax(&logits, candle_core::D::Minus1)?;
        Ok(log_probs.i(0)?.to_vec1()?)
    }
}
