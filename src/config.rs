//! Configuration for the audio-visual recognition model.
//!
//! [`ModelConfig`] fixes the architecture (stream widths, layer counts,
//! vocabulary), [`RecognizeConfig`] holds per-call decoding options.
//! Both validate before any tensor work so bad settings fail fast.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ignore marker used to pad target symbol sequences.
pub const IGNORE_ID: i64 = -1;

/// Width of the acoustic sub-block of a role-model feature vector.
pub const AUDIO_RM_DIM: usize = 11;

/// Width of the visual sub-block of a role-model feature vector.
pub const VIDEO_RM_DIM: usize = 7;

/// CTC loss backend selector.
///
/// Only `builtin` is implemented natively; selecting `warp` falls back
/// to builtin with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtcType {
    Builtin,
    Warp,
}

/// Input layer applied by every stream encoder.
///
/// All four streams use the same type so encoder output lengths stay
/// aligned across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLayer {
    /// Linear projection, length-preserving.
    Linear,
    /// Two strided convolutions, subsampling time by 4.
    Conv2d,
}

/// Architecture configuration for [`AvsrModel`](crate::model::avsr::AvsrModel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Acoustic feature width.
    pub aidim: usize,
    /// Visual feature width.
    #[serde(default = "default_vidim")]
    pub vidim: usize,
    /// Output vocabulary size; symbol `odim - 1` is both start and end.
    pub odim: usize,

    // --- Attention / layer geometry ---
    /// Attention transformation width.
    #[serde(default = "default_adim")]
    pub adim: usize,
    /// Number of attention heads.
    #[serde(default = "default_aheads")]
    pub aheads: usize,
    /// Encoder blocks per stream encoder.
    #[serde(default = "default_elayers")]
    pub elayers: usize,
    /// Encoder feed-forward inner width.
    #[serde(default = "default_eunits")]
    pub eunits: usize,
    /// Decoder blocks per stream decoder.
    #[serde(default = "default_dlayers")]
    pub dlayers: usize,
    /// Decoder feed-forward inner width.
    #[serde(default = "default_dunits")]
    pub dunits: usize,
    /// Blocks in each CTC re-encoder.
    #[serde(default = "default_ctc_blocks")]
    pub ctc_blocks: usize,
    /// Input layer type shared by all stream encoders.
    #[serde(default = "default_input_layer")]
    pub input_layer: InputLayer,
    /// Dropout rate (applied in training; ignored during inference).
    #[serde(default)]
    pub dropout_rate: f64,

    // --- Training objective ---
    /// CTC/attention mixing coefficient: 0 = attention only, 1 = CTC only.
    #[serde(default = "default_mtlalpha")]
    pub mtlalpha: f64,
    /// Label smoothing weight.
    #[serde(default = "default_lsm_weight")]
    pub lsm_weight: f64,
    /// Normalize the attention loss by token count instead of batch size.
    #[serde(default = "default_true")]
    pub length_normalized_loss: bool,
    /// CTC loss backend.
    #[serde(default = "default_ctc_type")]
    pub ctc_type: CtcType,

    // --- Error reporting ---
    /// Report character error rate during validation.
    #[serde(default)]
    pub report_cer: bool,
    /// Report word error rate during validation.
    #[serde(default)]
    pub report_wer: bool,
    /// Symbol table (id → token), required when CER/WER reporting is on.
    #[serde(default)]
    pub char_list: Vec<String>,
    /// Token standing for a space in the symbol table.
    #[serde(default = "default_sym_space")]
    pub sym_space: String,
    /// Token standing for the CTC blank in the symbol table.
    #[serde(default = "default_sym_blank")]
    pub sym_blank: String,
}

impl ModelConfig {
    /// Minimal config for the given feature widths and vocabulary.
    pub fn new(aidim: usize, vidim: usize, odim: usize) -> Self {
        Self {
            aidim,
            vidim,
            odim,
            adim: default_adim(),
            aheads: default_aheads(),
            elayers: default_elayers(),
            eunits: default_eunits(),
            dlayers: default_dlayers(),
            dunits: default_dunits(),
            ctc_blocks: default_ctc_blocks(),
            input_layer: default_input_layer(),
            dropout_rate: 0.0,
            mtlalpha: default_mtlalpha(),
            lsm_weight: default_lsm_weight(),
            length_normalized_loss: true,
            ctc_type: default_ctc_type(),
            report_cer: false,
            report_wer: false,
            char_list: Vec::new(),
            sym_space: default_sym_space(),
            sym_blank: default_sym_blank(),
        }
    }

    /// Reserved start-of-sequence symbol (`odim - 1`).
    pub fn sos(&self) -> u32 {
        (self.odim - 1) as u32
    }

    /// Reserved end-of-sequence symbol (`odim - 1`, same id as start).
    pub fn eos(&self) -> u32 {
        (self.odim - 1) as u32
    }

    /// Validate architecture parameters.
    pub fn validate(&self) -> Result<()> {
        if self.odim < 2 {
            return Err(Error::Config(format!(
                "odim must be >= 2 (one content symbol + sos/eos), got {}",
                self.odim
            )));
        }
        if self.aidim == 0 || self.vidim == 0 {
            return Err(Error::Config("stream feature widths must be > 0".into()));
        }
        if self.adim == 0 || self.aheads == 0 || self.adim % self.aheads != 0 {
            return Err(Error::Config(format!(
                "adim ({}) must be a positive multiple of aheads ({})",
                self.adim, self.aheads
            )));
        }
        if self.elayers == 0 || self.dlayers == 0 || self.ctc_blocks == 0 {
            return Err(Error::Config("layer counts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.mtlalpha) {
            return Err(Error::Config(format!(
                "mtlalpha must be in [0, 1], got {}",
                self.mtlalpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::Config(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.lsm_weight) {
            return Err(Error::Config(format!(
                "lsm_weight must be in [0, 1], got {}",
                self.lsm_weight
            )));
        }
        if (self.report_cer || self.report_wer) && self.char_list.len() != self.odim {
            return Err(Error::Config(format!(
                "char_list must have odim ({}) entries for CER/WER reporting, got {}",
                self.odim,
                self.char_list.len()
            )));
        }
        Ok(())
    }
}

/// Per-call decoding options for [`AvsrModel::recognize`](crate::model::avsr::AvsrModel::recognize).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizeConfig {
    /// Beam width.
    #[serde(default = "default_beam_size")]
    pub beam_size: usize,
    /// Per-step insertion penalty added when a hypothesis ends.
    #[serde(default)]
    pub penalty: f32,
    /// CTC score weight; 0 disables CTC prefix scoring.
    #[serde(default = "default_ctc_weight")]
    pub ctc_weight: f32,
    /// Language model score weight.
    #[serde(default = "default_lm_weight")]
    pub lm_weight: f32,
    /// Max output length as a ratio of encoder frames; 0 = frame count.
    #[serde(default)]
    pub maxlenratio: f32,
    /// Min output length as a ratio of encoder frames.
    #[serde(default)]
    pub minlenratio: f32,
    /// Number of ranked hypotheses to return.
    #[serde(default = "default_nbest")]
    pub nbest: usize,
}

impl Default for RecognizeConfig {
    fn default() -> Self {
        Self {
            beam_size: default_beam_size(),
            penalty: 0.0,
            ctc_weight: default_ctc_weight(),
            lm_weight: default_lm_weight(),
            maxlenratio: 0.0,
            minlenratio: 0.0,
            nbest: default_nbest(),
        }
    }
}

impl RecognizeConfig {
    /// Validate decode options against the model's vocabulary size.
    pub fn validate(&self, odim: usize) -> Result<()> {
        if self.beam_size == 0 {
            return Err(Error::Config("beam_size must be >= 1".into()));
        }
        if self.nbest == 0 {
            return Err(Error::Config("nbest must be >= 1".into()));
        }
        if self.beam_size > odim {
            return Err(Error::Config(format!(
                "beam_size ({}) cannot exceed vocabulary size ({odim})",
                self.beam_size
            )));
        }
        if !(0.0..=1.0).contains(&self.ctc_weight) {
            return Err(Error::Config(format!(
                "ctc_weight must be in [0, 1], got {}",
                self.ctc_weight
            )));
        }
        if !self.lm_weight.is_finite() || self.lm_weight < 0.0 {
            return Err(Error::Config(format!(
                "lm_weight must be finite and >= 0, got {}",
                self.lm_weight
            )));
        }
        if !self.penalty.is_finite() {
            return Err(Error::Config("penalty must be finite".into()));
        }
        if self.maxlenratio < 0.0 || self.minlenratio < 0.0 {
            return Err(Error::Config("length ratios must be >= 0".into()));
        }
        Ok(())
    }
}

fn default_vidim() -> usize {
    256
}

fn default_adim() -> usize {
    320
}

fn default_aheads() -> usize {
    4
}

fn default_elayers() -> usize {
    4
}

fn default_eunits() -> usize {
    300
}

fn default_dlayers() -> usize {
    1
}

fn default_dunits() -> usize {
    320
}

fn default_ctc_blocks() -> usize {
    6
}

fn default_input_layer() -> InputLayer {
    InputLayer::Linear
}

fn default_mtlalpha() -> f64 {
    0.3
}

fn default_lsm_weight() -> f64 {
    0.1
}

fn default_ctc_type() -> CtcType {
    CtcType::Builtin
}

fn default_true() -> bool {
    true
}

fn default_sym_space() -> String {
    "<space>".to_string()
}

fn default_sym_blank() -> String {
    "<blank>".to_string()
}

fn default_beam_size() -> usize {
    10
}

fn default_ctc_weight() -> f32 {
    0.3
}

fn default_lm_weight() -> f32 {
    0.1
}

fn default_nbest() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_config() {
        let cfg = ModelConfig::new(83, 256, 500);
        assert_eq!(cfg.adim, 320);
        assert_eq!(cfg.aheads, 4);
        assert_eq!(cfg.sos(), 499);
        assert_eq!(cfg.eos(), cfg.sos());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_model_config_rejects_bad_heads() {
        let cfg = ModelConfig {
            adim: 320,
            aheads: 7, // 320 % 7 != 0
            ..ModelConfig::new(83, 256, 500)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_model_config_rejects_bad_mtlalpha() {
        let cfg = ModelConfig {
            mtlalpha: 1.5,
            ..ModelConfig::new(83, 256, 500)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_recognize_config_defaults_valid() {
        let cfg = RecognizeConfig::default();
        cfg.validate(500).unwrap();
        assert_eq!(cfg.beam_size, 10);
        assert_eq!(cfg.nbest, 1);
    }

    #[test]
    fn test_recognize_config_rejects_zero_beam() {
        let cfg = RecognizeConfig {
            beam_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate(500).is_err());
    }

    #[test]
    fn test_recognize_config_rejects_oversized_beam() {
        let cfg = RecognizeConfig {
            beam_size: 11,
            ..Default::default()
        };
        assert!(cfg.validate(10).is_err());
    }

    #[test]
    fn test_recognize_config_rejects_bad_ctc_weight() {
        let cfg = RecognizeConfig {
            ctc_weight: 1.2,
            ..Default::default()
        };
        assert!(cfg.validate(500).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let cfg: ModelConfig =
            serde_json::from_str(r#"{"aidim": 83, "vidim": 256, "odim": 52}"#).unwrap();
        assert_eq!(cfg.odim, 52);
        assert_eq!(cfg.input_layer, InputLayer::Linear);
        assert_eq!(cfg.ctc_type, CtcType::Builtin);
    }
}
