//! Audio-visual speech recognition in pure Rust.
//!
//! A candle-based multi-stream sequence-to-sequence transformer that
//! fuses acoustic, visual (lip), and articulatory role-model features
//! into text transcriptions, decoded by a CTC/attention joint beam
//! search.
//!
//! ## Architecture
//!
//! ```text
//! audio feats ──→ audio encoder ───→ audio decoder ──┐
//! video feats ──→ video encoder ───→ video decoder ──┼→ fusion net → prediction
//! rm feats ─┬──→ acoustic rm encoder ─ transform ────┤
//!           └──→ visual rm encoder ── transform ─────┘
//!                         │
//!                         └→ CTC re-encoders → fused CTC head
//!                              (loss · prefix scores for beam search)
//! ```
//!
//! Training mixes the CTC loss and the fused label-smoothing loss under
//! `mtlalpha`; inference runs a beam search that interpolates fused
//! attention scores with incremental CTC prefix scores under an adaptive
//! per-step weight policy.
//!
//! ## Modules
//!
//! - [`model`] — stream encoders/decoders, fusion network, top-level model
//! - [`search`] — hypotheses, weight policies, the beam search driver
//! - [`ctc`] — fused CTC head and prefix scorer
//! - [`metrics`] — accuracy, CER/WER, step reporting
//! - [`config`] — model architecture and decode options

pub mod config;
pub mod ctc;
pub mod metrics;
pub mod model;
pub mod search;

mod error;

pub use config::{ModelConfig, RecognizeConfig};
pub use error::{Error, Result};
pub use model::avsr::{AvsrModel, ForwardOutput};
pub use search::{BeamSearch, Hypothesis, LanguageModel};
