//! Training and validation metrics.
//!
//! - [`th_accuracy`] — argmax accuracy of the fused prediction over
//!   non-ignored target positions
//! - [`ErrorCalculator`] — character/word error rates against a symbol
//!   table, with a CTC variant that collapses blanks and repeats
//! - [`Reporter`] — collects per-step metrics and logs them

use candle_core::Tensor;
use tracing::info;

use crate::config::IGNORE_ID;
use crate::Result;

/// Accuracy of `pred: [B, L, V]` against `targets: [B, L]` (i64, padded
/// with the ignore marker). Ignored positions are excluded from both
/// numerator and denominator.
pub fn th_accuracy(pred: &Tensor, targets: &Tensor) -> Result<f32> {
    let ids = pred.argmax(candle_core::D::Minus1)?.to_vec2::<u32>()?;
    let refs = targets.to_vec2::<i64>()?;

    let mut correct = 0usize;
    let mut total = 0usize;
    for (hyp_row, ref_row) in ids.iter().zip(&refs) {
        for (&h, &r) in hyp_row.iter().zip(ref_row) {
            if r == IGNORE_ID {
                continue;
            }
            total += 1;
            if h as i64 == r {
                correct += 1;
            }
        }
    }
    if total == 0 {
        return Ok(0.0);
    }
    Ok(correct as f32 / total as f32)
}

/// Levenshtein distance between two symbol slices.
fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, x) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let sub = prev + usize::from(x != y);
            prev = row[j + 1];
            row[j + 1] = sub.min(prev + 1).min(row[j] + 1);
        }
    }
    row[b.len()]
}

/// Character/word error rate calculator over a fixed symbol table.
#[derive(Debug, Clone)]
pub struct ErrorCalculator {
    char_list: Vec<String>,
    sym_space: String,
    sym_blank: String,
    report_cer: bool,
    report_wer: bool,
}

impl ErrorCalculator {
    pub fn new(
        char_list: Vec<String>,
        sym_space: String,
        sym_blank: String,
        report_cer: bool,
        report_wer: bool,
    ) -> Self {
        Self {
            char_list,
            sym_space,
            sym_blank,
            report_cer,
            report_wer,
        }
    }

    /// Render ids as text: ignore markers skipped, the space token mapped
    /// to ' ', the blank token removed.
    fn to_text(&self, ids: &[i64]) -> String {
        let mut text = String::new();
        for &id in ids {
            if id == IGNORE_ID {
                continue;
            }
            match self.char_list.get(id as usize) {
                Some(tok) if *tok == self.sym_blank => {}
                Some(tok) if *tok == self.sym_space => text.push(' '),
                Some(tok) => text.push_str(tok),
                None => {}
            }
        }
        text
    }

    /// `(cer, wer)` of the hypothesis batch against the reference batch.
    pub fn error_rates(
        &self,
        ys_hat: &[Vec<i64>],
        ys_true: &[Vec<i64>],
    ) -> (Option<f32>, Option<f32>) {
        let pairs: Vec<(String, String)> = ys_hat
            .iter()
            .zip(ys_true)
            .map(|(h, r)| (self.to_text(h), self.to_text(r)))
            .collect();

        let cer = self.report_cer.then(|| {
            let (mut dist, mut total) = (0usize, 0usize);
            for (h, r) in &pairs {
                let h: Vec<char> = h.chars().filter(|c| *c != ' ').collect();
                let r: Vec<char> = r.chars().filter(|c| *c != ' ').collect();
                dist += edit_distance(&h, &r);
                total += r.len();
            }
            dist as f32 / total.max(1) as f32
        });

        let wer = self.report_wer.then(|| {
            let (mut dist, mut total) = (0usize, 0usize);
            for (h, r) in &pairs {
                let h: Vec<&str> = h.split_whitespace().collect();
                let r: Vec<&str> = r.split_whitespace().collect();
                dist += edit_distance(&h, &r);
                total += r.len();
            }
            dist as f32 / total.max(1) as f32
        });

        (cer, wer)
    }

    /// CER of frame-level CTC argmax output: blanks (symbol 0) and
    /// consecutive repeats are collapsed before comparison.
    pub fn cer_ctc(&self, ys_hat: &[Vec<i64>], ys_true: &[Vec<i64>]) -> Option<f32> {
        if !self.report_cer {
            return None;
        }
        let (mut dist, mut total) = (0usize, 0usize);
        for (hat, truth) in ys_hat.iter().zip(ys_true) {
            let collapsed = collapse_ctc(hat);
            let h = self.to_text(&collapsed);
            let r = self.to_text(truth);
            let h: Vec<char> = h.chars().filter(|c| *c != ' ').collect();
            let r: Vec<char> = r.chars().filter(|c| *c != ' ').collect();
            dist += edit_distance(&h, &r);
            total += r.len();
        }
        Some(dist as f32 / total.max(1) as f32)
    }
}

/// Collapse a frame-level CTC path: drop blanks (0) and repeats.
fn collapse_ctc(ids: &[i64]) -> Vec<i64> {
    let mut out = Vec::new();
    let mut prev: Option<i64> = None;
    for &id in ids {
        if id != 0 && prev != Some(id) {
            out.push(id);
        }
        prev = Some(id);
    }
    out
}

/// Metrics of one training/validation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    pub loss_ctc: Option<f32>,
    pub loss_att: Option<f32>,
    pub acc: f32,
    pub cer_ctc: Option<f32>,
    pub cer: Option<f32>,
    pub wer: Option<f32>,
    pub loss: f32,
}

/// Collects per-step metrics for external reporting.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    last: Option<StepMetrics>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log a step's metrics.
    pub fn report(&mut self, metrics: StepMetrics) {
        info!(
            loss = metrics.loss,
            loss_ctc = metrics.loss_ctc,
            loss_att = metrics.loss_att,
            acc = metrics.acc,
            cer_ctc = metrics.cer_ctc,
            cer = metrics.cer,
            wer = metrics.wer,
            "training step"
        );
        self.last = Some(metrics);
    }

    /// Most recently reported metrics, if any step was valid so far.
    pub fn last(&self) -> Option<&StepMetrics> {
        self.last.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_th_accuracy_ignores_padding() {
        let dev = Device::Cpu;
        // Predictions argmax: [1, 0]; targets: [1, ignore].
        let pred = Tensor::from_vec(
            vec![0.0f32, 2.0, 0.0, /* */ 3.0, 0.0, 0.0],
            (1, 2, 3),
            &dev,
        )
        .unwrap();
        let targets = Tensor::from_vec(vec![1i64, IGNORE_ID], (1, 2), &dev).unwrap();
        let acc = th_accuracy(&pred, &targets).unwrap();
        assert!((acc - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(&['a', 'b', 'c'], &['a', 'b', 'c']), 0);
        assert_eq!(edit_distance(&['a', 'b', 'c'], &['a', 'x', 'c']), 1);
        assert_eq!(edit_distance(&['a'], &['a', 'b', 'c']), 2);
        assert_eq!(edit_distance::<char>(&[], &['a']), 1);
    }

    fn calculator() -> ErrorCalculator {
        let chars = vec![
            "<blank>".to_string(),
            "a".to_string(),
            "b".to_string(),
            "<space>".to_string(),
        ];
        ErrorCalculator::new(chars, "<space>".into(), "<blank>".into(), true, true)
    }

    #[test]
    fn test_error_rates() {
        let calc = calculator();
        // hyp "ab a" vs ref "ab b"
        let hyp = vec![vec![1i64, 2, 3, 1]];
        let truth = vec![vec![1i64, 2, 3, 2, IGNORE_ID]];
        let (cer, wer) = calc.error_rates(&hyp, &truth);
        // chars: "aba" vs "abb" → 1 edit / 3 ref chars
        assert!((cer.unwrap() - 1.0 / 3.0).abs() < 1e-6);
        // words: ["ab","a"] vs ["ab","b"] → 1 edit / 2 ref words
        assert!((wer.unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_cer_ctc_collapses_path() {
        let calc = calculator();
        // Frame path: blank a a blank b → "ab"
        let hyp = vec![vec![0i64, 1, 1, 0, 2]];
        let truth = vec![vec![1i64, 2]];
        let cer = calc.cer_ctc(&hyp, &truth).unwrap();
        assert_eq!(cer, 0.0);
    }

    #[test]
    fn test_collapse_ctc_keeps_separated_repeats() {
        assert_eq!(collapse_ctc(&[1, 0, 1]), vec![1, 1]);
        assert_eq!(collapse_ctc(&[1, 1, 1]), vec![1]);
    }

    #[test]
    fn test_reporter_stores_last() {
        let mut reporter = Reporter::new();
        assert!(reporter.last().is_none());
        reporter.report(StepMetrics {
            loss: 1.5,
            acc: 0.8,
            ..Default::default()
        });
        assert_eq!(reporter.last().unwrap().loss, 1.5);
    }
}
