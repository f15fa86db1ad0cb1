//! Mask construction for padded multi-stream batches.
//!
//! Boolean (u8) validity masks travel with encoder outputs; attention
//! converts them to additive masks (0.0 for visible, dtype-min for masked)
//! right before the softmax.

use candle_core::{DType, Device, Result, Tensor};

/// Validity mask for a batch of padded sequences.
///
/// Returns `[B, 1, T]` u8 — 1 for real timesteps, 0 for padding.
pub fn valid_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * max_len];
    for (b, &len) in lengths.iter().enumerate() {
        let len = len.min(max_len);
        for t in 0..len {
            data[b * max_len + t] = 1;
        }
    }
    Tensor::from_vec(data, (batch, 1, max_len), device)
}

/// Lower-triangular subsequent mask `[L, L]` u8.
///
/// Position `(i, j)` is 1 iff `j <= i` — each decode step sees only its
/// own history.
pub fn subsequent_mask(size: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0u8; size * size];
    for i in 0..size {
        for j in 0..=i {
            data[i * size + j] = 1;
        }
    }
    Tensor::from_vec(data, (size, size), device)
}

/// Decoder self-attention mask `[B, L, L]` u8.
///
/// Validity of the target positions AND-ed with the subsequent mask.
pub fn target_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let valid = valid_mask(lengths, max_len, device)?; // [B, 1, L]
    let sub = subsequent_mask(max_len, device)?.unsqueeze(0)?; // [1, L, L]
    valid.broadcast_mul(&sub)
}

/// Convert a u8 validity mask into an additive attention mask.
///
/// 0.0 where the mask is 1, dtype-min where it is 0. The input is
/// broadcast against the score shape by the caller.
pub fn additive_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let min_val = match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    };
    // 1 → 0.0, 0 → min_val: (1 - m) * min_val
    mask.to_dtype(DType::F32)?
        .affine(-min_val, min_val)?
        .to_dtype(dtype)
}

/// Sequence length after one k=3 s=2 convolution.
fn conv_out_len(len: usize) -> usize {
    len.saturating_sub(1) / 2
}

/// Sequence length after the conv2d input layer (two k=3 s=2 stages).
pub fn conv2d_subsampled_len(len: usize) -> usize {
    conv_out_len(conv_out_len(len))
}
