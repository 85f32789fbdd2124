//! Activation quantization primitive for the 8-bit weight paths.
//!
//! Per-tensor symmetric int8: `q = round(x / scale)` clamped to the i8
//! range, with `scale = max|x| / 127` when computed dynamically. Expert
//! weight scales are precomputed by the caller; this primitive only covers
//! the activation side.

/// Quantize a tensor of activations to int8.
///
/// When `scale` is `None` the scale is computed from the input's absolute
/// maximum (dynamic quantization). Returns the quantized values and the
/// scale that restores them. An all-zero input quantizes with scale 1.0.
///
/// Saturation on a provided (static) scale is clamped, not detected; scale
/// adequacy is the caller's responsibility.
pub fn scaled_int8_quant(input: &[f32], scale: Option<f32>) -> (Vec<i8>, f32) {
    let scale = scale.unwrap_or_else(|| {
        let max_abs = input.iter().fold(0f32, |m, &v| m.max(v.abs()));
        if max_abs == 0.0 {
            1.0
        } else {
            max_abs / i8::MAX as f32
        }
    });
    let quantized = input
        .iter()
        .map(|&v| (v / scale).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
        .collect();
    (quantized, scale)
}
