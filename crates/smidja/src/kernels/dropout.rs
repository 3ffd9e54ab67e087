//! Deterministic inverted dropout.
//!
//! The mask is a pure function of (flat element index, seed), so the
//! forward and backward passes of `fused_softmax` rebuild the identical
//! mask without ever storing it. The same integer hash is emitted into the
//! accelerator's WGSL source so all three backends agree bit-for-bit on
//! which elements drop.

/// 32-bit finalizer hash (lowbias32). Cheap enough for one call per
/// element and expressible in WGSL's u32 arithmetic verbatim.
#[inline]
pub fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Uniform value in [0, 1) derived from an element coordinate and seed.
#[inline]
pub fn uniform_at(index: usize, seed: u32) -> f32 {
    let h = hash_u32((index as u32) ^ hash_u32(seed));
    (h >> 8) as f32 * (1.0 / (1 << 24) as f32)
}

/// Inverted-dropout multiplier for one element: `0` when dropped,
/// `1 / (1 - rate)` when kept. A rate of zero keeps everything at unit
/// scale.
#[inline]
pub fn scale_at(index: usize, seed: u32, rate: f32) -> f32 {
    if rate <= 0.0 {
        return 1.0;
    }
    if uniform_at(index, seed) < rate {
        0.0
    } else {
        1.0 / (1.0 - rate)
    }
}

/// WGSL twin of [`hash_u32`]/[`scale_at`], spliced into shader templates
/// that apply dropout on the device.
pub const WGSL_DROPOUT: &str = r#"
fn hash_u32(v: u32) -> u32 {
    var x = v;
    x ^= x >> 16u;
    x *= 0x7feb352du;
    x ^= x >> 15u;
    x *= 0x846ca68bu;
    x ^= x >> 16u;
    return x;
}

fn dropout_scale(index: u32, seed: u32, rate: f32) -> f32 {
    if (rate <= 0.0) {
        return 1.0;
    }
    let h = hash_u32(index ^ hash_u32(seed));
    let u = f32(h >> 8u) * (1.0 / 16777216.0);
    if (u < rate) {
        return 0.0;
    }
    return 1.0 / (1.0 - rate);
}
"#;
