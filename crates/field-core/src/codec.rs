//! Packing of `f32` values into four 8-bit channels
//!
//! Particle-state textures only hold 8 bits per channel, so every coordinate is stored as the
//! bit pattern of an IEEE single split across RGBA:
//!
//! - r: biased exponent (0 encodes zero)
//! - g: mantissa bits 22..15
//! - b: mantissa bits 14..7
//! - a: mantissa bits 6..0 shifted left by one, sign in bit 0
//!
//! The decoded value is `sign * (1 + g/2^8 + b/2^16 + (a >> 1)/2^23) * 2^(r - 127)`.
//!
//! NOTE: `encode_float`/`decode_float` in `update_kernel.wgsl` implement the same layout with
//! `bitcast`. Both sides must change together or sampled velocities decode to garbage.
//!
//! Normal values round-trip bit-exactly, subnormals flush to zero. Non-finite input has no
//! encoding; the kernel recycles such particles before they reach the codec.

/// One texel worth of packed float
pub type PackedFloat = [u8; 4];

/// Pack a finite `f32` into four channels.
pub fn encode(value: f32) -> PackedFloat {
    debug_assert!(value.is_finite(), "cannot pack non-finite value {value}");

    let bits = value.to_bits();
    let exponent = (bits >> 23) & 0xff;
    if exponent == 0 {
        return [0; 4];
    }

    let mantissa = bits & 0x7f_ffff;
    [
        exponent as u8,
        (mantissa >> 15) as u8,
        ((mantissa >> 7) & 0xff) as u8,
        (((mantissa & 0x7f) << 1) | (bits >> 31)) as u8,
    ]
}

/// Unpack four channels written by [`encode`] (or by the update kernel).
pub fn decode(packed: PackedFloat) -> f32 {
    let [exponent, high, mid, low] = packed.map(u32::from);
    if exponent == 0 {
        return 0.0;
    }

    let bits = ((low & 1) << 31) | (exponent << 23) | (high << 15) | (mid << 7) | (low >> 1);
    f32::from_bits(bits)
}

/// Pack a slice of values, one texel each.
pub fn encode_all(values: &[f32]) -> Vec<PackedFloat> {
    values.iter().copied().map(encode).collect()
}

/// Unpack a slice of texels.
pub fn decode_all(texels: &[PackedFloat]) -> Vec<f32> {
    texels.iter().copied().map(decode).collect()
}
