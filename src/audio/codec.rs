//! # G.711 μ-law Codec
//!
//! Converts between the 8-bit companded samples carried on the telephony wire
//! and 16-bit signed linear PCM used by the room.
//!
//! ## Algorithm:
//! - **Compand**: add a bias of 0x84, find the segment (exponent) from the
//!   highest set bit, keep 4 mantissa bits, then invert all bits
//! - **Decompand**: invert, rebuild `((mantissa << 3) + bias) << exponent`,
//!   remove the bias and apply the sign
//!
//! Decoding goes through a 256-entry table built at compile time, so the hot
//! ingress path is a single lookup per sample.
//!
//! The decoded value sits in the middle of the quantization interval, so the
//! round-trip error of `decompand(compand(x))` never exceeds half a step of
//! the segment `x` falls into.

/// Bias added before segment search (ITU-T G.711 μ-law).
const BIAS: i32 = 0x84;

/// Largest magnitude that can be encoded without overflowing the top segment.
const CLIP: i32 = 32635;

/// μ-law byte that decodes to digital silence.
#[cfg(test)]
pub const MULAW_SILENCE: u8 = 0xFF;

/// Decode table indexed by the raw μ-law byte.
static DECODE_TABLE: [i16; 256] = build_decode_table();

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = expand(i as u8);
        i += 1;
    }
    table
}

const fn expand(byte: u8) -> i16 {
    let inverted = !byte;
    let sign = inverted & 0x80;
    let exponent = ((inverted >> 4) & 0x07) as i32;
    let mantissa = (inverted & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compand one 16-bit linear PCM sample into a μ-law byte.
pub fn compand(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    // Segment = position of the highest set bit above bit 7
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decompand one μ-law byte into a 16-bit linear PCM sample.
#[inline]
pub fn decompand(byte: u8) -> i16 {
    DECODE_TABLE[byte as usize]
}

/// Decompand a whole wire chunk, appending the linear samples to `output`.
pub fn decompand_into(input: &[u8], output: &mut Vec<i16>) {
    output.reserve(input.len());
    output.extend(input.iter().map(|&byte| decompand(byte)));
}

/// Compand linear samples, appending the μ-law bytes to `output`.
pub fn compand_into(input: &[i16], output: &mut Vec<u8>) {
    output.reserve(input.len());
    output.extend(input.iter().map(|&sample| compand(sample)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_encodes_to_0xff() {
        assert_eq!(compand(0), MULAW_SILENCE);
        assert_eq!(decompand(MULAW_SILENCE), 0);
    }

    #[test]
    fn test_known_values() {
        // Extremes of the scale
        assert_eq!(decompand(0x80), 32124);
        assert_eq!(decompand(0x00), -32124);
        assert_eq!(compand(i16::MAX), 0x80);
        assert_eq!(compand(i16::MIN), 0x00);
    }

    #[test]
    fn test_roundtrip_error_bounded_by_quantization() {
        for sample in (i16::MIN..=i16::MAX).step_by(7) {
            let decoded = decompand(compand(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            let bound = (sample as i32).abs().min(CLIP) / 32 + 5 + ((sample as i32).abs() - CLIP).max(0);
            assert!(
                error <= bound,
                "sample {} decoded to {} (error {} > {})",
                sample, decoded, error, bound
            );
        }
    }

    #[test]
    fn test_byte_roundtrip_is_stable() {
        for byte in 0..=255u8 {
            // 0x7F is negative zero; it re-encodes as positive zero
            if byte == 0x7F {
                assert_eq!(compand(decompand(byte)), MULAW_SILENCE);
                continue;
            }
            assert_eq!(compand(decompand(byte)), byte, "byte {:#04x}", byte);
        }
    }

    #[test]
    fn test_batch_helpers_are_deterministic() {
        let wire: Vec<u8> = (0..160).map(|i| (i * 37 % 256) as u8).collect();

        let mut first = Vec::new();
        let mut second = Vec::new();
        decompand_into(&wire, &mut first);
        decompand_into(&wire, &mut second);
        assert_eq!(first, second);
        assert_eq!(first.len(), 160);

        let mut encoded = Vec::new();
        compand_into(&first, &mut encoded);
        assert_eq!(encoded.len(), 160);
    }
}
