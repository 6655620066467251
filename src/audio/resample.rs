//! # Streaming Sample-Rate Conversion
//!
//! Converts 16-bit PCM between two sample rates one chunk at a time. The
//! conversion is *stateful*: everything needed to continue the signal (low-pass
//! filter history, the last input sample and the fractional read position) is
//! kept in a [`ResampleState`] and carried into the next call.
//!
//! ## Why state matters:
//! Resetting between 20ms chunks restarts the interpolation phase and the
//! filter at every boundary, which is audible as a click 50 times a second.
//! With the carried state, processing two chunks back to back produces exactly
//! the same samples as processing their concatenation in one call.
//!
//! ## Method:
//! 1. **Anti-alias filter** (downsampling only): windowed-sinc FIR in Q15
//!    fixed point, cut off just below the output Nyquist frequency
//! 2. **Linear interpolation** at an exact rational step (`from / to` reduced
//!    by their GCD), so the read position never drifts
//!
//! Each direction of each call owns its own state; states are never shared.

use std::f64::consts::PI;

/// Fixed-point scale of the filter coefficients.
const Q15: i32 = 1 << 15;

/// Fraction of the output Nyquist frequency kept by the anti-alias filter.
const CUTOFF_RATIO: f64 = 0.9;

/// Carry-over state for one resampling stream.
#[derive(Debug, Clone)]
pub struct ResampleState {
    from_rate: u32,
    to_rate: u32,
    /// Output step numerator (reduced `to_rate`)
    up: i64,
    /// Input step (reduced `from_rate`)
    down: i64,
    /// Read position of the next output sample, in units of `1 / up` input
    /// samples, relative to the first sample of the next chunk
    position: i64,
    /// Last (filtered) input sample of the previous chunk
    previous: Option<i16>,
    /// Anti-alias filter, present only when downsampling
    filter: Option<LowPassFilter>,
}

impl ResampleState {
    /// Create fresh state converting `from_rate` Hz into `to_rate` Hz.
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let from = from_rate.max(1);
        let to = to_rate.max(1);
        let divisor = gcd(from, to);

        let filter = if to < from {
            Some(LowPassFilter::new(from, to))
        } else {
            None
        };

        Self {
            from_rate: from,
            to_rate: to,
            up: (to / divisor) as i64,
            down: (from / divisor) as i64,
            position: 0,
            previous: None,
            filter,
        }
    }

    /// Input rate this state was built for.
    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Whether the state converts `from_rate` into `to_rate`.
    pub fn matches(&self, from_rate: u32, to_rate: u32) -> bool {
        self.from_rate == from_rate && self.to_rate == to_rate
    }

    /// Convert one chunk, appending the output samples to `output`.
    ///
    /// Output samples whose right-hand neighbour is not available yet are
    /// deferred to the next call, so the total output over a stream does not
    /// depend on how the input was split into chunks.
    pub fn process(&mut self, input: &[i16], output: &mut Vec<i16>) {
        if input.is_empty() {
            return;
        }

        if self.up == self.down {
            output.extend_from_slice(input);
            return;
        }

        let filtered;
        let samples: &[i16] = match &mut self.filter {
            Some(filter) => {
                filtered = filter.apply(input);
                &filtered
            }
            None => input,
        };

        let count = samples.len() as i64;
        output.reserve(((count * self.up) / self.down + 1) as usize);

        // Sample at index -1 is the tail of the previous chunk
        let previous = self.previous;
        let at = |index: i64| -> i32 {
            if index < 0 {
                previous.unwrap_or(samples[0]) as i32
            } else {
                samples[index as usize] as i32
            }
        };

        loop {
            let index = self.position.div_euclid(self.up);
            let fraction = self.position.rem_euclid(self.up);
            if index + 1 >= count {
                break;
            }

            let left = at(index) as i64;
            let right = at(index + 1) as i64;
            let weighted = left * (self.up - fraction) + right * fraction;
            output.push(round_div(weighted, self.up) as i16);

            self.position += self.down;
        }

        self.position -= count * self.up;
        self.previous = samples.last().copied();
    }
}

/// Fold interleaved multi-channel samples to mono by averaging each frame.
///
/// Any trailing partial frame is ignored.
pub fn fold_to_mono(interleaved: &[i16], channels: u16, output: &mut Vec<i16>) {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        output.extend_from_slice(interleaved);
        return;
    }

    output.reserve(interleaved.len() / channels);
    for frame in interleaved.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        output.push((sum / channels as i32) as i16);
    }
}

/// Windowed-sinc low-pass FIR with history carried across chunks.
#[derive(Debug, Clone)]
struct LowPassFilter {
    /// Q15 coefficients, symmetric
    taps: Vec<i32>,
    /// Last `taps.len() - 1` input samples
    history: Vec<i16>,
}

impl LowPassFilter {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        let ratio = (from_rate as f64 / to_rate as f64).ceil() as usize;
        let half = 4 * ratio.max(1);
        let len = 2 * half + 1;

        // Normalized cutoff in cycles per input sample
        let cutoff = 0.5 * CUTOFF_RATIO * to_rate as f64 / from_rate as f64;

        let raw: Vec<f64> = (0..len)
            .map(|n| {
                let x = n as f64 - half as f64;
                let sinc = if x == 0.0 {
                    2.0 * cutoff
                } else {
                    (2.0 * PI * cutoff * x).sin() / (PI * x)
                };
                // Blackman window
                let w = 0.42 - 0.5 * (2.0 * PI * n as f64 / (len - 1) as f64).cos()
                    + 0.08 * (4.0 * PI * n as f64 / (len - 1) as f64).cos();
                sinc * w
            })
            .collect();

        let gain: f64 = raw.iter().sum();
        let taps = raw
            .iter()
            .map(|c| (c / gain * Q15 as f64).round() as i32)
            .collect();

        Self {
            taps,
            history: vec![0; len - 1],
        }
    }

    fn apply(&mut self, input: &[i16]) -> Vec<i16> {
        let keep = self.history.len();
        let mut extended = Vec::with_capacity(keep + input.len());
        extended.extend_from_slice(&self.history);
        extended.extend_from_slice(input);

        let mut output = Vec::with_capacity(input.len());
        for window in extended.windows(self.taps.len()) {
            let acc: i64 = window
                .iter()
                .rev()
                .zip(&self.taps)
                .map(|(&s, &c)| s as i64 * c as i64)
                .sum();
            let value = round_div(acc, Q15 as i64);
            output.push(value.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
        }

        self.history.copy_from_slice(&extended[extended.len() - keep..]);
        output
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}

/// Integer division rounding half away from zero.
fn round_div(value: i64, divisor: i64) -> i64 {
    if value >= 0 {
        (value + divisor / 2) / divisor
    } else {
        (value - divisor / 2) / divisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resample(input: &[i16], state: &mut ResampleState) -> Vec<i16> {
        let mut output = Vec::new();
        state.process(input, &mut output);
        output
    }

    fn sine(len: usize, rate: u32, freq: f64, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|i| ((2.0 * PI * freq * i as f64 / rate as f64).sin() * amplitude) as i16)
            .collect()
    }

    #[test]
    fn test_chunked_output_matches_single_pass_downsampling() {
        let signal = sine(960, 48000, 440.0, 12000.0);

        let mut whole = ResampleState::new(48000, 8000);
        let expected = resample(&signal, &mut whole);

        let mut chunked = ResampleState::new(48000, 8000);
        let mut actual = resample(&signal[..480], &mut chunked);
        actual.extend(resample(&signal[480..], &mut chunked));

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_chunked_output_matches_single_pass_upsampling() {
        let signal = sine(320, 8000, 300.0, 9000.0);

        let mut whole = ResampleState::new(8000, 48000);
        let expected = resample(&signal, &mut whole);

        let mut chunked = ResampleState::new(8000, 48000);
        let mut actual = Vec::new();
        for chunk in signal.chunks(160) {
            chunked.process(chunk, &mut actual);
        }

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_uneven_chunks_match_single_pass() {
        let signal = sine(1000, 44100, 1000.0, 8000.0);

        let mut whole = ResampleState::new(44100, 8000);
        let expected = resample(&signal, &mut whole);

        let mut chunked = ResampleState::new(44100, 8000);
        let mut actual = Vec::new();
        for chunk in signal.chunks(137) {
            chunked.process(chunk, &mut actual);
        }

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let mut state = ResampleState::new(48000, 8000);
        let mut total = 0;
        for _ in 0..50 {
            total += resample(&vec![0i16; 480], &mut state).len();
        }
        // 50 × 10ms at 8kHz, minus at most one deferred sample
        assert!((3999..=4000).contains(&total), "got {}", total);
    }

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut state = ResampleState::new(8000, 8000);
        let input = vec![1, -2, 3, -4];
        assert_eq!(resample(&input, &mut state), input);
    }

    #[test]
    fn test_low_tone_survives_downsampling() {
        let signal = sine(4800, 48000, 400.0, 10000.0);
        let mut state = ResampleState::new(48000, 8000);
        let output = resample(&signal, &mut state);
        let peak = output[100..].iter().map(|s| s.abs()).max().unwrap_or(0);
        assert!(peak > 9000, "peak {}", peak);
    }

    #[test]
    fn test_fold_to_mono_averages_pairs() {
        let mut mono = Vec::new();
        fold_to_mono(&[100, 300, -50, 50, 7], 2, &mut mono);
        assert_eq!(mono, vec![200, 0]);
    }

    #[test]
    fn test_fresh_states_are_independent() {
        let signal = sine(480, 48000, 440.0, 12000.0);
        let mut used = ResampleState::new(48000, 8000);
        resample(&signal, &mut used);

        let mut fresh = ResampleState::new(48000, 8000);
        let again = resample(&signal, &mut fresh);
        assert_eq!(again, resample(&signal, &mut ResampleState::new(48000, 8000)));
        assert!(fresh.matches(48000, 8000));
        assert!(!fresh.matches(8000, 48000));
    }
}
