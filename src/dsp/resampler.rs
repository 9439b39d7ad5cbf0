//! Sample-rate conversion: a linear resampler with integer/fractional time
//! accumulators (§4.6), plus an optional higher-quality backend built on
//! `rubato` (§4.6.1) selected at construction time via [`ResamplerAlgorithm`].

use crate::dsp::filters::{CascadedFilter, FilterKind};
use crate::error::{Error, Result};

const LPF_ORDER: usize = 4;
const LPF_NYQUIST_FACTOR: f32 = 0.9;

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Linear interpolation resampler driven by the integer/fractional time
/// accumulator scheme named in the spec.
pub struct LinearResampler {
    channels: usize,
    rate_in: u32,
    rate_out: u32,

    in_advance_int: u64,
    in_advance_frac: u64,
    in_time_int: u64,
    in_time_frac: u64,

    x0: Vec<f32>,
    x1: Vec<f32>,

    lpf: Vec<CascadedFilter>,
}

impl LinearResampler {
    pub fn new(channels: usize, rate_in: u32, rate_out: u32) -> Self {
        let mut r = Self {
            channels,
            rate_in: 1,
            rate_out: 1,
            in_advance_int: 1,
            in_advance_frac: 0,
            in_time_int: 1,
            in_time_frac: 0,
            x0: vec![0.0; channels],
            x1: vec![0.0; channels],
            lpf: Vec::new(),
        };
        r.set_rate(rate_in, rate_out);
        r
    }

    /// Simplify `rate_in:rate_out` by their GCD and rebuild the anti-alias
    /// low-pass chain for the new ratio. State (`x0`/`x1`, time accumulators)
    /// is intentionally preserved across a rate change, matching `reinit`
    /// semantics elsewhere in this crate's filters.
    pub fn set_rate(&mut self, rate_in: u32, rate_out: u32) {
        let g = gcd(rate_in.max(1), rate_out.max(1)).max(1);
        self.rate_in = (rate_in / g).max(1);
        self.rate_out = (rate_out / g).max(1);

        self.in_advance_int = (self.rate_in / self.rate_out) as u64;
        self.in_advance_frac = (self.rate_in % self.rate_out) as u64;

        let lower_rate = self.rate_in.min(self.rate_out);
        let higher_rate = self.rate_in.max(self.rate_out);
        let cutoff = lower_rate as f32 * 0.5 * LPF_NYQUIST_FACTOR;

        self.lpf = vec![CascadedFilter::new(
            FilterKind::Lowpass,
            cutoff,
            higher_rate,
            self.channels,
            LPF_ORDER,
        )];
    }

    fn lpf_latency(&self) -> usize {
        self.lpf.iter().map(|f| f.latency()).sum()
    }

    /// Latency expressed in input frames: `1 + sum(lpf_latency)`.
    pub fn latency_in_input_frames(&self) -> usize {
        1 + self.lpf_latency()
    }

    /// Latency expressed in output frames.
    pub fn latency_in_output_frames(&self) -> usize {
        (self.latency_in_input_frames() as u64 * self.rate_out as u64 / self.rate_in.max(1) as u64)
            as usize
    }

    /// How many input frames `process(..., output_frame_count)` will
    /// actually read, given the resampler's current accumulator state.
    /// Simulated step-by-step rather than closed-form: the very next output
    /// frame consumes whatever `in_time_int` currently holds (which, before
    /// the first call, seeds the "1 input frame" of latency the resampler
    /// carries even at a 1:1 ratio — see `process`), not the steady-state
    /// `in_advance_int` every later frame settles into.
    pub fn required_input_frame_count(&self, output_frame_count: usize) -> usize {
        let mut time_int = self.in_time_int;
        let mut time_frac = self.in_time_frac;
        let mut consumed = 0u64;

        for _ in 0..output_frame_count {
            consumed += time_int;
            time_int = self.in_advance_int;
            time_frac += self.in_advance_frac;
            if time_frac >= self.rate_out.max(1) as u64 {
                time_frac -= self.rate_out.max(1) as u64;
                time_int += 1;
            }
        }
        consumed as usize
    }

    /// Iterative simulation of the accumulator: how many output frames can be
    /// produced by consuming exactly `input_frame_count` input frames.
    pub fn expected_output_frame_count(&self, input_frame_count: usize) -> usize {
        let mut remaining_in = input_frame_count as u64;
        let mut time_int = self.in_time_int;
        let mut time_frac = self.in_time_frac;
        let mut out_count = 0u64;

        loop {
            if time_int > remaining_in {
                break;
            }
            remaining_in -= time_int;
            out_count += 1;
            time_int = self.in_advance_int;
            time_frac += self.in_advance_frac;
            if time_frac >= self.rate_out as u64 {
                time_frac -= self.rate_out as u64;
                time_int += 1;
            }
        }
        out_count as usize
    }

    fn load_next_input_frame(&mut self, input: &[f32], frame_index: usize) {
        std::mem::swap(&mut self.x0, &mut self.x1);
        let channels = self.channels;
        let start = frame_index * channels;
        self.x1.copy_from_slice(&input[start..start + channels]);

        for lpf in &mut self.lpf {
            if self.rate_in > self.rate_out {
                let snapshot = self.x1.clone();
                lpf.process(&snapshot, &mut self.x1, 1);
            }
        }
    }

    /// Resample `input` (interleaved, `input_frame_count` frames) into
    /// `output` (interleaved, room for `output_frame_count` frames). Returns
    /// `(frames_consumed, frames_produced)`. Passing an empty `output` slice
    /// (`output_frame_count == 0`) with nonzero `input_frame_count` just
    /// advances internal state — the "seek without producing audio" mode
    /// named in the spec.
    pub fn process(
        &mut self,
        input: &[f32],
        input_frame_count: usize,
        output: &mut [f32],
        output_frame_count: usize,
    ) -> (usize, usize) {
        let channels = self.channels;
        let mut in_cursor = 0usize;
        let mut out_cursor = 0usize;

        while out_cursor < output_frame_count {
            while self.in_time_int > 0 {
                if in_cursor >= input_frame_count {
                    return (in_cursor, out_cursor);
                }
                self.load_next_input_frame(input, in_cursor);
                in_cursor += 1;
                self.in_time_int -= 1;
            }

            let t = self.in_time_frac as f32 / self.rate_out.max(1) as f32;
            let mut frame = vec![0.0f32; channels];
            for ch in 0..channels {
                frame[ch] = self.x0[ch] * (1.0 - t) + self.x1[ch] * t;
            }
            if self.rate_out > self.rate_in {
                for lpf in &mut self.lpf {
                    let snapshot = frame.clone();
                    lpf.process(&snapshot, &mut frame, 1);
                }
            }
            let out_start = out_cursor * channels;
            output[out_start..out_start + channels].copy_from_slice(&frame);

            out_cursor += 1;
            self.in_time_int += self.in_advance_int;
            self.in_time_frac += self.in_advance_frac;
            if self.in_time_frac >= self.rate_out as u64 {
                self.in_time_frac -= self.rate_out as u64;
                self.in_time_int += 1;
            }
        }

        (in_cursor, out_cursor)
    }
}

/// Which resampling implementation a [`Resampler`] dispatches to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResamplerAlgorithm {
    Linear,
    SincHighQuality,
}

enum Backend {
    Linear(LinearResampler),
    Sinc {
        channels: usize,
        rate_in: u32,
        rate_out: u32,
        inner: rubato::SincFixedIn<f32>,
        input_chunk_size: usize,
    },
}

/// Public resampler facade. Exposes the same frame-count-query semantics
/// regardless of which backend is selected.
pub struct Resampler {
    backend: Backend,
}

impl Resampler {
    pub fn new(algorithm: ResamplerAlgorithm, channels: usize, rate_in: u32, rate_out: u32) -> Result<Self> {
        let backend = match algorithm {
            ResamplerAlgorithm::Linear => Backend::Linear(LinearResampler::new(channels, rate_in, rate_out)),
            ResamplerAlgorithm::SincHighQuality => Self::build_sinc(channels, rate_in, rate_out)?,
        };
        Ok(Self { backend })
    }

    fn build_sinc(channels: usize, rate_in: u32, rate_out: u32) -> Result<Backend> {
        if rate_in == 0 || rate_out == 0 {
            return Err(Error::NoBackend);
        }
        let ratio = rate_out as f64 / rate_in as f64;
        let params = rubato::InterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: rubato::InterpolationType::Linear,
            oversampling_factor: 256,
            window: rubato::WindowFunction::BlackmanHarris2,
        };
        let chunk_size = 1024;
        let inner = rubato::SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, channels)
            .map_err(|_e| Error::NoBackend)?;
        Ok(Backend::Sinc {
            channels,
            rate_in,
            rate_out,
            inner,
            input_chunk_size: chunk_size,
        })
    }

    pub fn set_rate(&mut self, rate_in: u32, rate_out: u32) -> Result<()> {
        match &mut self.backend {
            Backend::Linear(lin) => {
                lin.set_rate(rate_in, rate_out);
                Ok(())
            }
            Backend::Sinc { channels, .. } => {
                let channels = *channels;
                self.backend = Self::build_sinc(channels, rate_in, rate_out)?;
                Ok(())
            }
        }
    }

    pub fn required_input_frame_count(&self, output_frame_count: usize) -> usize {
        match &self.backend {
            Backend::Linear(lin) => lin.required_input_frame_count(output_frame_count),
            Backend::Sinc { input_chunk_size, .. } => *input_chunk_size,
        }
    }

    pub fn expected_output_frame_count(&self, input_frame_count: usize) -> usize {
        match &self.backend {
            Backend::Linear(lin) => lin.expected_output_frame_count(input_frame_count),
            Backend::Sinc {
                rate_in, rate_out, ..
            } => (input_frame_count as u64 * *rate_out as u64 / *rate_in as u64) as usize,
        }
    }

    pub fn latency_in_input_frames(&self) -> usize {
        match &self.backend {
            Backend::Linear(lin) => lin.latency_in_input_frames(),
            Backend::Sinc { .. } => 0,
        }
    }

    /// Resample interleaved `input` into interleaved `output`. Returns
    /// `(frames_consumed, frames_produced)`.
    pub fn process(
        &mut self,
        input: &[f32],
        input_frame_count: usize,
        output: &mut [f32],
        output_frame_count: usize,
    ) -> Result<(usize, usize)> {
        match &mut self.backend {
            Backend::Linear(lin) => Ok(lin.process(input, input_frame_count, output, output_frame_count)),
            Backend::Sinc {
                channels,
                inner,
                input_chunk_size,
                ..
            } => {
                let channels = *channels;
                let take = input_frame_count.min(*input_chunk_size);
                let mut planar_in: Vec<Vec<f32>> = vec![vec![0.0; take]; channels];
                for frame in 0..take {
                    for ch in 0..channels {
                        planar_in[ch][frame] = input[frame * channels + ch];
                    }
                }

                let planar_out = rubato::Resampler::process(inner, &planar_in, None)
                    .map_err(|_e| Error::InvalidOperation)?;

                let produced = planar_out.first().map(|c| c.len()).unwrap_or(0).min(output_frame_count);
                for frame in 0..produced {
                    for ch in 0..channels {
                        output[frame * channels + ch] = planar_out[ch][frame];
                    }
                }
                Ok((take, produced))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_ratio_is_near_identity_after_priming() {
        let mut r = LinearResampler::new(1, 48_000, 48_000);
        let input: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let mut output = vec![0.0; 64];
        let (consumed, produced) = r.process(&input, input.len(), &mut output, output.len());
        assert_eq!(consumed, 64);
        assert_eq!(produced, 64);
    }

    #[test]
    fn upsampling_produces_more_frames_than_it_consumes() {
        let mut r = LinearResampler::new(1, 24_000, 48_000);
        let input: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let mut output = vec![0.0; 256];
        let (consumed, produced) = r.process(&input, input.len(), &mut output, 60);
        assert!(consumed <= 32);
        assert_eq!(produced, 60);
    }

    #[test]
    fn downsampling_consumes_more_frames_than_it_produces() {
        let mut r = LinearResampler::new(1, 48_000, 24_000);
        let input: Vec<f32> = (0..256).map(|i| i as f32 * 0.01).collect();
        let mut output = vec![0.0; 64];
        let (consumed, produced) = r.process(&input, input.len(), &mut output, 32);
        assert_eq!(produced, 32);
        assert!(consumed > produced);
    }

    #[test]
    fn required_input_frame_count_is_nondecreasing_in_output() {
        let r = LinearResampler::new(2, 44_100, 48_000);
        let small = r.required_input_frame_count(10);
        let large = r.required_input_frame_count(100);
        assert!(large > small);
    }

    #[test]
    fn sinc_backend_reports_no_backend_for_zero_rate() {
        let err = Resampler::new(ResamplerAlgorithm::SincHighQuality, 2, 0, 48_000).unwrap_err();
        assert_eq!(err, Error::NoBackend);
    }

    /// Testable Property 3: `required_input_frame_count(n)` must predict the
    /// exact number of input frames `process` consumes to produce `n`
    /// output frames, for every n in [1, 1024]. Checked against a fresh
    /// resampler per `n` (each call mutates the accumulator, so a shared
    /// instance across the range wouldn't isolate n's prediction from the
    /// previous iteration's leftover state) and against three rate ratios.
    #[test]
    fn required_input_frame_count_matches_actual_consumption() {
        for &(rate_in, rate_out) in &[(48_000, 48_000), (48_000, 24_000), (24_000, 48_000)] {
            for n in 1..=1024usize {
                let query = LinearResampler::new(1, rate_in, rate_out);
                let required = query.required_input_frame_count(n);

                let mut r = LinearResampler::new(1, rate_in, rate_out);
                let input = vec![0.0f32; required];
                let mut output = vec![0.0f32; n];
                let (consumed, produced) = r.process(&input, input.len(), &mut output, n);

                assert_eq!(consumed, required, "rate {}/{} n={}", rate_in, rate_out, n);
                assert_eq!(produced, n, "rate {}/{} n={}", rate_in, rate_out, n);
            }
        }
    }

    /// Testable Property 4: `expected_output_frame_count(n)` must predict
    /// the exact number of output frames produced by consuming exactly `n`
    /// input frames, for every n in [1, 1024].
    #[test]
    fn expected_output_frame_count_matches_actual_production() {
        for &(rate_in, rate_out) in &[(48_000, 48_000), (48_000, 24_000), (24_000, 48_000)] {
            for n in 1..=1024usize {
                let query = LinearResampler::new(1, rate_in, rate_out);
                let expected = query.expected_output_frame_count(n);

                let mut r = LinearResampler::new(1, rate_in, rate_out);
                let input = vec![0.0f32; n];
                // Generous output capacity: production must be bounded by
                // the input actually available, not by output room.
                let mut output = vec![0.0f32; expected + 8];
                let (consumed, produced) = r.process(&input, n, &mut output, expected + 8);

                assert_eq!(produced, expected, "rate {}/{} n={}", rate_in, rate_out, n);
                assert!(consumed <= n, "rate {}/{} n={}", rate_in, rate_out, n);
            }
        }
    }

    /// Scenario S3: 48 -> 24 kHz downsample of a 48-frame ramp. Output frame
    /// count must match `expected_output_frame_count(48) == 24` exactly, and
    /// every produced sample must be finite and track the ramp's trend
    /// (exact sample values are only pinned "within the LPF group delay
    /// budget" per spec, not bit-exactly).
    #[test]
    fn s3_downsample_48_to_24_khz_matches_expected_frame_count() {
        let mut r = LinearResampler::new(1, 48_000, 24_000);
        let input: Vec<f32> = (0..48).map(|i| i as f32 / 48.0).collect();

        let expected = r.expected_output_frame_count(48);
        assert_eq!(expected, 24);

        let mut output = vec![0.0f32; expected];
        let (consumed, produced) = r.process(&input, 48, &mut output, expected);

        assert_eq!(produced, 24);
        assert!(consumed <= 48);
        assert!(output.iter().all(|s| s.is_finite()));
        // The ramp climbs from 0 toward 1; the tail of the downsampled
        // output should still sit in the upper half of that range once the
        // LPF's group delay has flushed through.
        assert!(output[output.len() - 1] > 0.5);
    }
}
