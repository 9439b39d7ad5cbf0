//! Concrete RBJ-cookbook filters: LPF/HPF/BPF/notch/peak/lo-shelf/hi-shelf,
//! each either a first-order one-pole or a cascade of `order/2` second-order
//! [`super::biquad::Biquad`] sections. Coefficient formulas are the standard
//! ones named in SPEC_FULL §4.5.1; they are not re-derived here, only
//! implemented.

use std::f32::consts::PI;

use super::biquad::{Biquad, BiquadCoefficients};

const DEFAULT_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

fn alpha(omega: f32, q: f32) -> f32 {
    omega.sin() / (2.0 * q)
}

/// Which standard second-order response a [`Biquad`] cascade realizes.
#[derive(Copy, Clone, Debug)]
pub enum FilterKind {
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
    Peak { gain_db: f32 },
    LowShelf { gain_db: f32, shelf_slope: f32 },
    HighShelf { gain_db: f32, shelf_slope: f32 },
}

fn coefficients(kind: FilterKind, cutoff_hz: f32, sample_rate: u32, q: f32) -> BiquadCoefficients {
    let omega = 2.0 * PI * cutoff_hz / sample_rate as f32;
    let cos_omega = omega.cos();
    let alpha = alpha(omega, q);

    match kind {
        FilterKind::Lowpass => {
            let b0 = (1.0 - cos_omega) / 2.0;
            let b1 = 1.0 - cos_omega;
            let b2 = (1.0 - cos_omega) / 2.0;
            let a0 = 1.0 + alpha;
            let a1 = -2.0 * cos_omega;
            let a2 = 1.0 - alpha;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
        FilterKind::Highpass => {
            let b0 = (1.0 + cos_omega) / 2.0;
            let b1 = -(1.0 + cos_omega);
            let b2 = (1.0 + cos_omega) / 2.0;
            let a0 = 1.0 + alpha;
            let a1 = -2.0 * cos_omega;
            let a2 = 1.0 - alpha;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
        FilterKind::Bandpass => {
            let b0 = alpha;
            let b1 = 0.0;
            let b2 = -alpha;
            let a0 = 1.0 + alpha;
            let a1 = -2.0 * cos_omega;
            let a2 = 1.0 - alpha;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
        FilterKind::Notch => {
            let b0 = 1.0;
            let b1 = -2.0 * cos_omega;
            let b2 = 1.0;
            let a0 = 1.0 + alpha;
            let a1 = -2.0 * cos_omega;
            let a2 = 1.0 - alpha;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
        FilterKind::Peak { gain_db } => {
            let amp = 10f32.powf(gain_db / 40.0);
            let b0 = 1.0 + alpha * amp;
            let b1 = -2.0 * cos_omega;
            let b2 = 1.0 - alpha * amp;
            let a0 = 1.0 + alpha / amp;
            let a1 = -2.0 * cos_omega;
            let a2 = 1.0 - alpha / amp;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
        FilterKind::LowShelf {
            gain_db,
            shelf_slope,
        } => {
            let amp = 10f32.powf(gain_db / 40.0);
            let shelf_alpha = (omega.sin() / 2.0)
                * ((amp + 1.0 / amp) * (1.0 / shelf_slope - 1.0) + 2.0).sqrt();
            let two_sqrt_a_alpha = 2.0 * amp.sqrt() * shelf_alpha;

            let b0 = amp * ((amp + 1.0) - (amp - 1.0) * cos_omega + two_sqrt_a_alpha);
            let b1 = 2.0 * amp * ((amp - 1.0) - (amp + 1.0) * cos_omega);
            let b2 = amp * ((amp + 1.0) - (amp - 1.0) * cos_omega - two_sqrt_a_alpha);
            let a0 = (amp + 1.0) + (amp - 1.0) * cos_omega + two_sqrt_a_alpha;
            let a1 = -2.0 * ((amp - 1.0) + (amp + 1.0) * cos_omega);
            let a2 = (amp + 1.0) + (amp - 1.0) * cos_omega - two_sqrt_a_alpha;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
        FilterKind::HighShelf {
            gain_db,
            shelf_slope,
        } => {
            let amp = 10f32.powf(gain_db / 40.0);
            let shelf_alpha = (omega.sin() / 2.0)
                * ((amp + 1.0 / amp) * (1.0 / shelf_slope - 1.0) + 2.0).sqrt();
            let two_sqrt_a_alpha = 2.0 * amp.sqrt() * shelf_alpha;

            let b0 = amp * ((amp + 1.0) + (amp - 1.0) * cos_omega + two_sqrt_a_alpha);
            let b1 = -2.0 * amp * ((amp - 1.0) + (amp + 1.0) * cos_omega);
            let b2 = amp * ((amp + 1.0) + (amp - 1.0) * cos_omega - two_sqrt_a_alpha);
            let a0 = (amp + 1.0) - (amp - 1.0) * cos_omega + two_sqrt_a_alpha;
            let a1 = 2.0 * ((amp - 1.0) - (amp + 1.0) * cos_omega);
            let a2 = (amp + 1.0) - (amp - 1.0) * cos_omega - two_sqrt_a_alpha;
            BiquadCoefficients::normalize(b0, b1, b2, a0, a1, a2)
        }
    }
}

/// A cascade of identical second-order sections realizing an `order`-th
/// order filter. `order` is expected to be even; odd orders round their
/// cascade length up but report latency using the spec's `2 * (order / 2)`
/// formula verbatim (so an odd order's last half-order of rolloff is "free"
/// in the reported latency, matching the distilled spec's literal integer
/// division).
#[derive(Clone)]
pub struct CascadedFilter {
    order: usize,
    stages: Vec<Biquad>,
    channels: usize,
}

impl CascadedFilter {
    pub fn new(kind: FilterKind, cutoff_hz: f32, sample_rate: u32, channels: usize, order: usize) -> Self {
        let stage_count = (order + 1) / 2;
        let coeffs = coefficients(kind, cutoff_hz, sample_rate, DEFAULT_Q);
        Self {
            order,
            stages: (0..stage_count.max(1))
                .map(|_| Biquad::new(channels, coeffs))
                .collect(),
            channels,
        }
    }

    pub fn reinit(&mut self, kind: FilterKind, cutoff_hz: f32, sample_rate: u32) {
        let coeffs = coefficients(kind, cutoff_hz, sample_rate, DEFAULT_Q);
        for stage in &mut self.stages {
            stage.reinit(coeffs);
        }
    }

    pub fn init(&mut self, kind: FilterKind, cutoff_hz: f32, sample_rate: u32) {
        let coeffs = coefficients(kind, cutoff_hz, sample_rate, DEFAULT_Q);
        for stage in &mut self.stages {
            stage.init(coeffs);
        }
    }

    pub fn latency(&self) -> usize {
        2 * (self.order / 2)
    }

    pub fn process(&mut self, input: &[f32], output: &mut [f32], frame_count: usize) {
        if self.stages.len() == 1 {
            self.stages[0].process(input, output, self.channels, frame_count);
            return;
        }

        let mut scratch = input.to_vec();
        for (i, stage) in self.stages.iter_mut().enumerate() {
            if i == self.stages.len() - 1 {
                stage.process(&scratch, output, self.channels, frame_count);
            } else {
                let input_snapshot = scratch.clone();
                stage.process(&input_snapshot, &mut scratch, self.channels, frame_count);
            }
        }
    }
}

/// First-order one-pole lowpass (LPF1).
#[derive(Clone)]
pub struct OnePoleLowpass {
    a: f32,
    b0: f32,
    state: Vec<f32>,
}

impl OnePoleLowpass {
    pub fn new(cutoff_hz: f32, sample_rate: u32, channels: usize) -> Self {
        let a = (-2.0 * PI * cutoff_hz / sample_rate as f32).exp();
        Self {
            a,
            b0: 1.0 - a,
            state: vec![0.0; channels],
        }
    }

    pub fn reinit(&mut self, cutoff_hz: f32, sample_rate: u32) {
        self.a = (-2.0 * PI * cutoff_hz / sample_rate as f32).exp();
        self.b0 = 1.0 - self.a;
    }

    pub fn latency(&self) -> usize {
        1
    }

    pub fn process(&mut self, input: &[f32], output: &mut [f32], channels: usize, frame_count: usize) {
        for frame in 0..frame_count {
            for ch in 0..channels {
                let idx = frame * channels + ch;
                let y = self.b0 * input[idx] + self.a * self.state[ch];
                self.state[ch] = y;
                output[idx] = y;
            }
        }
    }
}

/// First-order one-pole highpass (HPF1): complementary to `OnePoleLowpass`.
#[derive(Clone)]
pub struct OnePoleHighpass {
    lowpass: OnePoleLowpass,
}

impl OnePoleHighpass {
    pub fn new(cutoff_hz: f32, sample_rate: u32, channels: usize) -> Self {
        Self {
            lowpass: OnePoleLowpass::new(cutoff_hz, sample_rate, channels),
        }
    }

    pub fn latency(&self) -> usize {
        1
    }

    pub fn process(&mut self, input: &[f32], output: &mut [f32], channels: usize, frame_count: usize) {
        let mut lp = vec![0.0; input.len()];
        self.lowpass.process(input, &mut lp, channels, frame_count);
        for i in 0..input.len() {
            output[i] = input[i] - lp[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn lowpass_in_place_matches_two_buffer_form() {
        let mut a = CascadedFilter::new(FilterKind::Lowpass, 1000.0, 48_000, 1, 2);
        let mut b = CascadedFilter::new(FilterKind::Lowpass, 1000.0, 48_000, 1, 2);

        let input: Vec<f32> = (0..32).map(|i| (i as f32 * 0.2).sin()).collect();
        let mut two_buffer = vec![0.0; input.len()];
        a.process(&input, &mut two_buffer, input.len());

        let mut in_place = input.clone();
        let snapshot = in_place.clone();
        b.process(&snapshot, &mut in_place, input.len());

        for (x, y) in two_buffer.iter().zip(in_place.iter()) {
            assert_float_eq!(*x, *y, abs <= 1e-6);
        }
    }

    #[test]
    fn second_order_latency_matches_spec_formula() {
        let f = CascadedFilter::new(FilterKind::Highpass, 200.0, 48_000, 2, 4);
        assert_eq!(f.latency(), 4);
        let f2 = CascadedFilter::new(FilterKind::Highpass, 200.0, 48_000, 2, 2);
        assert_eq!(f2.latency(), 2);
    }

    #[test]
    fn lowpass_attenuates_high_frequency_tone() {
        let sample_rate = 48_000;
        let mut filt = CascadedFilter::new(FilterKind::Lowpass, 500.0, sample_rate, 1, 2);
        let n = 2048;
        let input: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * 8000.0 * i as f32 / sample_rate as f32).sin())
            .collect();
        let mut output = vec![0.0; n];
        filt.process(&input, &mut output, n);

        let tail = &output[n / 2..];
        let in_tail = &input[n / 2..];
        let out_energy: f32 = tail.iter().map(|x| x * x).sum();
        let in_energy: f32 = in_tail.iter().map(|x| x * x).sum();
        assert!(out_energy < in_energy * 0.5);
    }

    #[test]
    fn one_pole_highpass_blocks_dc() {
        let mut hpf = OnePoleHighpass::new(200.0, 48_000, 1);
        let input = vec![1.0f32; 1024];
        let mut output = vec![0.0; 1024];
        hpf.process(&input, &mut output, 1, 1024);
        assert_float_eq!(output[1023], 0.0, abs <= 1e-3);
    }
}
