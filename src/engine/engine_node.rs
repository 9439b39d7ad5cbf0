//! The shared DSP chain embedded in both [`crate::engine::sound::Sound`] and
//! [`crate::engine::group::SoundGroup`] (§4.4): resample → fade → spatialize
//! → pan. `Sound` drives it from a freshly decoded/streamed buffer at the
//! source's native channel count; `SoundGroup` drives it from the
//! already-mixed signal the graph handed to its input bus, applying a second
//! round of the same stages on top (§4.4.1).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::dsp::fader::Fader;
use crate::dsp::panner::{PanMode, Panner};
use crate::dsp::resampler::{Resampler, ResamplerAlgorithm};
use crate::dsp::spatializer::{Position, Spatializer};
use crate::error::Result;

/// Control-thread-writable state shared between an `EngineNode`'s owning
/// handle (`Sound`/`SoundGroup`) and its render-thread `Processor`. Plain
/// atomics throughout, matching `graph::node::OutputBus`'s volume field —
/// the render thread must never block on a control-thread write.
pub struct EngineNodeShared {
    pan_bits: AtomicU32,
    pitch_bits: AtomicU32,
    pitch_disabled: AtomicBool,
    is_spatial: AtomicBool,
    position: [AtomicU32; 3],
    pending_fade: Mutex<Option<FadeRequest>>,
}

#[derive(Copy, Clone)]
struct FadeRequest {
    volume_begin: f32,
    volume_end: f32,
    length_in_frames: u64,
}

impl EngineNodeShared {
    pub fn new() -> Self {
        Self {
            pan_bits: AtomicU32::new(0.0f32.to_bits()),
            pitch_bits: AtomicU32::new(1.0f32.to_bits()),
            pitch_disabled: AtomicBool::new(false),
            is_spatial: AtomicBool::new(false),
            position: [
                AtomicU32::new(0.0f32.to_bits()),
                AtomicU32::new(0.0f32.to_bits()),
                AtomicU32::new(0.0f32.to_bits()),
            ],
            pending_fade: Mutex::new(None),
        }
    }

    /// Immediate volume change: equivalent to a zero-length fade to `volume`.
    pub fn set_volume(&self, volume: f32) {
        self.fade(volume, volume, 0);
    }

    pub fn fade(&self, volume_begin: f32, volume_end: f32, length_in_frames: u64) {
        *self.pending_fade.lock().unwrap() = Some(FadeRequest {
            volume_begin,
            volume_end,
            length_in_frames,
        });
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan_bits.store(pan.to_bits(), Ordering::Relaxed);
    }

    pub fn set_pitch(&self, pitch: f32) {
        self.pitch_bits.store(pitch.max(0.01).to_bits(), Ordering::Relaxed);
    }

    pub fn set_pitch_disabled(&self, disabled: bool) {
        self.pitch_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn set_spatial(&self, spatial: bool) {
        self.is_spatial.store(spatial, Ordering::Relaxed);
    }

    pub fn is_spatial(&self) -> bool {
        self.is_spatial.load(Ordering::Relaxed)
    }

    pub fn set_position(&self, position: Position) {
        self.position[0].store(position.x.to_bits(), Ordering::Relaxed);
        self.position[1].store(position.y.to_bits(), Ordering::Relaxed);
        self.position[2].store(position.z.to_bits(), Ordering::Relaxed);
    }

    pub fn position(&self) -> Position {
        Position {
            x: f32::from_bits(self.position[0].load(Ordering::Relaxed)),
            y: f32::from_bits(self.position[1].load(Ordering::Relaxed)),
            z: f32::from_bits(self.position[2].load(Ordering::Relaxed)),
        }
    }
}

impl Default for EngineNodeShared {
    fn default() -> Self {
        Self::new()
    }
}

/// The render-thread-owned DSP chain. One per `Sound`/`SoundGroup`
/// processor; never touched from the control thread directly (all control
/// flows through the paired `EngineNodeShared`, applied at the top of each
/// `process` call).
pub struct EngineNode {
    resampler: Resampler,
    fader: Fader,
    spatializer: Spatializer,
    panner: Panner,
    pitch: f32,
    old_pitch: f32,
    channels_in: usize,
    channels_out: usize,
    base_rate_in: u32,
    base_rate_out: u32,
}

impl EngineNode {
    pub fn new(channels_in: usize, channels_out: usize, rate_in: u32, rate_out: u32) -> Result<Self> {
        Ok(Self {
            resampler: Resampler::new(ResamplerAlgorithm::Linear, channels_in, rate_in, rate_out)?,
            fader: Fader::fixed(1.0),
            spatializer: Spatializer::new(channels_in, channels_out),
            panner: Panner::new(PanMode::Balance),
            pitch: 1.0,
            old_pitch: 1.0,
            channels_in,
            channels_out,
            base_rate_in: rate_in,
            base_rate_out: rate_out,
        })
    }

    pub fn channels_in(&self) -> usize {
        self.channels_in
    }

    pub fn channels_out(&self) -> usize {
        self.channels_out
    }

    /// How many frames of `channels_in`-channel source audio `run_chain`
    /// needs to produce `out_frames` of output, given the resampler's
    /// current (possibly pitch-adjusted) rate.
    pub fn required_source_frame_count(&self, out_frames: usize) -> usize {
        self.resampler.required_input_frame_count(out_frames)
    }

    /// Apply a control-thread snapshot to this render-thread-owned chain.
    /// Called once at the top of every `process` invocation.
    pub fn apply_shared(&mut self, shared: &EngineNodeShared) {
        if let Some(fade) = shared.pending_fade.lock().unwrap().take() {
            self.fader.reset(fade.volume_begin, fade.volume_end, fade.length_in_frames);
        }
        self.panner.set_pan(f32::from_bits(shared.pan_bits.load(Ordering::Relaxed)));

        if !shared.pitch_disabled.load(Ordering::Relaxed) {
            self.pitch = f32::from_bits(shared.pitch_bits.load(Ordering::Relaxed));
        }

        if shared.is_spatial() {
            self.spatializer.position = shared.position();
        } else {
            // Colocated with the listener: attenuation/azimuth both become
            // no-ops, matching a non-spatial sound's expected plain mix-in.
            self.spatializer.position = self.spatializer.listener_position;
        }
    }

    pub fn set_listener_position(&mut self, position: Position) {
        self.spatializer.listener_position = position;
    }

    /// Resample `source` (`source_frames` frames of `channels_in` channels)
    /// into `out` (`out_frames` frames of `channels_out` channels), running
    /// fade/spatialize/pan on the way. Returns the number of output frames
    /// actually produced; if less than `out_frames`, the source ran dry and
    /// the tail of `out` has been silenced. Pitch changes are latched here,
    /// once, at the end — never mid-call (§4.4).
    pub fn run_chain(&mut self, source: &[f32], source_frames: usize, out: &mut [f32], out_frames: usize) -> usize {
        if (self.pitch - self.old_pitch).abs() > f32::EPSILON {
            let effective_in = (self.base_rate_in as f32 * self.pitch).round().max(1.0) as u32;
            let _ = self.resampler.set_rate(effective_in, self.base_rate_out);
        }

        let mut resampled = vec![0.0f32; out_frames * self.channels_in];
        let (_, produced) = self
            .resampler
            .process(source, source_frames, &mut resampled, out_frames)
            .unwrap_or((0, 0));

        self.fader.process(&mut resampled[..produced * self.channels_in], self.channels_in, produced);

        self.spatializer.process(
            &resampled[..produced * self.channels_in],
            &mut out[..produced * self.channels_out],
            produced,
        );

        self.panner.process(&mut out[..produced * self.channels_out], self.channels_out, produced);

        for s in out
            .iter_mut()
            .skip(produced * self.channels_out)
            .take((out_frames - produced) * self.channels_out)
        {
            *s = 0.0;
        }

        self.old_pitch = self.pitch;
        produced
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn unity_pitch_matching_rates_passes_signal_through() {
        let mut node = EngineNode::new(1, 1, 48_000, 48_000).unwrap();
        let shared = EngineNodeShared::new();
        node.apply_shared(&shared);
        let source: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
        let mut out = vec![0.0f32; 64];
        let produced = node.run_chain(&source, 64, &mut out, 64);
        assert_eq!(produced, 64);
    }

    #[test]
    fn running_dry_mid_tick_zero_fills_the_tail() {
        let mut node = EngineNode::new(1, 1, 48_000, 48_000).unwrap();
        let source = vec![1.0f32; 8];
        let mut out = vec![2.0f32; 32];
        let produced = node.run_chain(&source, 8, &mut out, 32);
        assert!(produced < 32);
        assert!(out[produced..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn pitch_change_latches_only_after_the_call_completes() {
        let mut node = EngineNode::new(1, 1, 48_000, 48_000).unwrap();
        let shared = EngineNodeShared::new();
        shared.set_pitch(2.0);
        node.apply_shared(&shared);
        assert_eq!(node.pitch, 2.0);
        assert_eq!(node.old_pitch, 1.0);
        let source = vec![0.0f32; 256];
        let mut out = vec![0.0f32; 16];
        node.run_chain(&source, 256, &mut out, 16);
        assert_eq!(node.old_pitch, 2.0);
    }

    #[test]
    fn shared_volume_is_a_zero_length_fade() {
        let shared = EngineNodeShared::new();
        shared.set_volume(0.5);
        let mut node = EngineNode::new(1, 1, 48_000, 48_000).unwrap();
        node.apply_shared(&shared);
        let source = vec![1.0f32; 8];
        let mut out = vec![0.0f32; 8];
        node.run_chain(&source, 8, &mut out, 8);
        assert_float_eq!(out[0], 0.5, abs <= 1e-5);
    }

    #[test]
    fn non_spatial_sound_is_colocated_with_listener_so_gain_is_unattenuated() {
        let mut node = EngineNode::new(1, 2, 48_000, 48_000).unwrap();
        node.set_listener_position(Position { x: 5.0, y: 0.0, z: 0.0 });
        let shared = EngineNodeShared::new();
        shared.set_position(Position { x: 500.0, y: 0.0, z: 0.0 });
        node.apply_shared(&shared);
        let source = vec![1.0f32; 4];
        let mut out = vec![0.0f32; 8];
        node.run_chain(&source, 4, &mut out, 4);
        assert_float_eq!(out[0], 1.0, abs <= 1e-5);
    }

    /// Scenario S4: a fade from 0.0 to 1.0 over 10 frames, run through the
    /// full chain (resample -> fade -> spatialize -> pan) rather than the
    /// isolated `Fader`. Frames 0..9 ramp linearly; frames 10..19 hold at the
    /// fade's end volume.
    #[test]
    fn s4_fade_ramp_runs_through_the_full_engine_chain() {
        let mut node = EngineNode::new(2, 2, 48_000, 48_000).unwrap();
        let shared = EngineNodeShared::new();
        shared.fade(0.0, 1.0, 10);
        node.apply_shared(&shared);

        let source = vec![1.0f32; 20 * 2];
        let mut out = vec![0.0f32; 20 * 2];
        let produced = node.run_chain(&source, 20, &mut out, 20);
        assert_eq!(produced, 20);

        for frame in 0..10 {
            let expected = frame as f32 / 10.0;
            assert_float_eq!(out[frame * 2], expected, abs <= 1e-5);
            assert_float_eq!(out[frame * 2 + 1], expected, abs <= 1e-5);
        }
        for frame in 10..20 {
            assert_float_eq!(out[frame * 2], 1.0, abs <= 1e-5);
            assert_float_eq!(out[frame * 2 + 1], 1.0, abs <= 1e-5);
        }
    }
}
