//! `Sound`: a leaf [`crate::engine::engine_node::EngineNode`] driven directly
//! by a [`DataSource`] (§4.4's "Sound" flavor). Holds no input bus — its
//! `Processor` impl is the zero-input fast path `graph::node::node_read`
//! already special-cases.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::data_source::DataSource;
use crate::error::{Error, Result};
use crate::graph::{attach_output_bus, detach_output_bus, new_node, Node, NodeState, Processor};
use crate::resource_manager::{ResourceManager, ResourceManagerDataBuffer, ResourceManagerDataStream};

use super::engine_node::{EngineNode, EngineNodeShared};

/// Sentinel meaning "no pending seek" for `SoundShared::seek_target`.
const NO_SEEK: u64 = u64::MAX;

/// Whichever concrete `DataSource` backs a `Sound`. Kept as one enum (rather
/// than a bare `Box<dyn DataSource>`) so `Sound::destroy` can recover a
/// resource-manager-owned connector and hand it back through the proper
/// `uninit` path instead of silently dropping its ref count bookkeeping.
pub enum SoundSource {
    Plain(Box<dyn DataSource>),
    ManagedBuffer(ResourceManagerDataBuffer),
    ManagedStream(ResourceManagerDataStream),
}

impl DataSource for SoundSource {
    fn read_pcm_frames(&mut self, dst: &mut [f32], frame_count: usize, is_looping: bool) -> Result<usize> {
        match self {
            SoundSource::Plain(s) => s.read_pcm_frames(dst, frame_count, is_looping),
            SoundSource::ManagedBuffer(b) => b.read_pcm_frames(dst, frame_count, is_looping),
            SoundSource::ManagedStream(s) => s.read_pcm_frames(dst, frame_count, is_looping),
        }
    }

    fn seek_to_pcm_frame(&mut self, frame_index: u64) -> Result<()> {
        match self {
            SoundSource::Plain(s) => s.seek_to_pcm_frame(frame_index),
            SoundSource::ManagedBuffer(b) => b.seek_to_pcm_frame(frame_index),
            SoundSource::ManagedStream(s) => s.seek_to_pcm_frame(frame_index),
        }
    }

    fn format(&self) -> crate::data_source::SampleFormat {
        match self {
            SoundSource::Plain(s) => s.format(),
            SoundSource::ManagedBuffer(b) => b.format(),
            SoundSource::ManagedStream(s) => s.format(),
        }
    }

    fn channels(&self) -> u32 {
        match self {
            SoundSource::Plain(s) => s.channels(),
            SoundSource::ManagedBuffer(b) => b.channels(),
            SoundSource::ManagedStream(s) => s.channels(),
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            SoundSource::Plain(s) => s.sample_rate(),
            SoundSource::ManagedBuffer(b) => b.sample_rate(),
            SoundSource::ManagedStream(s) => s.sample_rate(),
        }
    }

    fn cursor_in_pcm_frames(&self) -> Result<u64> {
        match self {
            SoundSource::Plain(s) => s.cursor_in_pcm_frames(),
            SoundSource::ManagedBuffer(b) => b.cursor_in_pcm_frames(),
            SoundSource::ManagedStream(s) => s.cursor_in_pcm_frames(),
        }
    }
}

/// Control surface for a `Sound`, shared between the handle and its
/// render-thread processor.
pub struct SoundShared {
    base: EngineNodeShared,
    is_looping: AtomicBool,
    at_end: AtomicBool,
    seek_target: AtomicU64,
}

impl SoundShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: EngineNodeShared::new(),
            is_looping: AtomicBool::new(false),
            at_end: AtomicBool::new(false),
            seek_target: AtomicU64::new(NO_SEEK),
        })
    }
}

struct SoundProcessor {
    engine: EngineNode,
    source: Arc<Mutex<Option<SoundSource>>>,
    shared: Arc<SoundShared>,
}

impl Processor for SoundProcessor {
    fn input_bus_count(&self) -> usize {
        0
    }
    fn channels_in(&self, _bus: usize) -> usize {
        0
    }
    fn channels_out(&self, _bus: usize) -> usize {
        self.engine.channels_out()
    }

    fn process(&mut self, _inputs: &[&[f32]], _frames_in: usize, outputs: &mut [&mut [f32]], frames_out: usize, _global_time: u64) {
        self.engine.apply_shared(&self.shared.base);

        let mut guard = self.source.lock().unwrap();
        let source = match guard.as_mut() {
            Some(s) => s,
            None => {
                for s in outputs[0][..frames_out * self.engine.channels_out()].iter_mut() {
                    *s = 0.0;
                }
                return;
            }
        };

        let seek_target = self.shared.seek_target.swap(NO_SEEK, Ordering::AcqRel);
        if seek_target != NO_SEEK {
            let _ = source.seek_to_pcm_frame(seek_target);
        }

        let is_looping = self.shared.is_looping.load(Ordering::Relaxed);
        let need_in = self.engine.required_source_frame_count(frames_out).max(1);
        let mut src_buf = vec![0.0f32; need_in * self.engine.channels_in().max(1)];

        let read = match source.read_pcm_frames(&mut src_buf, need_in, is_looping) {
            Ok(n) => n,
            Err(Error::AtEnd) => 0,
            Err(_) => 0,
        };

        let produced = self.engine.run_chain(&src_buf, read, outputs[0], frames_out);

        if read == 0 || produced < frames_out {
            self.shared.at_end.store(true, Ordering::Release);
        }
    }
}

/// Control-thread handle to a leaf sound node. Cheap to clone the underlying
/// `Node`; this wrapper is what callers hold to drive playback.
pub struct Sound {
    node: Node,
    shared: Arc<SoundShared>,
    source: Arc<Mutex<Option<SoundSource>>>,
}

impl Sound {
    fn build(engine_channels: u32, engine_rate: u32, source_channels: u32, source_rate: u32, source: SoundSource) -> Result<Self> {
        let engine = EngineNode::new(source_channels as usize, engine_channels as usize, source_rate, engine_rate)?;
        let shared = SoundShared::new();
        let source_slot = Arc::new(Mutex::new(Some(source)));

        let processor = SoundProcessor {
            engine,
            source: Arc::clone(&source_slot),
            shared: Arc::clone(&shared),
        };
        let node = new_node(Box::new(processor));

        Ok(Self {
            node,
            shared,
            source: source_slot,
        })
    }

    /// Wrap an arbitrary, already-open `DataSource` (in-memory clip, custom
    /// generator, ...) as a playable sound.
    pub fn from_data_source(engine_channels: u32, engine_rate: u32, source: Box<dyn DataSource>) -> Result<Self> {
        let channels = source.channels();
        let rate = source.sample_rate();
        Self::build(engine_channels, engine_rate, channels, rate, SoundSource::Plain(source))
    }

    /// Open a sound backed by the resource manager's shared, ref-counted
    /// data-buffer connector (§4.7). Always requests `WAIT_INIT` so the
    /// channel/rate pair needed to build the resampler is known synchronously
    /// (§4.9.1).
    pub fn from_path(
        rm: &ResourceManager,
        path: &str,
        engine_channels: u32,
        engine_rate: u32,
        extra_flags: u32,
    ) -> Result<Self> {
        use crate::resource_manager::flags;
        let buffer = rm.data_buffer_init(path, extra_flags | flags::DECODE | flags::WAIT_INIT, None)?;
        let channels = buffer.channels();
        let rate = buffer.sample_rate();
        Self::build(engine_channels, engine_rate, channels, rate, SoundSource::ManagedBuffer(buffer))
    }

    /// Open a sound backed by an unshared streaming connector (§4.8). The
    /// streaming init already blocks until the format is known, so no extra
    /// synchronization is needed here.
    pub fn from_path_streaming(
        rm: &ResourceManager,
        path: &str,
        engine_channels: u32,
        engine_rate: u32,
        is_looping: bool,
    ) -> Result<Self> {
        let stream = rm.data_stream_init(path, is_looping, None)?;
        let channels = stream.channels();
        let rate = stream.sample_rate();
        let sound = Self::build(engine_channels, engine_rate, channels, rate, SoundSource::ManagedStream(stream))?;
        sound.set_looping(is_looping);
        Ok(sound)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn attach_to(&self, dest: &Node, dest_bus: usize) -> Result<()> {
        attach_output_bus(&self.node, 0, dest, dest_bus)
    }

    pub fn detach(&self) -> Result<()> {
        detach_output_bus(&self.node, 0)
    }

    pub fn start(&self) {
        self.node.set_state(NodeState::Started);
    }

    pub fn stop(&self) {
        self.node.set_state(NodeState::Stopped);
    }

    pub fn is_playing(&self) -> bool {
        self.node.state() == NodeState::Started
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.base.set_volume(volume);
    }

    pub fn fade(&self, volume_begin: f32, volume_end: f32, length_in_frames: u64) {
        self.shared.base.fade(volume_begin, volume_end, length_in_frames);
    }

    pub fn set_pan(&self, pan: f32) {
        self.shared.base.set_pan(pan);
    }

    pub fn set_pitch(&self, pitch: f32) {
        self.shared.base.set_pitch(pitch);
    }

    pub fn set_pitch_disabled(&self, disabled: bool) {
        self.shared.base.set_pitch_disabled(disabled);
    }

    pub fn set_spatial(&self, spatial: bool) {
        self.shared.base.set_spatial(spatial);
    }

    pub fn set_position(&self, position: crate::dsp::spatializer::Position) {
        self.shared.base.set_position(position);
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.is_looping.store(looping, Ordering::Relaxed);
    }

    pub fn is_looping(&self) -> bool {
        self.shared.is_looping.load(Ordering::Relaxed)
    }

    /// Request a seek; applied at the top of the next `process` call on the
    /// render thread (§4.4).
    pub fn seek_to_pcm_frame(&self, frame_index: u64) {
        self.shared.seek_target.store(frame_index, Ordering::Release);
    }

    /// Whether the source ran dry on a previous tick. Recycling / state
    /// transition to `Stopped` is the caller's (typically `Engine`'s)
    /// responsibility, checked once per tick — the render thread itself only
    /// raises the flag (§4.4).
    pub fn is_at_end(&self) -> bool {
        self.shared.at_end.load(Ordering::Acquire)
    }

    fn clear_at_end(&self) {
        self.shared.at_end.store(false, Ordering::Release);
    }

    /// Swap in a fresh source without tearing down the `Node`/graph
    /// attachment — how "fire and forget" inline sounds get recycled instead
    /// of freed (§4.9.1).
    pub fn reset_source(&self, source: SoundSource) {
        *self.source.lock().unwrap() = Some(source);
        self.clear_at_end();
        self.node.set_state(NodeState::Started);
    }

    /// Detach from the graph and, if backed by a resource-manager connector,
    /// release it through the proper `*_uninit` path so the shared node's
    /// ref count and the worker queue stay consistent.
    pub fn destroy(self, rm: Option<&ResourceManager>) {
        let _ = detach_output_bus(&self.node, 0);
        let taken = self.source.lock().unwrap().take();
        match (taken, rm) {
            (Some(SoundSource::ManagedBuffer(buf)), Some(rm)) => {
                let _ = rm.data_buffer_uninit(buf);
            }
            (Some(SoundSource::ManagedStream(stream)), Some(rm)) => {
                let _ = rm.data_stream_uninit(stream);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::data_source::MemoryDataSource;
    use crate::graph::NodeGraph;

    #[test]
    fn plays_a_memory_source_through_to_the_endpoint() {
        let graph = NodeGraph::new(1);
        let source = MemoryDataSource::new(vec![1.0; 64], 1, 48_000);
        let sound = Sound::from_data_source(1, 48_000, Box::new(source)).unwrap();
        sound.attach_to(graph.endpoint(), 0).unwrap();

        let mut out = vec![0.0f32; 32];
        graph.read_pcm_frames(&mut out, 32, 0);
        assert_float_eq!(out.as_slice(), vec![1.0f32; 32].as_slice(), abs_all <= 1e-5);
    }

    #[test]
    fn reaching_end_of_source_raises_at_end() {
        let graph = NodeGraph::new(1);
        let source = MemoryDataSource::new(vec![1.0; 8], 1, 48_000);
        let sound = Sound::from_data_source(1, 48_000, Box::new(source)).unwrap();
        sound.attach_to(graph.endpoint(), 0).unwrap();

        let mut out = vec![0.0f32; 64];
        graph.read_pcm_frames(&mut out, 64, 0);
        assert!(sound.is_at_end());
    }

    #[test]
    fn looping_source_never_raises_at_end() {
        let graph = NodeGraph::new(1);
        let source = MemoryDataSource::new(vec![1.0; 8], 1, 48_000);
        let sound = Sound::from_data_source(1, 48_000, Box::new(source)).unwrap();
        sound.set_looping(true);
        sound.attach_to(graph.endpoint(), 0).unwrap();

        let mut out = vec![0.0f32; 64];
        graph.read_pcm_frames(&mut out, 64, 0);
        assert!(!sound.is_at_end());
    }

    #[test]
    fn volume_scales_output() {
        let graph = NodeGraph::new(1);
        let source = MemoryDataSource::new(vec![1.0; 64], 1, 48_000);
        let sound = Sound::from_data_source(1, 48_000, Box::new(source)).unwrap();
        sound.set_volume(0.25);
        sound.attach_to(graph.endpoint(), 0).unwrap();

        let mut out = vec![0.0f32; 16];
        graph.read_pcm_frames(&mut out, 16, 0);
        assert_float_eq!(out[0], 0.25, abs <= 1e-4);
    }

    #[test]
    fn reset_source_recycles_an_inline_sound_without_rebuilding_the_node() {
        let graph = NodeGraph::new(1);
        let source = MemoryDataSource::new(vec![1.0; 4], 1, 48_000);
        let sound = Sound::from_data_source(1, 48_000, Box::new(source)).unwrap();
        sound.attach_to(graph.endpoint(), 0).unwrap();

        let mut out = vec![0.0f32; 16];
        graph.read_pcm_frames(&mut out, 16, 0);
        assert!(sound.is_at_end());

        sound.reset_source(SoundSource::Plain(Box::new(MemoryDataSource::new(vec![0.5; 4], 1, 48_000))));
        assert!(!sound.is_at_end());

        // The resampler carries one frame of interpolation latency (§4.6),
        // so the very first sample after a source swap can still reflect the
        // old source; by the last frame of this tick the new source has
        // fully flushed through.
        let mut out2 = vec![0.0f32; 4];
        graph.read_pcm_frames(&mut out2, 4, 1);
        assert_float_eq!(out2[3], 0.5, abs <= 1e-4);
        assert!(!sound.is_at_end());
    }
}
