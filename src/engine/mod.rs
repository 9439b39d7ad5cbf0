//! The engine (§4.9): owns the processing graph, the resource manager, the
//! listener, and a fixed-size ring buffer that bridges a device's arbitrary
//! callback frame counts to the graph's fixed `period_size_in_frames`
//! (§4.9.1). Device I/O itself is out of scope (§1's Non-goals) — `Engine`
//! drives a caller-supplied [`DataCallback`] instead of opening a real
//! output stream, mirroring the teacher crate's `#[cfg(test)]`/
//! `#[cfg(not(test))]` split between a real `cpal::Stream` and a
//! stream-skipping test double.

pub mod engine_node;
pub mod group;
pub mod listener;
pub mod sound;

pub use engine_node::{EngineNode, EngineNodeShared};
pub use group::SoundGroup;
pub use listener::Listener;
pub use sound::{Sound, SoundSource};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::graph::{Node, NodeGraph};
use crate::resource_manager::ResourceManager;

/// What a real device backend's callback looks like from the engine's side:
/// fill `output` (interleaved, `frame_count` frames of `EngineConfig::channels`
/// channels) with the next chunk of audio. This crate defines the contract
/// only; wiring an actual `cpal`/platform stream to call it is outside scope.
pub trait DataCallback: FnMut(&mut [f32], usize) + Send {}
impl<T: FnMut(&mut [f32], usize) + Send> DataCallback for T {}

/// Bridges a device callback's arbitrary `frame_count` requests to the
/// graph's fixed-size `period_size_in_frames` ticks (§4.9.1): a ring buffer
/// that refills one whole period at a time and serves callbacks out of it,
/// straddling period boundaries transparently.
struct RingBuffer {
    buffer: Vec<f32>,
    channels: usize,
    period: usize,
    cursor: usize,
    filled: usize,
}

impl RingBuffer {
    fn new(period: usize, channels: usize) -> Self {
        Self {
            buffer: vec![0.0; period * channels],
            channels,
            period,
            cursor: 0,
            filled: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.cursor >= self.filled
    }

    fn take(&mut self, dst: &mut [f32], frames: usize) -> usize {
        let available = self.filled - self.cursor;
        let take = available.min(frames);
        let src_start = self.cursor * self.channels;
        dst[..take * self.channels].copy_from_slice(&self.buffer[src_start..src_start + take * self.channels]);
        self.cursor += take;
        take
    }

    fn refill(&mut self, graph: &NodeGraph, global_time: u64) {
        self.cursor = 0;
        self.filled = self.period;
        graph.read_pcm_frames(&mut self.buffer, self.period, global_time);
    }
}

/// Owns the node graph, the (optional) resource manager, the listener, and
/// the "fire and forget" inline sound pool. One engine per output device.
pub struct Engine {
    config: EngineConfig,
    graph: NodeGraph,
    resource_manager: Option<Arc<ResourceManager>>,
    listener: Arc<Listener>,
    endpoint_group: SoundGroup,
    ring: Mutex<RingBuffer>,
    global_time: AtomicU64,
    inline_sounds: Mutex<Vec<Sound>>,
}

impl Engine {
    /// Build a new engine. `resource_manager` is optional — an engine that
    /// only ever plays caller-supplied in-memory `DataSource`s has no need
    /// for one (§3).
    pub fn new(config: EngineConfig, resource_manager: Option<Arc<ResourceManager>>) -> Result<Self> {
        let graph = NodeGraph::new(config.channels as usize);
        let endpoint_group = SoundGroup::new(config.channels, config.sample_rate)?;
        endpoint_group.attach_to(graph.endpoint(), 0)?;

        Ok(Self {
            ring: Mutex::new(RingBuffer::new(config.period_size_in_frames as usize, config.channels as usize)),
            config,
            graph,
            resource_manager,
            listener: Arc::new(Listener::new()),
            endpoint_group,
            global_time: AtomicU64::new(0),
            inline_sounds: Mutex::new(Vec::new()),
        })
    }

    /// Test/headless construction with no backing resource manager — the
    /// engine's equivalent of the teacher crate's `#[cfg(test)]`
    /// device-skipping constructor. Any `*_from_path` call will fail with
    /// [`crate::error::Error::InvalidOperation`] since there is no resource
    /// manager to service it.
    pub fn new_null(config: EngineConfig) -> Result<Self> {
        Self::new(config, None)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn resource_manager(&self) -> Option<&Arc<ResourceManager>> {
        self.resource_manager.as_ref()
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    /// The default destination for sounds/groups created without an explicit
    /// parent (§4.4.1) — distinct from the graph's literal device-facing
    /// `endpoint`, so the engine can apply a master volume/pan stage without
    /// every caller having to know about the raw endpoint node.
    pub fn endpoint_group(&self) -> &Node {
        self.endpoint_group.node()
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.endpoint_group.set_volume(volume);
    }

    /// Create a sound from an arbitrary `DataSource` and attach it to the
    /// default destination group.
    pub fn play_sound_from_data_source(&self, source: Box<dyn crate::data_source::DataSource>) -> Result<Sound> {
        let sound = Sound::from_data_source(self.config.channels, self.config.sample_rate, source)?;
        sound.attach_to(self.endpoint_group(), 0)?;
        Ok(sound)
    }

    /// Create a sound from a resource-manager-backed path and attach it to
    /// the default destination group. Forces `WAIT_INIT` (§4.9.1) so the
    /// channel/rate pair is known before the resampler is built.
    pub fn play_sound_from_path(&self, path: &str) -> Result<Sound> {
        let rm = self.resource_manager.as_ref().ok_or(crate::error::Error::InvalidOperation)?;
        let sound = Sound::from_path(rm, path, self.config.channels, self.config.sample_rate, 0)?;
        sound.attach_to(self.endpoint_group(), 0)?;
        Ok(sound)
    }

    /// "Fire and forget" playback (§4.9.1): recycle a finished inline sound
    /// from the pool if one is available, otherwise create a new one up to
    /// `inline_sound_capacity`. Beyond capacity, still plays — just without
    /// pooling — logging a warning so unbounded growth is visible.
    pub fn play_inline_sound_from_path(&self, path: &str) -> Result<()> {
        let rm = self.resource_manager.as_ref().ok_or(crate::error::Error::InvalidOperation)?;

        let mut pool = self.inline_sounds.lock().unwrap();
        if let Some(slot) = pool.iter().find(|s| s.is_at_end()) {
            let buffer = rm.data_buffer_init(
                path,
                crate::resource_manager::flags::DECODE | crate::resource_manager::flags::WAIT_INIT,
                None,
            )?;
            slot.reset_source(SoundSource::ManagedBuffer(buffer));
            return Ok(());
        }

        if pool.len() >= self.config.inline_sound_capacity {
            log::warn!(
                "inline sound pool at capacity ({}); playing {} unpooled",
                self.config.inline_sound_capacity,
                path
            );
        }

        let sound = Sound::from_path(rm, path, self.config.channels, self.config.sample_rate, 0)?;
        sound.attach_to(self.endpoint_group(), 0)?;
        pool.push(sound);
        Ok(())
    }

    /// Per-tick bookkeeping: stop any sound that ran dry so it no longer
    /// consumes cycles being re-invoked every period (§4.4's "transitions to
    /// Stopped at the next tick" rule).
    fn retire_finished_sounds(&self) {
        let pool = self.inline_sounds.lock().unwrap();
        for sound in pool.iter() {
            if sound.is_at_end() && sound.is_playing() {
                sound.stop();
            }
        }
    }

    /// The device callback contract (§4.9.1): fill `output` (interleaved,
    /// `frame_count` frames of `config.channels` channels) from the graph,
    /// crossing period boundaries via the internal ring buffer as needed.
    pub fn data_callback(&self, output: &mut [f32], frame_count: usize) {
        let channels = self.config.channels as usize;
        let mut ring = self.ring.lock().unwrap();
        let mut written = 0usize;

        while written < frame_count {
            if ring.is_empty() {
                let global_time = self
                    .global_time
                    .fetch_add(self.config.period_size_in_frames as u64, Ordering::AcqRel);
                ring.refill(&self.graph, global_time);
            }
            let dst_start = written * channels;
            let dst_end = frame_count * channels;
            let got = ring.take(&mut output[dst_start..dst_end], frame_count - written);
            written += got;
            if got == 0 {
                break;
            }
        }

        self.retire_finished_sounds();
    }
}
