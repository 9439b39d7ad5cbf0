//! Construction-time configuration for the pieces of the core that need
//! numeric knobs (capacities, worker counts, buffer sizes). There is no
//! on-disk config format; these are plain structs with sane `Default`s,
//! mirroring how the teacher crate passes `*Options` structs into its
//! node constructors.

/// Configuration for the [`crate::job_queue::JobQueue`] and the
/// [`crate::slot_allocator::SlotAllocator`] it is built on.
#[derive(Copy, Clone, Debug)]
pub struct JobQueueConfig {
    /// Fixed capacity of the job slab. The original source hard-codes 1024;
    /// this crate keeps that as the default but allows override for tests.
    pub capacity: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Configuration for a [`crate::resource_manager::ResourceManager`].
#[derive(Clone, Debug)]
pub struct ResourceManagerConfig {
    pub job_queue: JobQueueConfig,
    /// Number of worker threads draining the job queue.
    pub job_thread_count: usize,
    /// Page size for streaming data sources, expressed in seconds of audio.
    pub page_size_in_seconds: f32,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            job_queue: JobQueueConfig::default(),
            job_thread_count: 1,
            page_size_in_seconds: 1.0,
        }
    }
}

/// Configuration for an [`crate::engine::Engine`].
#[derive(Copy, Clone, Debug)]
pub struct EngineConfig {
    /// Number of speaker output channels.
    pub channels: u32,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Frames requested from the graph per tick. 480 @ 48kHz is 10ms, the
    /// conventional default period for interactive audio.
    pub period_size_in_frames: u32,
    /// Maximum number of "fire and forget" inline sounds kept resident for
    /// recycling.
    pub inline_sound_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48_000,
            period_size_in_frames: 480,
            inline_sound_capacity: 32,
        }
    }
}
