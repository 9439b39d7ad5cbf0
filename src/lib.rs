//! A real-time audio processing core: a pull-based DAG node graph plus an
//! async resource manager, built around the same division of labor as a
//! browser's Web Audio engine but without the DOM/JS-binding layer around
//! it. See `SPEC_FULL.md` and `DESIGN.md` for the full design.
//!
//! Module map:
//! - [`slot_allocator`] / [`job_queue`] — fixed-capacity handle allocation
//!   and the lock-free-ish MPMC queue built on it.
//! - [`graph`] — the node/bus attach-detach-read protocol render threads
//!   pull frames through.
//! - [`dsp`] — resampling, fading, panning, spatializing, and filter
//!   primitives composed into an `engine_node::EngineNode` chain.
//! - [`resource_manager`] — the worker-thread pool and shared/unshared
//!   data-buffer and data-stream connectors backing `DataSource`s.
//! - [`engine`] — `Sound`/`SoundGroup`/`Engine`, the user-facing layer tying
//!   the graph, the resource manager, and the DSP chain together.

pub mod config;
pub mod convert;
pub mod data_source;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod graph;
pub mod job_queue;
pub mod murmur3;
pub mod notification;
pub mod resource_manager;
pub mod slot_allocator;
pub mod vfs;

pub use config::{EngineConfig, JobQueueConfig, ResourceManagerConfig};
pub use engine::{Engine, Sound, SoundGroup};
pub use error::{Error, Result};
