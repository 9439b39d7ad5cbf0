//! Signal-processing primitives used inside an `EngineNode`'s chain:
//! `data source -> resampler -> fader -> spatializer -> panner -> output`.

pub mod biquad;
pub mod fader;
pub mod filters;
pub mod panner;
pub mod resampler;
pub mod spatializer;
