//! `SoundGroup`: the composite [`crate::engine::engine_node::EngineNode`]
//! flavor (§4.4.1). Accepts attachment from any number of `Sound`s or nested
//! `SoundGroup`s on its single input bus — the graph's own `InputBus`
//! mixing already sums them before `process` ever runs — and applies its
//! own fader/pan/spatializer stage again on top of that mix.

use crate::error::Result;
use crate::graph::{attach_output_bus, detach_output_bus, new_node, Node, NodeState, Processor};

use super::engine_node::{EngineNode, EngineNodeShared};
use std::sync::Arc;

struct GroupProcessor {
    engine: EngineNode,
    shared: Arc<EngineNodeShared>,
}

impl Processor for GroupProcessor {
    fn input_bus_count(&self) -> usize {
        1
    }
    fn channels_in(&self, _bus: usize) -> usize {
        self.engine.channels_in()
    }
    fn channels_out(&self, _bus: usize) -> usize {
        self.engine.channels_out()
    }

    fn process(&mut self, inputs: &[&[f32]], frames_in: usize, outputs: &mut [&mut [f32]], frames_out: usize, _global_time: u64) {
        self.engine.apply_shared(&self.shared);
        self.engine.run_chain(inputs[0], frames_in, outputs[0], frames_out);
    }
}

/// Control-thread handle to a sub-mix group. Channel count in equals channel
/// count out (both the engine's device channel count) — a group never
/// itself changes the channel layout, only sounds attaching underneath it
/// might differ and get converted at that leaf's spatializer stage.
pub struct SoundGroup {
    node: Node,
    shared: Arc<EngineNodeShared>,
}

impl SoundGroup {
    pub fn new(engine_channels: u32, engine_rate: u32) -> Result<Self> {
        let engine = EngineNode::new(engine_channels as usize, engine_channels as usize, engine_rate, engine_rate)?;
        let shared = Arc::new(EngineNodeShared::new());
        let processor = GroupProcessor {
            engine,
            shared: Arc::clone(&shared),
        };
        let node = new_node(Box::new(processor));
        Ok(Self { node, shared })
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

    pub fn set_volume(&self, volume: f32) {
        self.shared.set_volume(volume);
    }

    pub fn fade(&self, volume_begin: f32, volume_end: f32, length_in_frames: u64) {
        self.shared.fade(volume_begin, volume_end, length_in_frames);
    }

    pub fn set_pan(&self, pan: f32) {
        self.shared.set_pan(pan);
    }

    pub fn set_pitch(&self, pitch: f32) {
        self.shared.set_pitch(pitch);
    }

    pub fn set_spatial(&self, spatial: bool) {
        self.shared.set_spatial(spatial);
    }

    pub fn set_position(&self, position: crate::dsp::spatializer::Position) {
        self.shared.set_position(position);
    }
}
