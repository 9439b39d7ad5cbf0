//! The processing graph: a directed acyclic (with loop-breaking) network of
//! [`node::Node`]s pulled from a single [`node::NodeGraph`] endpoint. See
//! `node` for the attach/detach/read protocol itself; this module re-exports
//! the pieces `engine_node` and `engine` build on.

pub mod node;

pub use node::{
    attach_output_bus, detach_output_bus, new_node, node_read, InputBus, Node, NodeGraph,
    NodeState, OutputBus, Processor, CACHE_CAP_FRAMES,
};
