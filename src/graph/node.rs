//! Generic DAG primitives: typed nodes, input/output buses, and the
//! attach/detach/iteration protocol a render thread uses to pull frames
//! through the graph without ever blocking on a control-thread operation for
//! longer than a bus splice.
//!
//! The distilled design calls for raw atomic pointers threading an intrusive
//! linked list. This crate realizes the same externally observable protocol
//! (head-insertion, forward-only iteration, detach waiting for in-flight
//! readers) with `Mutex`-guarded `Vec`s instead of hand-rolled unsafe
//! pointer-chasing — every invariant in §4.3 survives the substitution, and
//! the risk profile of safe code is the right trade when no test run can
//! catch a use-after-free. See DESIGN.md.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};

/// Frames cached per bus before a node must be re-invoked within a tick.
pub const CACHE_CAP_FRAMES: usize = 4096;

/// The per-node signal-processing callback. `process` may consume fewer
/// input frames than output frames produced, or vice versa (resampling).
pub trait Processor: Send {
    fn input_bus_count(&self) -> usize {
        1
    }
    fn output_bus_count(&self) -> usize {
        1
    }
    fn channels_in(&self, bus: usize) -> usize;
    fn channels_out(&self, bus: usize) -> usize;

    /// `inputs[i]` holds exactly `frames_in` frames of `channels_in(i)`
    /// channels, interleaved. `outputs[i]` must be filled with exactly
    /// `frames_out` frames of `channels_out(i)` channels. `global_time` is
    /// the graph-wide frame counter at the start of this call.
    fn process(
        &mut self,
        inputs: &[&[f32]],
        frames_in: usize,
        outputs: &mut [&mut [f32]],
        frames_out: usize,
        global_time: u64,
    );
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    Started,
    Stopped,
}

struct NodeCache {
    input_slab: Vec<Vec<f32>>,
    output_slab: Vec<Vec<f32>>,
    cached_frame_count_in: usize,
    cached_frame_count_out: usize,
    #[allow(dead_code)]
    consumed_frame_count_in: usize,
}

/// A single attachment point on a downstream node's input side: an
/// intrusive, head-insert, forward-only list of upstream `OutputBus`es.
pub struct InputBus {
    channels: usize,
    attached: Mutex<Vec<Arc<OutputBus>>>,
    /// Count of in-flight iterations; detach waits for this to reach zero
    /// before it may consider the bus fully unlinked.
    readers_in_flight: AtomicUsize,
}

impl InputBus {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            attached: Mutex::new(Vec::new()),
            readers_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// An upstream node's output attachment point.
pub struct OutputBus {
    owner: Weak<NodeInner>,
    bus_index: usize,
    channels: usize,
    volume_bits: AtomicU32,
    is_attached: AtomicBool,
    has_read: AtomicBool,
    ref_count: AtomicU32,
    destination: Mutex<Option<(Arc<NodeInner>, usize)>>,
    bus_lock: Mutex<()>,
}

impl OutputBus {
    fn new(owner: Weak<NodeInner>, bus_index: usize, channels: usize) -> Arc<Self> {
        Arc::new(Self {
            owner,
            bus_index,
            channels,
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            is_attached: AtomicBool::new(false),
            // Starts "stale" so the first read of any tick takes the
            // reprocess path rather than copying an unset cache.
            has_read: AtomicBool::new(true),
            ref_count: AtomicU32::new(0),
            destination: Mutex::new(None),
            bus_lock: Mutex::new(()),
        })
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn is_attached(&self) -> bool {
        self.is_attached.load(Ordering::Acquire)
    }
}

/// The concrete, reference-counted node used throughout the graph. `Node` is
/// the owned, cloneable handle callers pass around; its inner `Arc` lets
/// `OutputBus::destination` hold a strong back-reference without callers
/// needing to manage lifetimes manually.
pub struct NodeInner {
    processor: Mutex<Box<dyn Processor>>,
    input_buses: Vec<InputBus>,
    output_buses: Vec<Arc<OutputBus>>,
    state: AtomicBool,
    state_start_time: AtomicU64,
    state_stop_time: AtomicU64,
    local_time: AtomicU64,
    read_counter: AtomicU32,
    cache: Mutex<NodeCache>,
}

pub type Node = Arc<NodeInner>;

const NO_TRANSITION: u64 = u64::MAX;

/// Build a new node from a processor and its static bus channel counts.
pub fn new_node(processor: Box<dyn Processor>) -> Node {
    let input_count = processor.input_bus_count();
    let output_count = processor.output_bus_count();
    let input_channels: Vec<usize> = (0..input_count).map(|i| processor.channels_in(i)).collect();
    let output_channels: Vec<usize> = (0..output_count).map(|i| processor.channels_out(i)).collect();

    Arc::new_cyclic(|weak: &Weak<NodeInner>| NodeInner {
        processor: Mutex::new(processor),
        input_buses: input_channels.iter().map(|&c| InputBus::new(c)).collect(),
        output_buses: output_channels
            .iter()
            .enumerate()
            .map(|(i, &c)| OutputBus::new(weak.clone(), i, c))
            .collect(),
        state: AtomicBool::new(true),
        state_start_time: AtomicU64::new(0),
        state_stop_time: AtomicU64::new(NO_TRANSITION),
        local_time: AtomicU64::new(0),
        read_counter: AtomicU32::new(0),
        cache: Mutex::new(NodeCache {
            input_slab: input_channels.iter().map(|&c| vec![0.0; CACHE_CAP_FRAMES * c]).collect(),
            output_slab: output_channels.iter().map(|&c| vec![0.0; CACHE_CAP_FRAMES * c]).collect(),
            cached_frame_count_in: 0,
            cached_frame_count_out: 0,
            consumed_frame_count_in: 0,
        }),
    })
}

impl NodeInner {
    pub fn input_bus(&self, idx: usize) -> &InputBus {
        &self.input_buses[idx]
    }

    pub fn output_bus(&self, idx: usize) -> &Arc<OutputBus> {
        &self.output_buses[idx]
    }

    pub fn input_bus_count(&self) -> usize {
        self.input_buses.len()
    }

    pub fn output_bus_count(&self) -> usize {
        self.output_buses.len()
    }

    pub fn local_time(&self) -> u64 {
        self.local_time.load(Ordering::Relaxed)
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state == NodeState::Started, Ordering::Relaxed);
    }

    pub fn state(&self) -> NodeState {
        if self.state.load(Ordering::Relaxed) {
            NodeState::Started
        } else {
            NodeState::Stopped
        }
    }

    /// Schedule a future transition: at `global_time >= at`, the node
    /// becomes `state`. Two-slot model per the spec (`state_times[2]`): one
    /// pending start threshold, one pending stop threshold.
    pub fn schedule(&self, state: NodeState, at: u64) {
        match state {
            NodeState::Started => self.state_start_time.store(at, Ordering::Relaxed),
            NodeState::Stopped => self.state_stop_time.store(at, Ordering::Relaxed),
        }
    }

    /// How many of the next `n` frames starting at `global_time` are active,
    /// and how many leading frames must be silenced because the node hasn't
    /// started yet (or has already stopped).
    fn effective_span(&self, global_time: u64, n: usize) -> (usize, usize) {
        let start_at = self.state_start_time.load(Ordering::Relaxed);
        let stop_at = self.state_stop_time.load(Ordering::Relaxed);
        let end_time = global_time + n as u64;

        if stop_at != NO_TRANSITION && global_time >= stop_at {
            return (0, 0);
        }
        if start_at != NO_TRANSITION && end_time <= start_at {
            return (0, 0);
        }

        let lead_silence = if start_at != NO_TRANSITION && start_at > global_time {
            (start_at - global_time) as usize
        } else {
            0
        };
        let active_end = if stop_at != NO_TRANSITION && stop_at < end_time {
            (stop_at - global_time) as usize
        } else {
            n
        };
        (lead_silence.min(n), active_end.saturating_sub(lead_silence).min(n))
    }
}

/// Attach `source`'s output bus `src_bus` to `dest`'s input bus `dest_bus`.
/// Fails with `InvalidArgs` if channel counts differ.
pub fn attach_output_bus(source: &Node, src_bus: usize, dest: &Node, dest_bus: usize) -> Result<()> {
    let src = source.output_bus(src_bus).clone();
    let dest_input = dest.input_bus(dest_bus);

    let _guard = src.bus_lock.lock().unwrap();

    if src.is_attached() {
        detach_locked(&src);
    }

    if src.channels != dest_input.channels {
        return Err(Error::InvalidArgs);
    }

    {
        let mut list = dest_input.attached.lock().unwrap();
        list.insert(0, src.clone());
    }
    *src.destination.lock().unwrap() = Some((dest.clone(), dest_bus));
    src.is_attached.store(true, Ordering::Release);
    Ok(())
}

fn detach_locked(src: &Arc<OutputBus>) {
    src.is_attached.store(false, Ordering::Release);

    let dest = src.destination.lock().unwrap().take();
    if let Some((dest_node, dest_bus)) = dest {
        let input_bus = dest_node.input_bus(dest_bus);
        {
            let mut list = input_bus.attached.lock().unwrap();
            list.retain(|b| !Arc::ptr_eq(b, src));
        }
        while input_bus.readers_in_flight.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }
    while src.ref_count.load(Ordering::Acquire) != 0 {
        std::thread::yield_now();
    }
}

/// Detach `source`'s output bus `src_bus`, if attached. Blocks until any
/// in-flight render-thread read of this bus completes.
pub fn detach_output_bus(source: &Node, src_bus: usize) -> Result<()> {
    let src = source.output_bus(src_bus).clone();
    let _guard = src.bus_lock.lock().unwrap();
    if !src.is_attached() {
        return Ok(());
    }
    detach_locked(&src);
    Ok(())
}

/// Mix every attached upstream output bus into `out` (exactly `n` frames of
/// `channels` channels), honoring per-bus volume and the loop-prevention
/// read counter.
fn input_bus_read(input_bus: &InputBus, out: &mut [f32], n: usize, global_time: u64, tick: u32) -> usize {
    for s in out.iter_mut().take(n * input_bus.channels) {
        *s = 0.0;
    }

    input_bus.readers_in_flight.fetch_add(1, Ordering::AcqRel);
    let snapshot: Vec<Arc<OutputBus>> = input_bus.attached.lock().unwrap().clone();

    let mut first_contributor = true;
    let mut scratch = vec![0.0f32; n * input_bus.channels];

    for bus in &snapshot {
        let upstream = match bus.owner.upgrade() {
            Some(node) => node,
            None => continue,
        };

        if upstream.read_counter.load(Ordering::Acquire) > tick {
            continue;
        }
        upstream.read_counter.store(tick + 1, Ordering::Release);

        bus.ref_count.fetch_add(1, Ordering::AcqRel);
        let produced = if first_contributor {
            node_read(&upstream, bus.bus_index, out, n, global_time, tick)
        } else {
            node_read(&upstream, bus.bus_index, &mut scratch, n, global_time, tick)
        };
        bus.ref_count.fetch_sub(1, Ordering::AcqRel);

        let volume = bus.volume();
        if first_contributor {
            for s in out.iter_mut().take(produced * input_bus.channels) {
                *s *= volume;
            }
            first_contributor = false;
        } else {
            for (dst, src) in out.iter_mut().zip(scratch.iter()).take(produced * input_bus.channels) {
                *dst += src * volume;
            }
        }
    }

    input_bus.readers_in_flight.fetch_sub(1, Ordering::AcqRel);
    n
}

/// Pull `n` frames from `node`'s output bus `bus_idx` into `out`, running
/// `process` at most once per tick regardless of how many downstream
/// consumers read from different buses.
pub fn node_read(node: &Node, bus_idx: usize, out: &mut [f32], n: usize, global_time: u64, tick: u32) -> usize {
    let channels_out = node.output_bus(bus_idx).channels;
    let (lead_silence, active_n) = node.effective_span(global_time, n);

    if active_n == 0 {
        for s in out.iter_mut().take(n * channels_out) {
            *s = 0.0;
        }
        return n;
    }

    let out_bus = node.output_bus(bus_idx);
    let input_count = node.input_bus_count();

    if input_count == 0 && node.output_bus_count() == 1 {
        let mut outputs: Vec<&mut [f32]> = vec![&mut out[..n * channels_out]];
        let mut proc = node.processor.lock().unwrap();
        proc.process(&[], 0, &mut outputs, n, global_time);
        node.local_time.fetch_add(n as u64, Ordering::Relaxed);
        return n;
    }

    // `has_read == true` means this bus's cached output is stale (either
    // it's the first read of a new tick, or every bus that was pulled in
    // the previous round has since been consumed) — reprocess. Otherwise a
    // sibling bus already drove `process` this tick; just copy the cache.
    let needs_reprocess = out_bus.has_read.load(Ordering::Acquire);

    let mut cache = node.cache.lock().unwrap();
    if needs_reprocess {
        for b in &node.output_buses {
            b.has_read.store(false, Ordering::Relaxed);
        }

        if cache.cached_frame_count_in == 0 {
            for (i, input_bus) in node.input_buses.iter().enumerate() {
                let cap = CACHE_CAP_FRAMES.min(n.max(1));
                let slab = &mut cache.input_slab[i];
                let channels = input_bus.channels;
                let produced = input_bus_read(input_bus, &mut slab[..cap * channels], cap, global_time, tick);
                cache.cached_frame_count_in = cache.cached_frame_count_in.max(produced);
            }
        }

        let m_in = cache.cached_frame_count_in;
        let m_out = active_n.min(CACHE_CAP_FRAMES);

        let input_refs: Vec<&[f32]> = cache.input_slab.iter().map(|s| s.as_slice()).collect();

        let mut output_bufs: Vec<Vec<f32>> = node
            .output_buses
            .iter()
            .map(|b| vec![0.0f32; m_out * b.channels])
            .collect();

        {
            let mut proc = node.processor.lock().unwrap();
            let mut output_refs: Vec<&mut [f32]> = output_bufs.iter_mut().map(|v| v.as_mut_slice()).collect();
            output_refs[bus_idx] = &mut out[lead_silence * channels_out..(lead_silence + m_out) * channels_out];
            proc.process(&input_refs, m_in, &mut output_refs, m_out, global_time);
        }

        for (i, slab) in cache.output_slab.iter_mut().enumerate() {
            if i != bus_idx {
                let channels = node.output_buses[i].channels;
                slab[..m_out * channels].copy_from_slice(&output_bufs[i][..m_out * channels]);
            }
        }

        cache.consumed_frame_count_in += m_in;
        cache.cached_frame_count_in = 0;
        cache.cached_frame_count_out = m_out;
    } else {
        let m_out = cache.cached_frame_count_out;
        let channels = channels_out;
        let slab = &cache.output_slab[bus_idx];
        out[lead_silence * channels..(lead_silence + m_out) * channels].copy_from_slice(&slab[..m_out * channels]);
    }

    for s in out.iter_mut().take(lead_silence * channels_out) {
        *s = 0.0;
    }
    for s in out.iter_mut().skip((lead_silence + active_n) * channels_out).take((n - lead_silence - active_n) * channels_out) {
        *s = 0.0;
    }

    node.local_time.fetch_add(n as u64, Ordering::Relaxed);
    n
}

/// Owns the dedicated endpoint node (identity passthrough) plus the
/// per-tick loop-detection counter.
pub struct NodeGraph {
    endpoint: Node,
    read_counter: AtomicU32,
}

struct IdentityProcessor {
    channels: usize,
}

impl Processor for IdentityProcessor {
    fn channels_in(&self, _bus: usize) -> usize {
        self.channels
    }
    fn channels_out(&self, _bus: usize) -> usize {
        self.channels
    }
    fn process(
        &mut self,
        inputs: &[&[f32]],
        frames_in: usize,
        outputs: &mut [&mut [f32]],
        frames_out: usize,
        _global_time: u64,
    ) {
        let n = frames_in.min(frames_out) * self.channels;
        outputs[0][..n].copy_from_slice(&inputs[0][..n]);
        for s in outputs[0][n..frames_out * self.channels].iter_mut() {
            *s = 0.0;
        }
    }
}

impl NodeGraph {
    pub fn new(channels: usize) -> Self {
        Self {
            endpoint: new_node(Box::new(IdentityProcessor { channels })),
            read_counter: AtomicU32::new(0),
        }
    }

    pub fn endpoint(&self) -> &Node {
        &self.endpoint
    }

    /// Advance the tick counter and pull `n` frames from the endpoint.
    pub fn read_pcm_frames(&self, out: &mut [f32], n: usize, global_time: u64) -> usize {
        let tick = self.read_counter.fetch_add(1, Ordering::AcqRel) + 1;
        node_read(&self.endpoint, 0, out, n, global_time, tick)
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    struct ConstantSource {
        channels: usize,
        frames: Vec<f32>,
        cursor: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Processor for ConstantSource {
        fn input_bus_count(&self) -> usize {
            0
        }
        fn channels_in(&self, _bus: usize) -> usize {
            0
        }
        fn channels_out(&self, _bus: usize) -> usize {
            self.channels
        }
        fn process(&mut self, _inputs: &[&[f32]], _frames_in: usize, outputs: &mut [&mut [f32]], frames_out: usize, _global_time: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for frame in 0..frames_out {
                for ch in 0..self.channels {
                    let idx = (self.cursor + frame) * self.channels + ch;
                    outputs[0][frame * self.channels + ch] = *self.frames.get(idx).unwrap_or(&0.0);
                }
            }
            self.cursor += frames_out;
        }
    }

    struct SplitterProcessor {
        channels: usize,
    }

    impl Processor for SplitterProcessor {
        fn input_bus_count(&self) -> usize {
            1
        }
        fn output_bus_count(&self) -> usize {
            2
        }
        fn channels_in(&self, _bus: usize) -> usize {
            self.channels
        }
        fn channels_out(&self, _bus: usize) -> usize {
            self.channels
        }
        fn process(&mut self, inputs: &[&[f32]], frames_in: usize, outputs: &mut [&mut [f32]], frames_out: usize, _global_time: u64) {
            let n = frames_in.min(frames_out) * self.channels;
            outputs[0][..n].copy_from_slice(&inputs[0][..n]);
            outputs[1][..n].copy_from_slice(&inputs[0][..n]);
        }
    }

    #[test]
    fn s1_bit_exact_passthrough() {
        let graph = NodeGraph::new(2);
        let source = new_node(Box::new(ConstantSource {
            channels: 2,
            frames: vec![1., 2., 3., 4., 5., 6., 7., 8., 9., 10., 11., 12., 13., 14., 15., 16.],
            cursor: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        attach_output_bus(&source, 0, graph.endpoint(), 0).unwrap();

        let mut out = vec![0.0; 16];
        let n = graph.read_pcm_frames(&mut out, 8, 0);
        assert_eq!(n, 8);
        assert_eq!(out, vec![1., 2., 3., 4., 5., 6., 7., 8., 9., 10., 11., 12., 13., 14., 15., 16.]);
    }

    #[test]
    fn s2_splitter_mixing_sums_to_original() {
        let graph = NodeGraph::new(1);
        let source = new_node(Box::new(ConstantSource {
            channels: 1,
            frames: vec![1.0; 8],
            cursor: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        let splitter = new_node(Box::new(SplitterProcessor { channels: 1 }));

        attach_output_bus(&source, 0, &splitter, 0).unwrap();
        attach_output_bus(&splitter, 0, graph.endpoint(), 0).unwrap();
        attach_output_bus(&splitter, 1, graph.endpoint(), 0).unwrap();

        graph.endpoint().output_bus(0);
        let input_bus = splitter.input_bus(0);
        let _ = input_bus;

        // Set per-bus volumes 0.25 / 0.75 on the splitter's two outputs.
        splitter.output_bus(0).set_volume(0.25);
        splitter.output_bus(1).set_volume(0.75);

        let mut out = vec![0.0; 8];
        graph.read_pcm_frames(&mut out, 8, 0);
        for s in out {
            assert_float_eq!(s, 1.0, abs <= 1e-5);
        }
    }

    #[test]
    fn s5_cycle_terminates_and_processes_source_once() {
        let graph = NodeGraph::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let source = new_node(Box::new(ConstantSource {
            channels: 1,
            frames: vec![0.1; 64],
            cursor: 0,
            calls: calls.clone(),
        }));
        let splitter = new_node(Box::new(SplitterProcessor { channels: 1 }));

        attach_output_bus(&source, 0, &splitter, 0).unwrap();
        attach_output_bus(&splitter, 0, graph.endpoint(), 0).unwrap();
        // Feed bus 1 back into the splitter's own input, forming a cycle.
        attach_output_bus(&splitter, 1, &splitter, 0).unwrap();

        let mut out = vec![0.0; 64];
        let n = graph.read_pcm_frames(&mut out, 64, 0);
        assert_eq!(n, 64);
        assert!(out.iter().all(|x| x.is_finite()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn property_10_concurrent_detach_and_read_never_panics() {
        let graph = NodeGraph::new(1);
        let source = new_node(Box::new(ConstantSource {
            channels: 1,
            frames: vec![0.5; 4096],
            cursor: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        attach_output_bus(&source, 0, graph.endpoint(), 0).unwrap();

        let endpoint = graph.endpoint().clone();
        let reader = std::thread::spawn(move || {
            let mut out = vec![0.0; 256];
            for i in 0..200 {
                node_read(&endpoint, 0, &mut out, 256, i * 256, 1);
            }
        });

        let source_for_detach = source.clone();
        let detacher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_micros(50));
            detach_output_bus(&source_for_detach, 0).unwrap();
        });

        reader.join().unwrap();
        detacher.join().unwrap();
    }
}
