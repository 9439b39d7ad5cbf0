//! The async resource manager (§3, §4.7, §4.8): a pool of worker threads
//! draining a job queue, plus the hash-keyed table of shared data-buffer
//! nodes that lets two sounds opened against the same path share one decode.

pub mod data_buffer;
pub mod data_stream;
pub mod job;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::ResourceManagerConfig;
use crate::data_source::{DataSource, DecoderFactory, SampleFormat};
use crate::error::{Error, Result};
use crate::job_queue::JobQueue;
use crate::murmur3::hash_path;
use crate::notification::{AsyncNotification, NotificationCode, NotificationEvent};
use crate::vfs::Vfs;

pub use data_buffer::{flags, DataBufferNode, DataPayload, ResourceManagerDataBuffer};
pub use data_stream::{DataStreamNode, ResourceManagerDataStream};
pub use job::{CustomJobFn, Job, JobCode, JobPayload, OrderedNode};

/// Fans a single job's completion out to every interested
/// `AsyncNotification` — the caller-supplied one passed to `*_init` (if any)
/// plus the manager's own internal wait-for-completion event.
struct ChainNotify(Vec<Arc<dyn AsyncNotification>>);

impl AsyncNotification for ChainNotify {
    fn on_signal(&self, code: NotificationCode) {
        for n in &self.0 {
            n.on_signal(code);
        }
    }
}

fn chained(event: &Arc<NotificationEvent>, extra: Option<Arc<dyn AsyncNotification>>) -> Arc<dyn AsyncNotification> {
    let mut chain: Vec<Arc<dyn AsyncNotification>> = vec![Arc::clone(event) as Arc<dyn AsyncNotification>];
    if let Some(n) = extra {
        chain.push(n);
    }
    Arc::new(ChainNotify(chain))
}

/// Owns the job queue, its worker threads, and the registry of shared
/// data-buffer nodes. One `ResourceManager` is normally shared by an entire
/// [`crate::engine::Engine`] (§3).
pub struct ResourceManager {
    queue: Arc<JobQueue<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    buffers: Mutex<BTreeMap<(u32, String), Arc<DataBufferNode>>>,
    vfs: Arc<dyn Vfs>,
    decoder_factory: Arc<dyn DecoderFactory>,
    config: ResourceManagerConfig,
}

impl ResourceManager {
    pub fn new(
        config: ResourceManagerConfig,
        vfs: Arc<dyn Vfs>,
        decoder_factory: Arc<dyn DecoderFactory>,
    ) -> Arc<Self> {
        let queue = Arc::new(JobQueue::new(config.job_queue.capacity, true));
        let rm = Arc::new(Self {
            queue: Arc::clone(&queue),
            workers: Mutex::new(Vec::new()),
            buffers: Mutex::new(BTreeMap::new()),
            vfs,
            decoder_factory,
            config,
        });

        let mut workers = Vec::new();
        for i in 0..rm.config.job_thread_count.max(1) {
            let queue = Arc::clone(&queue);
            let vfs = Arc::clone(&rm.vfs);
            let decoder_factory = Arc::clone(&rm.decoder_factory);
            let handle = std::thread::Builder::new()
                .name(format!("resource-manager-worker-{}", i))
                .spawn(move || worker_loop(queue, vfs, decoder_factory))
                .expect("failed to spawn resource manager worker thread");
            workers.push(handle);
        }
        *rm.workers.lock().unwrap() = workers;
        rm
    }

    /// Open (or join) a shared data-buffer connector for `path` (§4.7).
    /// `flags` is a bitmask of [`flags`]. Blocks until the node leaves `Busy`
    /// when `flags::WAIT_INIT` is set; otherwise returns immediately and the
    /// connector reports `Busy` on reads until the background load lands.
    pub fn data_buffer_init(
        &self,
        path: &str,
        req_flags: u32,
        notify: Option<Arc<dyn AsyncNotification>>,
    ) -> Result<ResourceManagerDataBuffer> {
        let hash = hash_path(path);
        let key = (hash, path.to_string());

        let (node, is_new) = {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(existing) = buffers.get(&key) {
                existing.incref();
                (Arc::clone(existing), false)
            } else {
                let node = Arc::new(DataBufferNode::new(hash, path.to_string(), true));
                node.incref();
                buffers.insert(key, Arc::clone(&node));
                (node, true)
            }
        };

        if req_flags & flags::STREAM != 0 && !node.is_data_owned_by_rm {
            node.decref();
            return Err(Error::InvalidArgs);
        }

        if is_new {
            let event = Arc::new(NotificationEvent::new());
            let job_notify = chained(&event, notify);

            self.queue.post(Job::new_ordered(
                JobCode::LoadDataBuffer,
                JobPayload::LoadDataBuffer {
                    node: Arc::clone(&node),
                    path: path.to_string(),
                    decode: req_flags & flags::DECODE != 0,
                    notify: Some(job_notify),
                },
                node.as_ref(),
            ))?;

            if req_flags & flags::WAIT_INIT != 0 {
                event.wait();
                node.check_alive()?;
            }
        } else if req_flags & flags::WAIT_INIT != 0 {
            while node.is_busy() {
                std::thread::yield_now();
            }
            node.check_alive()?;
        }

        Ok(ResourceManagerDataBuffer::new(node, req_flags))
    }

    /// Release a data-buffer connector. Frees the shared node (posting
    /// `FreeDataBuffer` and waiting for it to land) once the last reference
    /// drops, so the caller's own `uninit` never races a worker still
    /// touching the node.
    pub fn data_buffer_uninit(&self, buffer: ResourceManagerDataBuffer) -> Result<()> {
        let node = buffer.node_arc();
        let path = buffer.node_path().to_string();
        drop(buffer);

        if node.decref() > 0 {
            return Ok(());
        }
        if !node.is_data_owned_by_rm {
            return Ok(());
        }

        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(current) = buffers.get(&(node.hashed_name, path.clone())) {
                if Arc::ptr_eq(current, &node) {
                    buffers.remove(&(node.hashed_name, path));
                }
            }
        }

        let event = Arc::new(NotificationEvent::new());
        self.queue.post(Job::new_ordered(
            JobCode::FreeDataBuffer,
            JobPayload::FreeDataBuffer {
                node: Arc::clone(&node),
                notify: Some(Arc::clone(&event) as Arc<dyn AsyncNotification>),
            },
            node.as_ref(),
        ))?;
        event.wait();
        Ok(())
    }

    /// Register caller-owned, already-decoded PCM under `path` so future
    /// `data_buffer_init` calls for that path are served without touching the
    /// `Vfs` or a decoder (§4.7). `flags::STREAM` is invalid against
    /// registered data — `data_buffer_init` rejects that combination.
    pub fn register_decoded_data(
        &self,
        path: &str,
        frames: Vec<f32>,
        channels: u32,
        rate: u32,
    ) -> Result<()> {
        let hash = hash_path(path);
        let key = (hash, path.to_string());
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.contains_key(&key) {
            return Err(Error::InvalidOperation);
        }
        let node = Arc::new(DataBufferNode::new(hash, path.to_string(), false));
        let total = if channels > 0 {
            frames.len() / channels as usize
        } else {
            0
        };
        node.set_data(DataPayload::Decoded {
            frames,
            format: SampleFormat::F32,
            channels,
            rate,
        });
        node.set_format_known();
        node.advance_decoded_frame_count(total);
        node.set_total_frame_count(total);
        node.set_success();
        buffers.insert(key, node);
        Ok(())
    }

    pub fn unregister_data(&self, path: &str) -> Result<()> {
        let hash = hash_path(path);
        let key = (hash, path.to_string());
        let mut buffers = self.buffers.lock().unwrap();
        match buffers.get(&key) {
            Some(node) if !node.is_data_owned_by_rm => {
                buffers.remove(&key);
                Ok(())
            }
            Some(_) => Err(Error::InvalidOperation),
            None => Err(Error::InvalidArgs),
        }
    }

    /// Open a fresh, unshared streaming connector (§4.8). Always blocks until
    /// the decoder is open and the first two pages are filled, since a
    /// stream is useless (format unknown) before that.
    pub fn data_stream_init(
        &self,
        path: &str,
        is_looping: bool,
        notify: Option<Arc<dyn AsyncNotification>>,
    ) -> Result<ResourceManagerDataStream> {
        let node = DataStreamNode::new(self.config.page_size_in_seconds, is_looping);

        let event = Arc::new(NotificationEvent::new());
        let job_notify = chained(&event, notify);

        self.queue.post(Job::new_ordered(
            JobCode::LoadDataStream,
            JobPayload::LoadDataStream {
                node: Arc::clone(&node),
                path: path.to_string(),
                notify: Some(job_notify),
            },
            node.as_ref(),
        ))?;
        event.wait();
        node.check_alive()?;

        Ok(ResourceManagerDataStream::new(node))
    }

    pub fn data_stream_uninit(&self, stream: ResourceManagerDataStream) -> Result<()> {
        let node = Arc::clone(&stream.node);
        drop(stream);
        let event = Arc::new(NotificationEvent::new());
        self.queue.post(Job::new_ordered(
            JobCode::FreeDataStream,
            JobPayload::FreeDataStream {
                node: Arc::clone(&node),
                notify: Some(Arc::clone(&event) as Arc<dyn AsyncNotification>),
            },
            node.as_ref(),
        ))?;
        event.wait();
        Ok(())
    }

    /// Request the next page of a stream be refilled one step ahead of the
    /// consumer, off the render thread (§4.8).
    pub fn data_stream_request_page(&self, stream: &ResourceManagerDataStream, page_index: usize) -> Result<()> {
        self.queue.post(Job::new_ordered(
            JobCode::PageDataStream,
            JobPayload::PageDataStream {
                node: Arc::clone(&stream.node),
                page_index,
            },
            stream.node.as_ref(),
        ))
    }

    pub fn data_stream_seek(&self, stream: &ResourceManagerDataStream, frame_index: u64) -> Result<()> {
        stream.node.begin_seek();
        self.queue.post(Job::new_ordered(
            JobCode::SeekDataStream,
            JobPayload::SeekDataStream {
                node: Arc::clone(&stream.node),
                frame_index,
            },
            stream.node.as_ref(),
        ))
    }

    /// Escape hatch for ad-hoc work that wants the resource manager's
    /// worker-thread execution ordering without a dedicated job kind (§6).
    pub fn post_custom_job(&self, f: CustomJobFn) -> Result<()> {
        self.queue.post(Job::new(JobCode::Custom, JobPayload::Custom(f)))
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let thread_count = self.workers.lock().unwrap().len();
        for _ in 0..thread_count {
            let _ = self.queue.post(Job::quit());
        }
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// The node a job targets, for the per-node FIFO check below. `None` for
/// jobs with no single owning node (`Quit`, `Custom`).
fn job_order_node(job: &Job) -> Option<Arc<dyn OrderedNode + Send + Sync>> {
    match &job.payload {
        JobPayload::LoadDataBuffer { node, .. }
        | JobPayload::FreeDataBuffer { node, .. }
        | JobPayload::PageDataBuffer { node, .. } => Some(Arc::clone(node) as Arc<dyn OrderedNode + Send + Sync>),
        JobPayload::LoadDataStream { node, .. }
        | JobPayload::FreeDataStream { node, .. }
        | JobPayload::PageDataStream { node, .. }
        | JobPayload::SeekDataStream { node, .. } => Some(Arc::clone(node) as Arc<dyn OrderedNode + Send + Sync>),
        JobPayload::Quit | JobPayload::Custom(_) => None,
    }
}

fn worker_loop(queue: Arc<JobQueue<Job>>, vfs: Arc<dyn Vfs>, decoder_factory: Arc<dyn DecoderFactory>) {
    loop {
        match queue.next() {
            Ok(job) => {
                let node = job_order_node(&job);
                if let Some(node) = &node {
                    // Out of turn: another job for this node must run first.
                    // Repost to the back of the queue and let a sibling
                    // worker (or a later pop of this one) pick it up once
                    // its predecessor has advanced the pointer.
                    if job.order != node.execution_pointer() {
                        if queue.post(job).is_err() {
                            return;
                        }
                        std::thread::yield_now();
                        continue;
                    }
                }
                run_job(job, &vfs, &decoder_factory);
                if let Some(node) = node {
                    node.advance_execution_pointer();
                }
            }
            Err(Error::Cancelled) => return,
            Err(Error::NoDataAvailable) => continue,
            Err(_) => continue,
        }
    }
}

fn run_job(job: Job, vfs: &Arc<dyn Vfs>, decoder_factory: &Arc<dyn DecoderFactory>) {
    match job.payload {
        JobPayload::Quit => {}
        JobPayload::LoadDataBuffer {
            node,
            path,
            decode,
            notify,
        } => {
            load_data_buffer(&node, vfs, decoder_factory, &path, decode);
            if let Some(n) = notify {
                let code = if node.check_alive().is_ok() {
                    NotificationCode::Complete
                } else {
                    NotificationCode::Failed
                };
                n.on_signal(code);
            }
        }
        JobPayload::FreeDataBuffer { node, notify } => {
            node.set_unavailable();
            if let Some(n) = notify {
                n.on_signal(NotificationCode::Complete);
            }
        }
        JobPayload::PageDataBuffer { .. } => {
            // Data buffers are loaded whole in `load_data_buffer`; nothing to
            // page incrementally once the initial load job completes.
        }
        JobPayload::LoadDataStream { node, path, notify } => match decoder_factory.open(vfs.as_ref(), &path) {
            Ok(decoder) => {
                node.load(decoder);
                if let Some(n) = notify {
                    n.on_signal(NotificationCode::Complete);
                }
            }
            Err(e) => {
                node.latch_error(e);
                if let Some(n) = notify {
                    n.on_signal(NotificationCode::Failed);
                }
            }
        },
        JobPayload::FreeDataStream { node, notify } => {
            node.set_unavailable();
            if let Some(n) = notify {
                n.on_signal(NotificationCode::Complete);
            }
        }
        JobPayload::PageDataStream { node, page_index } => {
            node.fill_page(page_index);
        }
        JobPayload::SeekDataStream { node, frame_index } => {
            node.seek_and_refill(frame_index);
            node.end_seek();
        }
        JobPayload::Custom(f) => f(),
    }
}

fn load_data_buffer(
    node: &Arc<DataBufferNode>,
    vfs: &Arc<dyn Vfs>,
    decoder_factory: &Arc<dyn DecoderFactory>,
    path: &str,
    decode: bool,
) {
    if !decode {
        match vfs.open_and_read_file(path) {
            Ok(bytes) => {
                node.set_data(DataPayload::Encoded(bytes));
                node.set_format_known();
                node.set_success();
            }
            Err(e) => node.latch_error(e),
        }
        return;
    }

    let mut decoder = match decoder_factory.open(vfs.as_ref(), path) {
        Ok(d) => d,
        Err(e) => {
            node.latch_error(e);
            return;
        }
    };

    let channels = decoder.channels();
    let rate = decoder.sample_rate();
    node.set_format_known();

    let mut frames: Vec<f32> = Vec::new();
    let chunk_frames = 4096usize;
    let mut scratch = vec![0.0f32; chunk_frames * channels.max(1) as usize];

    loop {
        match decoder.read_pcm_frames(&mut scratch, chunk_frames, false) {
            Ok(0) => break,
            Ok(n) => {
                frames.extend_from_slice(&scratch[..n * channels.max(1) as usize]);
                node.set_data(DataPayload::Decoded {
                    frames: frames.clone(),
                    format: SampleFormat::F32,
                    channels,
                    rate,
                });
                node.advance_decoded_frame_count(frames.len() / channels.max(1) as usize);
            }
            Err(Error::AtEnd) => break,
            Err(e) => {
                node.latch_error(e);
                return;
            }
        }
    }

    let total = frames.len() / channels.max(1) as usize;
    node.set_total_frame_count(total);
    node.set_success();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::RawPcmDecoderFactory;
    use crate::vfs::MemoryVfs;

    fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    fn test_manager() -> Arc<ResourceManager> {
        let mut vfs = MemoryVfs::new();
        vfs.insert("tone.pcm", pcm_bytes(&[0.1, -0.1, 0.2, -0.2, 0.3, -0.3]));
        vfs.insert("tone2.pcm", pcm_bytes(&[1.0, -1.0]));
        ResourceManager::new(
            ResourceManagerConfig::default(),
            Arc::new(vfs),
            Arc::new(RawPcmDecoderFactory::new(1, 48_000)),
        )
    }

    #[test]
    fn wait_init_blocks_until_decoded_and_reads_match_file() {
        let rm = test_manager();
        let mut conn = rm
            .data_buffer_init("tone.pcm", flags::DECODE | flags::WAIT_INIT, None)
            .unwrap();
        let mut out = [0f32; 3];
        assert_eq!(conn.read_pcm_frames(&mut out, 3, false).unwrap(), 3);
        assert_eq!(out, [0.1, -0.1, 0.2]);
        rm.data_buffer_uninit(conn).unwrap();
    }

    #[test]
    fn two_inits_of_the_same_path_share_one_node() {
        let rm = test_manager();
        let a = rm
            .data_buffer_init("tone.pcm", flags::DECODE | flags::WAIT_INIT, None)
            .unwrap();
        let b = rm
            .data_buffer_init("tone.pcm", flags::DECODE | flags::WAIT_INIT, None)
            .unwrap();
        assert_eq!(a.node_hashed_name(), b.node_hashed_name());
        rm.data_buffer_uninit(a).unwrap();
        rm.data_buffer_uninit(b).unwrap();
    }

    #[test]
    fn stream_flag_against_registered_data_is_rejected() {
        let rm = test_manager();
        rm.register_decoded_data("clip", vec![0.5, 0.5, 0.5, 0.5], 1, 48_000)
            .unwrap();
        let err = rm.data_buffer_init("clip", flags::STREAM, None).unwrap_err();
        assert_eq!(err, Error::InvalidArgs);
    }

    #[test]
    fn registered_data_is_readable_without_a_decode_job() {
        let rm = test_manager();
        rm.register_decoded_data("clip", vec![0.5, -0.5], 1, 48_000)
            .unwrap();
        let mut conn = rm.data_buffer_init("clip", 0, None).unwrap();
        let mut out = [0f32; 2];
        assert_eq!(conn.read_pcm_frames(&mut out, 2, false).unwrap(), 2);
        assert_eq!(out, [0.5, -0.5]);
        rm.data_buffer_uninit(conn).unwrap();
    }

    #[test]
    fn data_stream_init_opens_decoder_and_fills_both_pages() {
        let rm = test_manager();
        let mut stream = rm.data_stream_init("tone2.pcm", false, None).unwrap();
        let mut out = [0f32; 2];
        assert_eq!(stream.read_pcm_frames(&mut out, 2, false).unwrap(), 2);
        assert_eq!(out, [1.0, -1.0]);
        rm.data_stream_uninit(stream).unwrap();
    }

    #[test]
    fn data_stream_looping_wraps_past_end_of_file() {
        let rm = test_manager();
        let mut stream = rm.data_stream_init("tone2.pcm", true, None).unwrap();
        let mut out = [0f32; 4];
        let n = stream.read_pcm_frames(&mut out, 4, true).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, [1.0, -1.0, 1.0, -1.0]);
        rm.data_stream_uninit(stream).unwrap();
    }

    #[test]
    fn unregistering_unknown_path_is_invalid_args() {
        let rm = test_manager();
        assert_eq!(rm.unregister_data("nope").unwrap_err(), Error::InvalidArgs);
    }

    /// Scenario S6 / Testable Property 6: K threads opening the same path
    /// concurrently must join a single backing node (one entry in the
    /// `buffers` table, `ref_count == K` once every init has landed), and
    /// once all K connectors are released the node drops out of the table
    /// entirely — no leaked entry, no double-free.
    #[test]
    fn concurrent_init_and_uninit_of_the_same_path_leaves_a_single_shared_node() {
        use std::sync::Barrier;

        const K: usize = 8;
        let rm = test_manager();
        let start = Arc::new(Barrier::new(K));

        let handles: Vec<_> = (0..K)
            .map(|_| {
                let rm = Arc::clone(&rm);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    rm.data_buffer_init("tone.pcm", flags::DECODE | flags::WAIT_INIT, None)
                        .unwrap()
                })
            })
            .collect();

        let conns: Vec<ResourceManagerDataBuffer> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let hash = hash_path("tone.pcm");
        {
            let buffers = rm.buffers.lock().unwrap();
            assert_eq!(buffers.len(), 1);
            let node = &buffers[&(hash, "tone.pcm".to_string())];
            assert_eq!(node.ref_count(), K as u32);
        }
        for pair in conns.windows(2) {
            assert_eq!(pair[0].node_hashed_name(), pair[1].node_hashed_name());
        }

        let end = Arc::new(Barrier::new(K));
        let handles: Vec<_> = conns
            .into_iter()
            .map(|conn| {
                let rm = Arc::clone(&rm);
                let end = Arc::clone(&end);
                std::thread::spawn(move || {
                    end.wait();
                    rm.data_buffer_uninit(conn).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let buffers = rm.buffers.lock().unwrap();
        assert!(!buffers.contains_key(&(hash, "tone.pcm".to_string())));
    }
}
