//! The shared, hash-keyed data-buffer node (§3, §4.7) and the per-reference
//! connector handed out by `ResourceManager::data_buffer_init`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::data_source::{DataSource, SampleFormat};
use crate::error::{Error, Result};

/// Bitmask flags a caller passes to `data_buffer_init` / `data_stream_init`
/// (§6).
pub mod flags {
    pub const STREAM: u32 = 1;
    pub const DECODE: u32 = 2;
    pub const ASYNC: u32 = 4;
    pub const WAIT_INIT: u32 = 8;
    pub const NO_DEFAULT_ATTACHMENT: u32 = 16;
    pub const DISABLE_PITCH: u32 = 32;
}

const RESULT_BUSY: u8 = 0;
const RESULT_SUCCESS: u8 = 1;
const RESULT_UNAVAILABLE: u8 = 2;
const RESULT_ERROR: u8 = 3;

/// The raw payload a [`DataBufferNode`] carries: either still-encoded bytes
/// (decoding deferred to the connector) or already-decoded PCM frames.
pub enum DataPayload {
    Encoded(Vec<u8>),
    Decoded {
        frames: Vec<f32>,
        format: SampleFormat,
        channels: u32,
        rate: u32,
    },
}

/// The shared node backing every handle opened against the same path. One
/// node exists per distinct `hashed_name` for the lifetime its `ref_count` is
/// nonzero (§3, §4.7).
pub struct DataBufferNode {
    pub hashed_name: u32,
    pub path: String,
    pub is_data_owned_by_rm: bool,
    ref_count: AtomicU32,
    result: AtomicU8,
    error: Mutex<Option<Error>>,
    /// Set once the connector's format/channels/rate are known — distinct
    /// from `result`, which may still read `Busy` while paging continues
    /// after the connector has already become usable (§4.7).
    format_known: AtomicBool,
    /// Monotonically increasing watermark of frames safely readable so far.
    /// Release-stored after `data` and the frame count are set (§5).
    decoded_frame_count: AtomicUsize,
    total_frame_count: AtomicUsize,
    total_known: AtomicBool,
    pub(crate) execution_counter: AtomicU64,
    pub(crate) execution_pointer: AtomicU64,
    data: Mutex<Option<DataPayload>>,
}

impl DataBufferNode {
    pub fn new(hashed_name: u32, path: String, is_data_owned_by_rm: bool) -> Self {
        Self {
            hashed_name,
            path,
            is_data_owned_by_rm,
            ref_count: AtomicU32::new(0),
            result: AtomicU8::new(RESULT_BUSY),
            error: Mutex::new(None),
            format_known: AtomicBool::new(false),
            decoded_frame_count: AtomicUsize::new(0),
            total_frame_count: AtomicUsize::new(0),
            total_known: AtomicBool::new(false),
            execution_counter: AtomicU64::new(0),
            execution_pointer: AtomicU64::new(0),
            data: Mutex::new(None),
        }
    }

    pub fn incref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the ref count, returning the value after decrement.
    pub fn decref(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.result.load(Ordering::Acquire) == RESULT_BUSY
    }

    pub fn set_success(&self) {
        self.result.store(RESULT_SUCCESS, Ordering::Release);
    }

    pub fn set_unavailable(&self) {
        self.result.store(RESULT_UNAVAILABLE, Ordering::Release);
    }

    /// CAS `Busy -> error_code`, matching §7's "never overwriting a
    /// non-Busy state" latch policy.
    pub fn latch_error(&self, e: Error) {
        if self
            .result
            .compare_exchange(RESULT_BUSY, RESULT_ERROR, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.error.lock().unwrap() = Some(e);
        }
    }

    pub fn set_format_known(&self) {
        self.format_known.store(true, Ordering::Release);
    }

    pub fn is_format_known(&self) -> bool {
        self.format_known.load(Ordering::Acquire)
    }

    pub fn set_data(&self, payload: DataPayload) {
        *self.data.lock().unwrap() = Some(payload);
    }

    pub fn advance_decoded_frame_count(&self, n: usize) {
        self.decoded_frame_count.store(n, Ordering::Release);
    }

    pub fn decoded_frame_count(&self) -> usize {
        self.decoded_frame_count.load(Ordering::Acquire)
    }

    pub fn set_total_frame_count(&self, n: usize) {
        self.total_frame_count.store(n, Ordering::Release);
        self.total_known.store(true, Ordering::Release);
    }

    pub fn total_frame_count(&self) -> Option<usize> {
        if self.total_known.load(Ordering::Acquire) {
            Some(self.total_frame_count.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Overall lifecycle check every fallible connector op must pass first:
    /// `Unavailable`/`Error` fence all further observable work.
    pub fn check_alive(&self) -> Result<()> {
        match self.result.load(Ordering::Acquire) {
            RESULT_UNAVAILABLE => Err(Error::Unavailable),
            RESULT_ERROR => Err(self.error.lock().unwrap().unwrap_or(Error::InvalidOperation)),
            _ => Ok(()),
        }
    }

    pub fn with_frames<R>(&self, f: impl FnOnce(Option<&[f32]>, u32) -> R) -> R {
        let guard = self.data.lock().unwrap();
        match guard.as_ref() {
            Some(DataPayload::Decoded { frames, channels, .. }) => f(Some(frames), *channels),
            _ => f(None, 0),
        }
    }

    pub fn format(&self) -> Option<(SampleFormat, u32, u32)> {
        let guard = self.data.lock().unwrap();
        match guard.as_ref() {
            Some(DataPayload::Decoded { format, channels, rate, .. }) => {
                Some((*format, *channels, *rate))
            }
            _ => None,
        }
    }
}

/// Per-reference handle returned by `data_buffer_init`. Adapts the shared
/// node's data into a seekable [`DataSource`] (§3's "connector").
pub struct ResourceManagerDataBuffer {
    node: std::sync::Arc<DataBufferNode>,
    flags: u32,
    cursor: u64,
    seek_to_cursor_on_next_read: bool,
    is_looping: bool,
}

impl ResourceManagerDataBuffer {
    pub(crate) fn new(node: std::sync::Arc<DataBufferNode>, flags: u32) -> Self {
        if flags & flags::STREAM != 0 && !node.is_data_owned_by_rm {
            // Caller misuse guarded at the ResourceManager layer; defensive
            // no-op here since this type has no fallible constructor.
        }
        Self {
            node,
            flags,
            cursor: 0,
            seek_to_cursor_on_next_read: false,
            is_looping: false,
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn node_hashed_name(&self) -> u32 {
        self.node.hashed_name
    }

    pub fn node_path(&self) -> &str {
        &self.node.path
    }

    pub(crate) fn node_arc(&self) -> std::sync::Arc<DataBufferNode> {
        std::sync::Arc::clone(&self.node)
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.is_looping = looping;
    }

    pub fn is_looping(&self) -> bool {
        self.is_looping
    }
}

impl DataSource for ResourceManagerDataBuffer {
    fn read_pcm_frames(
        &mut self,
        dst: &mut [f32],
        frame_count: usize,
        is_looping: bool,
    ) -> Result<usize> {
        self.node.check_alive()?;
        if !self.node.is_format_known() {
            return Err(Error::Busy);
        }
        if self.seek_to_cursor_on_next_read {
            self.seek_to_cursor_on_next_read = false;
        }

        let looping = is_looping || self.is_looping;
        let watermark = self.node.decoded_frame_count();
        let total = self.node.total_frame_count();

        self.node.with_frames(|frames, channels| {
            let frames = match frames {
                Some(f) => f,
                None => return Err(Error::Busy),
            };
            let channels = channels as usize;
            let mut written = 0usize;

            while written < frame_count {
                if self.cursor >= watermark as u64 {
                    match total {
                        Some(t) if watermark >= t => {
                            if looping && t > 0 {
                                self.cursor = 0;
                            } else {
                                break;
                            }
                        }
                        _ => {
                            if written > 0 {
                                return Ok(written);
                            }
                            return Err(Error::Busy);
                        }
                    }
                }
                let remaining = watermark as u64 - self.cursor;
                let take = (remaining as usize).min(frame_count - written);
                if take == 0 {
                    break;
                }
                let src = self.cursor as usize * channels;
                let dst_off = written * channels;
                dst[dst_off..dst_off + take * channels]
                    .copy_from_slice(&frames[src..src + take * channels]);
                self.cursor += take as u64;
                written += take;
            }

            if written == 0 && frame_count > 0 && !looping {
                if let Some(t) = total {
                    if self.cursor >= t as u64 {
                        return Err(Error::AtEnd);
                    }
                }
            }
            Ok(written)
        })
    }

    fn seek_to_pcm_frame(&mut self, frame_index: u64) -> Result<()> {
        self.node.check_alive()?;
        self.cursor = frame_index;
        self.seek_to_cursor_on_next_read = true;
        Ok(())
    }

    fn format(&self) -> SampleFormat {
        self.node.format().map(|(f, _, _)| f).unwrap_or(SampleFormat::F32)
    }

    fn channels(&self) -> u32 {
        self.node.format().map(|(_, c, _)| c).unwrap_or(0)
    }

    fn sample_rate(&self) -> u32 {
        self.node.format().map(|(_, _, r)| r).unwrap_or(0)
    }

    fn cursor_in_pcm_frames(&self) -> Result<u64> {
        Ok(self.cursor)
    }

    fn length_in_pcm_frames(&self) -> Result<u64> {
        self.node
            .total_frame_count()
            .map(|n| n as u64)
            .ok_or(Error::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ready_node(frames: Vec<f32>, channels: u32, rate: u32) -> Arc<DataBufferNode> {
        let node = Arc::new(DataBufferNode::new(1, "x.pcm".into(), true));
        let total = frames.len() / channels as usize;
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
        node
    }

    #[test]
    fn read_before_format_known_is_busy() {
        let node = Arc::new(DataBufferNode::new(1, "x.pcm".into(), true));
        let mut conn = ResourceManagerDataBuffer::new(node, 0);
        let mut out = [0f32; 4];
        assert_eq!(conn.read_pcm_frames(&mut out, 2, false).unwrap_err(), Error::Busy);
    }

    #[test]
    fn read_past_watermark_mid_decode_is_busy_not_at_end() {
        let node = Arc::new(DataBufferNode::new(1, "x.pcm".into(), true));
        node.set_data(DataPayload::Decoded {
            frames: vec![1.0, 2.0],
            format: SampleFormat::F32,
            channels: 1,
            rate: 48_000,
        });
        node.set_format_known();
        node.advance_decoded_frame_count(2);
        // total is still unknown: paging continues.
        let mut conn = ResourceManagerDataBuffer::new(node, 0);
        let mut out = [0f32; 4];
        assert_eq!(conn.read_pcm_frames(&mut out, 4, false).unwrap_err(), Error::Busy);
    }

    #[test]
    fn read_at_true_end_reports_at_end() {
        let node = ready_node(vec![1.0, 2.0, 3.0], 1, 48_000);
        let mut conn = ResourceManagerDataBuffer::new(node, 0);
        let mut out = [0f32; 3];
        assert_eq!(conn.read_pcm_frames(&mut out, 3, false).unwrap(), 3);
        assert_eq!(conn.read_pcm_frames(&mut out, 1, false).unwrap_err(), Error::AtEnd);
    }

    #[test]
    fn looping_wraps_at_total_frame_count() {
        let node = ready_node(vec![1.0, 2.0, 3.0], 1, 48_000);
        let mut conn = ResourceManagerDataBuffer::new(node, 0);
        conn.set_looping(true);
        let mut out = [0f32; 5];
        let n = conn.read_pcm_frames(&mut out, 5, false).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, [1.0, 2.0, 3.0, 1.0, 2.0]);
    }

    #[test]
    fn seek_moves_cursor_and_is_reflected_on_next_read() {
        let node = ready_node(vec![1.0, 2.0, 3.0, 4.0], 1, 48_000);
        let mut conn = ResourceManagerDataBuffer::new(node, 0);
        conn.seek_to_pcm_frame(2).unwrap();
        assert_eq!(conn.cursor_in_pcm_frames().unwrap(), 2);
        let mut out = [0f32; 2];
        assert_eq!(conn.read_pcm_frames(&mut out, 2, false).unwrap(), 2);
        assert_eq!(out, [3.0, 4.0]);
    }

    #[test]
    fn error_result_is_latched_and_observable_on_read() {
        let node = Arc::new(DataBufferNode::new(1, "x.pcm".into(), true));
        node.latch_error(Error::Unavailable);
        let mut conn = ResourceManagerDataBuffer::new(node, 0);
        let mut out = [0f32; 2];
        assert_eq!(conn.read_pcm_frames(&mut out, 2, false).unwrap_err(), Error::Unavailable);
    }

    #[test]
    fn latch_error_does_not_overwrite_an_already_resolved_result() {
        let node = Arc::new(DataBufferNode::new(1, "x.pcm".into(), true));
        node.set_success();
        node.latch_error(Error::Unavailable);
        assert!(node.check_alive().is_ok());
    }

    #[test]
    fn concurrent_incref_decref_never_drifts_ref_count() {
        let node = Arc::new(DataBufferNode::new(1, "x.pcm".into(), true));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let node = Arc::clone(&node);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    node.incref();
                    node.decref();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(node.ref_count(), 0);
    }
}
