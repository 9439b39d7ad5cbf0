//! Streaming playback: a two-page decode buffer (§3, §4.8) that a resource
//! manager worker keeps filled one page ahead of a consumer's cursor, so the
//! consumer thread never blocks on decode or file I/O.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::data_source::{DataSource, SampleFormat};
use crate::error::{Error, Result};

const RESULT_ALIVE: u8 = 0;
const RESULT_UNAVAILABLE: u8 = 1;
const RESULT_ERROR: u8 = 2;

struct StreamInner {
    decoder: Option<Box<dyn DataSource>>,
    pages: [Vec<f32>; 2],
    is_looping: bool,
}

/// The worker-visible, ref-counted state of one streaming handle: the
/// decoder, its two pages, and the bookkeeping a `PageDataStream` /
/// `SeekDataStream` job mutates. Not shared across handles (§3: "created per
/// handle, no sharing") — the `Arc` exists purely so a posted job can outlive
/// the call that posted it.
pub struct DataStreamNode {
    pub(crate) execution_counter: AtomicU64,
    pub(crate) execution_pointer: AtomicU64,
    result: AtomicU8,
    error: Mutex<Option<Error>>,
    seek_counter: AtomicU32,
    is_decoder_at_end: AtomicBool,
    total_length: AtomicU64,
    total_known: AtomicBool,
    channels: AtomicU32,
    rate: AtomicU32,
    format_known: AtomicBool,
    page_size_in_seconds: f32,
    /// Frame count per page, resolved from `page_size_in_seconds` once the
    /// decoder's sample rate is known (`load`'s first job).
    page_size_in_frames: AtomicUsize,
    current_page_index: AtomicUsize,
    page_frame_count: [AtomicUsize; 2],
    page_valid: [AtomicBool; 2],
    inner: Mutex<StreamInner>,
}

impl DataStreamNode {
    pub fn new(page_size_in_seconds: f32, is_looping: bool) -> Arc<Self> {
        Arc::new(Self {
            execution_counter: AtomicU64::new(0),
            execution_pointer: AtomicU64::new(0),
            result: AtomicU8::new(RESULT_ALIVE),
            error: Mutex::new(None),
            seek_counter: AtomicU32::new(0),
            is_decoder_at_end: AtomicBool::new(false),
            total_length: AtomicU64::new(0),
            total_known: AtomicBool::new(false),
            channels: AtomicU32::new(0),
            rate: AtomicU32::new(0),
            format_known: AtomicBool::new(false),
            page_size_in_seconds,
            page_size_in_frames: AtomicUsize::new(0),
            current_page_index: AtomicUsize::new(0),
            page_frame_count: [AtomicUsize::new(0), AtomicUsize::new(0)],
            page_valid: [AtomicBool::new(false), AtomicBool::new(false)],
            inner: Mutex::new(StreamInner {
                decoder: None,
                pages: [Vec::new(), Vec::new()],
                is_looping,
            }),
        })
    }

    pub fn check_alive(&self) -> Result<()> {
        match self.result.load(Ordering::Acquire) {
            RESULT_UNAVAILABLE => Err(Error::Unavailable),
            RESULT_ERROR => Err(self.error.lock().unwrap().unwrap_or(Error::InvalidOperation)),
            _ => Ok(()),
        }
    }

    pub fn set_unavailable(&self) {
        self.result.store(RESULT_UNAVAILABLE, Ordering::Release);
    }

    pub fn latch_error(&self, e: Error) {
        if self
            .result
            .compare_exchange(RESULT_ALIVE, RESULT_ERROR, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.error.lock().unwrap() = Some(e);
        }
    }

    pub fn begin_seek(&self) {
        self.seek_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_seek(&self) {
        self.seek_counter.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_seeking(&self) -> bool {
        self.seek_counter.load(Ordering::Acquire) > 0
    }

    pub fn format(&self) -> Option<(SampleFormat, u32, u32)> {
        if self.format_known.load(Ordering::Acquire) {
            Some((
                SampleFormat::F32,
                self.channels.load(Ordering::Acquire),
                self.rate.load(Ordering::Acquire),
            ))
        } else {
            None
        }
    }

    pub fn total_length_in_pcm_frames(&self) -> Option<u64> {
        if self.total_known.load(Ordering::Acquire) {
            Some(self.total_length.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn set_total_length(&self, n: u64) {
        self.total_length.store(n, Ordering::Release);
        self.total_known.store(true, Ordering::Release);
    }

    /// Open the decoder and fill both pages. Run once, from the
    /// `LoadDataStream` job (or inline if synchronous).
    pub fn load(&self, decoder: Box<dyn DataSource>) {
        {
            let mut inner = self.inner.lock().unwrap();
            self.channels.store(decoder.channels(), Ordering::Release);
            self.rate.store(decoder.sample_rate(), Ordering::Release);
            if let Ok(len) = decoder.length_in_pcm_frames() {
                self.set_total_length(len);
            }
            let page_size = ((self.page_size_in_seconds * decoder.sample_rate() as f32).round()
                as usize)
                .max(1);
            self.page_size_in_frames.store(page_size, Ordering::Release);
            let channels = decoder.channels().max(1) as usize;
            inner.pages[0] = vec![0.0; page_size * channels];
            inner.pages[1] = vec![0.0; page_size * channels];
            inner.decoder = Some(decoder);
        }
        self.format_known.store(true, Ordering::Release);
        self.fill_page(0);
        self.fill_page(1);
    }

    /// Refill one page from the decoder's current position, looping the
    /// decoder back to frame 0 on short reads when `is_looping` (§4.8).
    pub fn fill_page(&self, page_index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let is_looping = inner.is_looping;
        let channels = self.channels.load(Ordering::Acquire).max(1) as usize;
        let page_size = self.page_size_in_frames.load(Ordering::Acquire);
        if page_size == 0 {
            self.page_valid[page_index].store(true, Ordering::Release);
            return;
        }

        let mut filled = 0usize;
        let mut hit_end = false;
        let mut consecutive_empty_reads = 0u32;

        loop {
            if filled >= page_size {
                break;
            }
            let decoder = match inner.decoder.as_mut() {
                Some(d) => d,
                None => break,
            };
            let dst = &mut inner.pages[page_index][filled * channels..page_size * channels];
            match decoder.read_pcm_frames(dst, page_size - filled, false) {
                Ok(0) => {
                    consecutive_empty_reads += 1;
                    if is_looping && consecutive_empty_reads < 2 {
                        let _ = decoder.seek_to_pcm_frame(0);
                        if !self.total_known.load(Ordering::Acquire) {
                            if let Ok(len) = decoder.length_in_pcm_frames() {
                                self.set_total_length(len);
                            } else {
                                self.set_total_length(filled as u64);
                            }
                        }
                        continue;
                    }
                    hit_end = true;
                    break;
                }
                Ok(n) => {
                    filled += n;
                    consecutive_empty_reads = 0;
                }
                Err(Error::AtEnd) => {
                    if is_looping {
                        let _ = decoder.seek_to_pcm_frame(0);
                        if !self.total_known.load(Ordering::Acquire) {
                            self.set_total_length(filled as u64);
                        }
                        continue;
                    }
                    hit_end = true;
                    break;
                }
                Err(_) => {
                    hit_end = true;
                    break;
                }
            }
        }

        self.page_frame_count[page_index].store(filled, Ordering::Release);
        self.page_valid[page_index].store(true, Ordering::Release);
        if hit_end {
            self.is_decoder_at_end.store(true, Ordering::Release);
        }
    }

    /// Re-point the decoder at `frame_index`, invalidate both pages, and
    /// refill them. Called from the `SeekDataStream` job, already bracketed
    /// by `begin_seek`/`end_seek` in the caller.
    pub fn seek_and_refill(&self, frame_index: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(decoder) = inner.decoder.as_mut() {
                let _ = decoder.seek_to_pcm_frame(frame_index);
            }
        }
        self.page_valid[0].store(false, Ordering::Release);
        self.page_valid[1].store(false, Ordering::Release);
        self.is_decoder_at_end.store(false, Ordering::Release);
        self.current_page_index.store(0, Ordering::Release);
        self.fill_page(0);
        self.fill_page(1);
    }
}

/// Per-reference streaming handle. Tracks its own read cursor over the
/// shared node's two pages.
pub struct ResourceManagerDataStream {
    pub(crate) node: Arc<DataStreamNode>,
    relative_cursor: usize,
    absolute_cursor: u64,
}

impl ResourceManagerDataStream {
    pub(crate) fn new(node: Arc<DataStreamNode>) -> Self {
        Self {
            node,
            relative_cursor: 0,
            absolute_cursor: 0,
        }
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.node.inner.lock().unwrap().is_looping = looping;
    }

    /// Returns a copy of up to `remaining_in_page` frames from the current
    /// page, or `Busy` mid-seek / while the current page is still invalid,
    /// or `AtEnd` once the decoder is exhausted and no frames remain.
    ///
    /// The distilled spec's `map` is zero-copy (a raw pointer into the page);
    /// this crate copies instead, since handing out a pointer into a
    /// `Mutex`-guarded buffer isn't expressible without `unsafe`, and no
    /// caller in this crate needs the zero-copy path badly enough to justify
    /// it.
    pub fn map(&mut self, frame_count: usize) -> Result<Vec<f32>> {
        self.node.check_alive()?;
        if self.node.is_seeking() {
            return Err(Error::Busy);
        }
        let page = self.node.current_page_index.load(Ordering::Acquire);
        if !self.node.page_valid[page].load(Ordering::Acquire) {
            return Err(Error::Busy);
        }
        let channels = self.node.channels.load(Ordering::Acquire).max(1) as usize;
        let page_frames = self.node.page_frame_count[page].load(Ordering::Acquire);
        let remaining = page_frames.saturating_sub(self.relative_cursor);

        if remaining == 0 {
            if self.node.is_decoder_at_end.load(Ordering::Acquire) {
                return Err(Error::AtEnd);
            }
            return Err(Error::Busy);
        }

        let take = remaining.min(frame_count);
        let inner = self.node.inner.lock().unwrap();
        let start = self.relative_cursor * channels;
        Ok(inner.pages[page][start..start + take * channels].to_vec())
    }

    /// Advance the cursor by `n` frames, swapping and refilling pages on a
    /// boundary crossing (§4.8).
    pub fn unmap(&mut self, n: usize, refill: &mut dyn FnMut(usize)) {
        self.relative_cursor += n;
        self.absolute_cursor += n as u64;

        let page = self.node.current_page_index.load(Ordering::Acquire);
        let page_frames = self.node.page_frame_count[page].load(Ordering::Acquire);
        if self.relative_cursor >= page_frames && page_frames > 0 {
            self.node.page_valid[page].store(false, Ordering::Release);
            refill(page);
            let next = 1 - page;
            self.node.current_page_index.store(next, Ordering::Release);
            self.relative_cursor = 0;
        }
    }

    pub fn absolute_cursor(&self) -> u64 {
        self.absolute_cursor
    }
}

impl DataSource for ResourceManagerDataStream {
    fn read_pcm_frames(
        &mut self,
        dst: &mut [f32],
        frame_count: usize,
        _is_looping: bool,
    ) -> Result<usize> {
        let channels = self.node.channels.load(Ordering::Acquire).max(1) as usize;
        let mut written = 0usize;

        while written < frame_count {
            let chunk = match self.map(frame_count - written) {
                Ok(c) => c,
                Err(Error::AtEnd) if written > 0 => break,
                Err(e) => return if written > 0 { Ok(written) } else { Err(e) },
            };
            let n = chunk.len() / channels;
            if n == 0 {
                break;
            }
            let dst_off = written * channels;
            dst[dst_off..dst_off + n * channels].copy_from_slice(&chunk);

            let node = Arc::clone(&self.node);
            self.unmap(n, &mut |page| node.fill_page(page));
            written += n;
        }

        Ok(written)
    }

    fn seek_to_pcm_frame(&mut self, frame_index: u64) -> Result<()> {
        self.node.begin_seek();
        self.node.seek_and_refill(frame_index);
        self.node.end_seek();
        self.relative_cursor = 0;
        self.absolute_cursor = frame_index;
        Ok(())
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::F32
    }

    fn channels(&self) -> u32 {
        self.node.channels.load(Ordering::Acquire)
    }

    fn sample_rate(&self) -> u32 {
        self.node.rate.load(Ordering::Acquire)
    }

    fn cursor_in_pcm_frames(&self) -> Result<u64> {
        Ok(self.absolute_cursor)
    }

    fn length_in_pcm_frames(&self) -> Result<u64> {
        self.node.total_length_in_pcm_frames().ok_or(Error::NotImplemented)
    }
}
