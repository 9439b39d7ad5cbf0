//! The `DataSource` capability: anything that can produce interleaved PCM
//! frames on demand, report its own format, and seek. Concrete decoders
//! (WAV/FLAC/MP3/Vorbis) are external collaborators satisfying this trait;
//! this crate only defines the contract plus a couple of in-memory
//! implementations leaf nodes and tests can use directly.

use crate::error::{Error, Result};
use crate::vfs::Vfs;

/// Sample formats a `DataSource` may natively produce. The render graph
/// itself is f32 throughout; non-f32 sources are converted at the leaf via
/// [`crate::convert::convert_pcm_frames`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    S16,
    U8,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::S16 => 2,
            SampleFormat::U8 => 1,
        }
    }
}

/// A pull-based, seekable source of interleaved PCM frames.
pub trait DataSource: Send {
    /// Read up to `frame_count` frames (interleaved, `channels()` samples
    /// each) into `dst`, honoring `is_looping`. Returns the number of frames
    /// actually written; `AtEnd` is returned only once no frames could be
    /// produced and the source is not looping.
    fn read_pcm_frames(&mut self, dst: &mut [f32], frame_count: usize, is_looping: bool)
        -> Result<usize>;

    fn seek_to_pcm_frame(&mut self, frame_index: u64) -> Result<()>;

    fn format(&self) -> SampleFormat;
    fn channels(&self) -> u32;
    fn sample_rate(&self) -> u32;

    fn cursor_in_pcm_frames(&self) -> Result<u64>;

    /// Total length in frames, if known up front (streaming sources of
    /// unknown length return `NotImplemented`).
    fn length_in_pcm_frames(&self) -> Result<u64> {
        Err(Error::NotImplemented)
    }

    /// Optional zero-copy path. Default implementation reports the
    /// capability absent.
    fn map(&mut self, _frame_count: usize) -> Result<(*const f32, usize)> {
        Err(Error::NotImplemented)
    }

    fn unmap(&mut self, _frame_count: usize) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

/// An in-memory, f32, fixed-length `DataSource` — the leaf most unit tests
/// and small sound effects use directly (no resource manager involved).
pub struct MemoryDataSource {
    data: Vec<f32>,
    channels: u32,
    sample_rate: u32,
    cursor: u64,
}

impl MemoryDataSource {
    pub fn new(data: Vec<f32>, channels: u32, sample_rate: u32) -> Self {
        Self {
            data,
            channels,
            sample_rate,
            cursor: 0,
        }
    }

    fn frame_count(&self) -> u64 {
        self.data.len() as u64 / self.channels as u64
    }
}

impl DataSource for MemoryDataSource {
    fn read_pcm_frames(
        &mut self,
        dst: &mut [f32],
        frame_count: usize,
        is_looping: bool,
    ) -> Result<usize> {
        let channels = self.channels as usize;
        let total_frames = self.frame_count();
        let mut written = 0usize;

        while written < frame_count {
            if self.cursor >= total_frames {
                if is_looping && total_frames > 0 {
                    self.cursor = 0;
                } else {
                    break;
                }
            }

            let remaining_in_source = (total_frames - self.cursor) as usize;
            let take = remaining_in_source.min(frame_count - written);
            let src_start = self.cursor as usize * channels;
            let dst_start = written * channels;
            dst[dst_start..dst_start + take * channels]
                .copy_from_slice(&self.data[src_start..src_start + take * channels]);

            self.cursor += take as u64;
            written += take;

            if take == 0 {
                break;
            }
        }

        if written == 0 && frame_count > 0 && !is_looping {
            return Err(Error::AtEnd);
        }

        Ok(written)
    }

    fn seek_to_pcm_frame(&mut self, frame_index: u64) -> Result<()> {
        if frame_index > self.frame_count() {
            return Err(Error::InvalidArgs);
        }
        self.cursor = frame_index;
        Ok(())
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::F32
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn cursor_in_pcm_frames(&self) -> Result<u64> {
        Ok(self.cursor)
    }

    fn length_in_pcm_frames(&self) -> Result<u64> {
        Ok(self.frame_count())
    }
}

/// The `Decoder` capability (§1, §6): a concrete codec (WAV/FLAC/MP3/Vorbis)
/// that opens a file through the [`Vfs`] and exposes it as a [`DataSource`].
/// This crate implements no real codec — concrete decoders are an external
/// collaborator by design — but the resource manager needs *something*
/// concrete to drive its load/page/seek jobs in tests, so a `DecoderFactory`
/// capability is injected at `ResourceManager` construction the same way a
/// `Vfs` is.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, vfs: &dyn Vfs, path: &str) -> Result<Box<dyn DataSource>>;
}

/// A stand-in decoder that treats a whole file as raw interleaved f32
/// little-endian PCM at a fixed channel count and sample rate. Exercises the
/// resource manager's load/page/seek machinery end-to-end without pulling in
/// an actual codec crate, the same role `MemoryVfs` plays for file I/O.
pub struct RawPcmDecoderFactory {
    pub channels: u32,
    pub sample_rate: u32,
}

impl RawPcmDecoderFactory {
    pub fn new(channels: u32, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }
}

impl DecoderFactory for RawPcmDecoderFactory {
    fn open(&self, vfs: &dyn Vfs, path: &str) -> Result<Box<dyn DataSource>> {
        let bytes = vfs.open_and_read_file(path)?;
        let sample_count = bytes.len() / 4;
        let mut frames = vec![0.0f32; sample_count];
        crate::convert::convert_to_f32(&mut frames, &bytes, SampleFormat::F32, sample_count);
        Ok(Box::new(MemoryDataSource::new(
            frames,
            self.channels,
            self.sample_rate,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_exact_frames_without_looping() {
        let mut src = MemoryDataSource::new(vec![1., 2., 3., 4., 5., 6.], 2, 48_000);
        let mut out = [0f32; 6];
        let n = src.read_pcm_frames(&mut out, 3, false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, [1., 2., 3., 4., 5., 6.]);
    }

    #[test]
    fn at_end_without_looping() {
        let mut src = MemoryDataSource::new(vec![1., 2.], 2, 48_000);
        let mut out = [0f32; 2];
        assert_eq!(src.read_pcm_frames(&mut out, 1, false).unwrap(), 1);
        let err = src.read_pcm_frames(&mut out, 1, false).unwrap_err();
        assert_eq!(err, Error::AtEnd);
    }

    #[test]
    fn loops_back_to_start() {
        let mut src = MemoryDataSource::new(vec![1., 2., 3.], 1, 48_000);
        let mut out = [0f32; 5];
        let n = src.read_pcm_frames(&mut out, 5, true).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, [1., 2., 3., 1., 2.]);
    }

    #[test]
    fn seek_past_end_is_invalid() {
        let mut src = MemoryDataSource::new(vec![1., 2.], 1, 48_000);
        assert_eq!(src.seek_to_pcm_frame(3).unwrap_err(), Error::InvalidArgs);
        assert!(src.seek_to_pcm_frame(2).is_ok());
    }

    #[test]
    fn raw_pcm_decoder_reads_file_bytes_as_f32_frames() {
        use crate::vfs::MemoryVfs;

        let samples: Vec<f32> = vec![0.25, -0.25, 0.5, -0.5];
        let mut bytes = Vec::new();
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let mut vfs = MemoryVfs::new();
        vfs.insert("tone.pcm", bytes);

        let factory = RawPcmDecoderFactory::new(2, 44_100);
        let mut source = factory.open(&vfs, "tone.pcm").unwrap();
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 44_100);

        let mut out = [0f32; 4];
        let n = source.read_pcm_frames(&mut out, 2, false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, [0.25, -0.25, 0.5, -0.5]);
    }
}
