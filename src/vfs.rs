//! The VFS (virtual file system) capability this crate consumes but does not
//! implement. Platform file I/O, packfile overlays, or in-memory test
//! filesystems all satisfy this contract.

use crate::error::Result;

/// An open file handle, abstract over whatever the concrete `Vfs`
/// implementation backs it with.
pub trait VfsFile: Send {
    /// Read up to `buf.len()` bytes, returning the number actually read (0 at
    /// EOF).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Seek to an absolute byte offset.
    fn seek(&mut self, offset: u64) -> Result<()>;
}

/// Thread-safe across files; a given file handle is only ever accessed from
/// one thread at a time (the resource manager upholds this by construction —
/// one worker owns a job at a time, and one load/page/seek job at a time
/// touches a given handle, enforced via the execution counter/pointer).
pub trait Vfs: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn VfsFile>>;

    /// Convenience: open and slurp the entire file into memory.
    fn open_and_read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path)?;
        let mut out = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}

/// An in-memory `Vfs` used by tests and by callers that already hold their
/// assets resident (e.g. bundled into the binary).
pub struct MemoryVfs {
    files: std::collections::HashMap<String, Vec<u8>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self {
            files: std::collections::HashMap::new(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.files.insert(path.into(), data);
    }
}

impl Default for MemoryVfs {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryVfsFile {
    data: Vec<u8>,
    cursor: usize,
}

impl VfsFile for MemoryVfsFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data.len() - self.cursor;
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset as usize > self.data.len() {
            return Err(crate::error::Error::InvalidArgs);
        }
        self.cursor = offset as usize;
        Ok(())
    }
}

impl Vfs for MemoryVfs {
    fn open(&self, path: &str) -> Result<Box<dyn VfsFile>> {
        match self.files.get(path) {
            Some(data) => Ok(Box::new(MemoryVfsFile {
                data: data.clone(),
                cursor: 0,
            })),
            None => Err(crate::error::Error::InvalidArgs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_vfs_round_trips_reads_and_seeks() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("a.bin", vec![1, 2, 3, 4, 5]);

        let mut file = vfs.open("a.bin").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);

        file.seek(1).unwrap();
        let mut buf2 = [0u8; 4];
        let n = file.read(&mut buf2).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf2[..n], &[2, 3, 4, 5]);
    }

    #[test]
    fn open_and_read_file_slurps_whole_contents() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("b.bin", vec![9; 200_000]);
        let data = vfs.open_and_read_file("b.bin").unwrap();
        assert_eq!(data.len(), 200_000);
    }

    #[test]
    fn missing_file_is_invalid_args() {
        let vfs = MemoryVfs::new();
        assert_eq!(
            vfs.open("missing").unwrap_err(),
            crate::error::Error::InvalidArgs
        );
    }
}
