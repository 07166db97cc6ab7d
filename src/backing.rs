//! Backing stores: where the virtual pool actually lives.
//!
//! The allocator never talks to storage directly; it goes through the
//! [`BackingStore`] trait, which models a dumb byte-addressable medium of
//! fixed capacity. Drivers for real media (SPI RAM chips, SD cards,
//! serial links) implement this trait outside this crate. Two reference
//! implementations are provided: [`StaticBacking`], which keeps the pool
//! in an ordinary RAM buffer, and [`FileBacking`], which keeps it in a
//! file.

use crate::{VAddr, VSize};

/// A byte-addressable store of fixed capacity holding the virtual pool.
///
/// Implementations are free to be as slow as they like; the page cache
/// exists to amortize their latency. Errors are surfaced unchanged to the
/// caller of whatever allocator operation triggered the access, and the
/// allocator never retries.
///
/// Offsets passed to `read` and `write` are always within
/// `[0, capacity())` and the accessed range never crosses the capacity.
pub trait BackingStore {
    /// Error type surfaced by the medium.
    type Error;

    /// Bring the medium up. Called by `VirtAlloc::start`.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Release the medium. Called by `VirtAlloc::stop`.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Fill `dst` from the store, starting at `offset`.
    fn read(&mut self, offset: VAddr, dst: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `src` to the store, starting at `offset`.
    fn write(&mut self, offset: VAddr, src: &[u8]) -> Result<(), Self::Error>;

    /// Total number of bytes the store can hold. This is the pool size.
    fn capacity(&self) -> VSize;
}

/// A backing store held in an ordinary RAM buffer.
///
/// This store has no dependencies and is mainly useful for testing and
/// for small pools. It is the only store that makes sense when the host
/// has enough RAM to hold the whole pool anyway.
pub struct StaticBacking {
    data: alloc::boxed::Box<[u8]>,
}

impl StaticBacking {
    /// Create a zero-filled store of `capacity` bytes.
    pub fn new(capacity: VSize) -> StaticBacking {
        StaticBacking {
            data: alloc::vec![0u8; capacity as usize].into_boxed_slice(),
        }
    }
}

impl BackingStore for StaticBacking {
    type Error = core::convert::Infallible;

    fn start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn read(&mut self, offset: VAddr, dst: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&mut self, offset: VAddr, src: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> VSize {
        self.data.len() as VSize
    }
}

/// A backing store kept in a file.
///
/// The file is grown and zero-filled to the full pool capacity on
/// `start`, so reads of never-written regions return zeros. Nothing about
/// the on-disk layout is stable across versions; the pool is initialized
/// fresh on every `start`.
#[cfg(feature = "std")]
pub struct FileBacking {
    file: std::fs::File,
    capacity: VSize,
}

#[cfg(feature = "std")]
impl FileBacking {
    /// Create (or truncate) the file at `path` and use it as a pool of
    /// `capacity` bytes.
    pub fn create<P: AsRef<std::path::Path>>(
        path: P,
        capacity: VSize,
    ) -> std::io::Result<FileBacking> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileBacking { file, capacity })
    }

    /// Use an already-open file as a pool of `capacity` bytes.
    ///
    /// Handy with `tempfile::tempfile()`.
    pub fn from_file(file: std::fs::File, capacity: VSize) -> FileBacking {
        FileBacking { file, capacity }
    }
}

#[cfg(feature = "std")]
impl BackingStore for FileBacking {
    type Error = std::io::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        use std::io::{Seek, SeekFrom, Write};

        // Size the file and zero it so every offset is readable.
        self.file.set_len(0)?;
        self.file.set_len(self.capacity as u64)?;
        self.file.seek(SeekFrom::Start(0))?;
        let zeros = [0u8; 4096];
        let mut left = self.capacity as usize;
        while left > 0 {
            let n = left.min(zeros.len());
            self.file.write_all(&zeros[..n])?;
            left -= n;
        }
        self.file.flush()
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        use std::io::Write;
        self.file.flush()
    }

    fn read(&mut self, offset: VAddr, dst: &mut [u8]) -> Result<(), Self::Error> {
        use std::io::{Read, Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(dst)
    }

    fn write(&mut self, offset: VAddr, src: &[u8]) -> Result<(), Self::Error> {
        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(src)
    }

    fn capacity(&self) -> VSize {
        self.capacity
    }
}
