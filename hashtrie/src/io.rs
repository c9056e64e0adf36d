//! The backing channel of the index: positioned reads and writes of fixed-size byte ranges.
//!
//! No operation relies on an implicit cursor, which is what allows threads to access different
//! sectors of the same file concurrently.

#[cfg(not(target_family = "unix"))]
std::compile_error!("hashtrie only supports Unix-based OSs");

use hashtrie_core::{SectorImage, SectorIndex, SECTOR_SIZE};
use parking_lot::RwLock;
use std::{
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd as _, unix::fs::FileExt as _},
    path::Path,
};

/// A file-like object the index lives in.
pub trait Channel: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`. Fails if the range is not entirely within
    /// the channel.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` at `offset`, growing the channel if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// The current length in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Whether the channel holds no bytes at all.
    fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Extend or truncate the channel. Extended regions read as zeroes.
    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Flush written data to durable storage.
    fn sync(&self) -> io::Result<()>;

    /// Take an exclusive advisory lock without blocking.
    fn try_lock_exclusive(&self) -> io::Result<()> {
        Ok(())
    }

    /// Release the lock taken by [`Channel::try_lock_exclusive`].
    fn unlock(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A channel backed by a regular file.
pub struct FileChannel {
    file: File,
}

impl FileChannel {
    /// Open or create the file at `path` for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(FileChannel { file })
    }

}

impl Channel for FileChannel {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn try_lock_exclusive(&self) -> io::Result<()> {
        unsafe {
            if libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    fn unlock(&self) -> io::Result<()> {
        unsafe {
            if libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}

/// A channel kept entirely in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemChannel {
    data: RwLock<Vec<u8>>,
}

impl MemChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl Channel for MemChannel {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.read();
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::UnexpectedEof)?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| data.get(start..end));
        match src {
            Some(src) => {
                buf.copy_from_slice(src);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past the end of the channel",
            )),
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.write();
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::OutOfMemory)?;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| io::ErrorKind::OutOfMemory)?;
        self.data.write().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Read and decode a whole sector. Blocks the current thread.
pub fn read_sector(channel: &dyn Channel, sector: SectorIndex) -> io::Result<SectorImage> {
    let mut buf = [0u8; SECTOR_SIZE];
    channel.read_at(&mut buf, sector.offset())?;
    Ok(SectorImage::decode(&buf))
}

/// Encode and write a whole sector, syncing afterwards if requested. Blocks the current thread.
pub fn write_sector(
    channel: &dyn Channel,
    sector: SectorIndex,
    image: &SectorImage,
    sync: bool,
) -> io::Result<()> {
    channel.write_at(&image.to_bytes()[..], sector.offset())?;
    if sync {
        channel.sync()?;
    }
    Ok(())
}

/// A [`MemChannel`] whose writes and syncs can be made to fail.
#[cfg(test)]
#[derive(Default)]
pub struct FaultyChannel {
    inner: MemChannel,
    // negative: unlimited.
    writes_left: std::sync::atomic::AtomicI64,
    fail_syncs: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FaultyChannel {
    pub fn new() -> Self {
        let channel = Self::default();
        channel.heal();
        channel
    }

    /// Let `n` more writes through, then fail every write.
    pub fn fail_writes_after(&self, n: i64) {
        self.writes_left.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_syncs(&self, fail: bool) {
        self.fail_syncs
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_writes_after(-1);
        self.fail_syncs(false);
    }
}

#[cfg(test)]
impl Channel for FaultyChannel {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::sync::atomic::Ordering;
        self.writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                left if left < 0 => Some(left),
                left => Some(left - 1),
            })
            .map_err(|_| io::Error::other("injected write failure"))?;
        self.inner.write_at(buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.inner.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        if self.fail_syncs.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(io::Error::other("injected sync failure"));
        }
        Ok(())
    }
}
