use crate::{
    bitmap::SectorBitmap,
    error::{Error, Result},
    io::{self, Channel},
    metrics::{Metric, Metrics},
};

use hashtrie_core::{SectorImage, SectorIndex, SECTOR_SIZE};
use parking_lot::Mutex;
use std::sync::Arc;

/// Hands out unused sectors of the index file and grows the file to hold them.
///
/// The bitmap is the source of truth for which sectors are in use. A single mutex covers
/// "find the lowest clear bit, mark it, maybe extend the file", so two allocations can never
/// return the same sector.
pub struct SectorAllocator {
    channel: Arc<dyn Channel>,
    sync: Mutex<AllocatorSync>,
    max_sectors: u64,
    sync_writes: bool,
    metrics: Metrics,
}

struct AllocatorSync {
    bitmap: SectorBitmap,
    /// The number of whole sectors the file currently holds. Beyond this, the file must have its
    /// length extended.
    file_sectors: u64,
}

impl SectorAllocator {
    /// Create a new allocator over the given channel and bitmap.
    pub fn new(
        channel: Arc<dyn Channel>,
        bitmap: SectorBitmap,
        max_sectors: u64,
        sync_writes: bool,
        metrics: Metrics,
    ) -> Result<Self> {
        let file_sectors = channel.len()? / SECTOR_SIZE as u64;
        Ok(SectorAllocator {
            channel,
            sync: Mutex::new(AllocatorSync {
                bitmap,
                file_sectors,
            }),
            max_sectors,
            sync_writes,
            metrics,
        })
    }

    /// Get the next free sector.
    ///
    /// The returned sector is marked as used and reads as all-empty slots. This blocks other
    /// allocations while the file is being extended.
    ///
    /// This returns an error when the sector limit is reached or when growing or writing the file
    /// fails. In the latter case the sector is released again.
    pub fn allocate(&self) -> Result<SectorIndex> {
        let mut sync = self.sync.lock();

        let index = sync.bitmap.next_clear();
        if index >= self.max_sectors {
            return Err(Error::Capacity {
                limit: self.max_sectors,
            });
        }
        if sync.bitmap.set(index) {
            // next_clear() returned a set bit.
            return Err(Error::consistency(format!(
                "sector {index} handed out while already allocated"
            )));
        }

        let sector = SectorIndex(index);
        if let Err(e) = self.prepare(&mut sync, sector) {
            sync.bitmap.unset(index);
            return Err(e.into());
        }

        tracing::trace!(%sector, "allocated sector");
        self.metrics.count(Metric::SectorAllocations);
        Ok(sector)
    }

    // grow the file if the sector lies beyond its end and blank the sector.
    fn prepare(&self, sync: &mut AllocatorSync, sector: SectorIndex) -> std::io::Result<()> {
        if sector.0 >= sync.file_sectors {
            let new_len = sector.end_offset();
            tracing::debug!(
                from = sync.file_sectors * SECTOR_SIZE as u64,
                to = new_len,
                "expanding index file"
            );
            self.channel.set_len(new_len)?;
            sync.file_sectors = sector.0 + 1;
        }
        io::write_sector(
            &*self.channel,
            sector,
            &SectorImage::empty(),
            self.sync_writes,
        )?;
        self.metrics.count(Metric::SectorWrites);
        Ok(())
    }

    /// Mark a specific sector as used without touching the file. Used while bootstrapping the
    /// root of a fresh index.
    ///
    /// Fails with a consistency error if the sector is already marked.
    pub fn mark_used(&self, sector: SectorIndex) -> Result<()> {
        let mut sync = self.sync.lock();
        if sync.bitmap.set(sector.0) {
            return Err(Error::consistency(format!(
                "sector {sector} is already allocated"
            )));
        }
        Ok(())
    }

    pub fn is_allocated(&self, sector: SectorIndex) -> bool {
        self.sync.lock().bitmap.get(sector.0)
    }

    pub fn allocated_count(&self) -> u64 {
        self.sync.lock().bitmap.count()
    }

    /// The number of whole sectors the file holds, as last observed by the allocator.
    pub fn file_sectors(&self) -> u64 {
        self.sync.lock().file_sectors
    }

    /// Note a change of the file length made outside of the allocator.
    pub fn set_file_sectors(&self, file_sectors: u64) {
        self.sync.lock().file_sectors = file_sectors;
    }

    /// Forget all allocations.
    pub fn reset(&self) {
        self.sync.lock().bitmap.clear();
    }

    /// Run `f` with exclusive access to the bitmap, e.g. to rebuild it from the trie.
    pub fn with_bitmap(&self, f: impl FnOnce(&mut SectorBitmap)) {
        f(&mut self.sync.lock().bitmap)
    }

    /// Flush the bitmap to durable storage.
    pub fn persist(&self) -> Result<()> {
        self.sync.lock().bitmap.persist()?;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.sync.lock().bitmap.is_dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.sync.lock().bitmap.set_dirty(dirty)
    }
}
