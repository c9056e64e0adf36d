use hashtrie_core::SECTOR_SIZE;
use std::path::PathBuf;

/// Options when opening a [`crate::HashTrieIndex`].
#[derive(Clone, Debug)]
pub struct Options {
    /// The path to the directory holding the index file and its bitmap.
    pub(crate) path: PathBuf,
    /// The maximum size of the node cache specified in MiB. Each cached node takes one
    /// [`SECTOR_SIZE`] worth of the budget.
    pub(crate) node_cache_size: usize,
    /// The number of independently locked shards of the node cache.
    pub(crate) node_cache_shards: usize,
    /// Whether every sector write is followed by a data sync.
    pub(crate) sync_writes: bool,
    /// Whether the index file is locked for exclusive use while loaded.
    pub(crate) lock_file: bool,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
    /// The number of sectors the index file may grow to.
    pub(crate) max_sectors: u64,
}

/// The highest number of sectors whose offsets still fit into a signed 64-bit file offset.
pub const MAX_SECTORS: u64 = i64::MAX as u64 / SECTOR_SIZE as u64;

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("hashtrie_db"),
            node_cache_size: 64,
            node_cache_shards: 16,
            sync_writes: true,
            lock_file: true,
            metrics: false,
            max_sectors: MAX_SECTORS,
        }
    }

    /// Set the path to the directory where the index is stored.
    pub fn path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Sets the size of the node cache in MiB.
    ///
    /// Each cached node occupies one sector worth of memory. The root node is held separately and
    /// does not count against this limit. Nodes which are in use are never evicted, so the cache
    /// may temporarily exceed its size under heavy concurrency.
    ///
    /// Default: 64MiB.
    pub fn node_cache_size(&mut self, node_cache_size: usize) {
        self.node_cache_size = node_cache_size;
    }

    /// Set the number of node cache shards.
    ///
    /// Must be more than 0.
    ///
    /// Default: 16.
    pub fn node_cache_shards(&mut self, node_cache_shards: usize) {
        assert!(node_cache_shards > 0);
        self.node_cache_shards = node_cache_shards;
    }

    /// Sets whether every sector write is synced to durable storage before the operation
    /// returns.
    ///
    /// Turning this off trades durability for speed: writes still go straight to the file, but
    /// the OS decides when they reach the disk.
    ///
    /// Default: `true`.
    pub fn sync_writes(&mut self, sync_writes: bool) {
        self.sync_writes = sync_writes;
    }

    /// Sets whether an advisory exclusive lock is taken on the index file when it is loaded.
    ///
    /// Default: `true`.
    pub fn lock_file(&mut self, lock_file: bool) {
        self.lock_file = lock_file;
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }

    /// Limit the number of sectors the index may allocate. Allocations beyond the limit fail with
    /// [`crate::Error::Capacity`].
    ///
    /// Values above [`MAX_SECTORS`] are clamped.
    pub fn max_sectors(&mut self, max_sectors: u64) {
        self.max_sectors = max_sectors.min(MAX_SECTORS);
    }

    /// The number of nodes the cache may hold.
    pub(crate) fn node_cache_capacity(&self) -> usize {
        self.node_cache_size * 1024 * 1024 / SECTOR_SIZE
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn sector_size_is_2048() {
    // Update the docs above if this fails.
    assert_eq!(SECTOR_SIZE, 2048);
}
