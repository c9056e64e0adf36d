//! A persistent hash-trie index mapping keys to 64-bit values.
//!
//! Keys are hashed to a fixed number of bytes. Byte `d` of the hash selects one of 256 slots of
//! the node at depth `d`, so every key lives exactly `hash_length` nodes below the root. Each node
//! occupies one 2048-byte sector of the index file. The root is always sector 0.
//!
//! Two keys with the same hash are the same entry. Choose the hash length according to the
//! number of keys.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use allocator::SectorAllocator;
use bitmap::SectorBitmap;
use hashtrie_core::{SectorImage, MAX_HASH_LENGTH};
use metrics::Metric;
use node::TrieNode;
use node_cache::NodeCache;
use parking_lot::RwLock;

pub use error::{Error, Result};
pub use hashtrie_core::{
    hasher::{LeBytesHasher, XxKeyHasher},
    KeyHash, KeyHasher, ReconstructKey, SectorIndex, EMPTY_SLOT, SECTOR_SIZE,
};
pub use io::{Channel, FileChannel, MemChannel};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::{Options, MAX_SECTORS};

#[cfg(feature = "blake3-hasher")]
pub use hashtrie_core::hasher::blake3::Blake3KeyHasher;
#[cfg(feature = "sha2-hasher")]
pub use hashtrie_core::hasher::sha2::Sha2KeyHasher;

mod allocator;
mod bitmap;
mod error;
mod io;
mod metrics;
mod node;
mod node_cache;
mod options;

/// The name of the index file inside the index directory.
pub const INDEX_FILE_NAME: &str = "index";
/// The name of the sector bitmap sidecar inside the index directory.
pub const BITMAP_FILE_NAME: &str = "index.bitmap";

/// The container an index belongs to.
///
/// The owner decides how keys are hashed and where the sector bitmap is kept. It assigns meaning
/// to the stored values, the index does not.
pub trait IndexOwner<K: ?Sized> {
    /// The hasher turning keys into trie paths.
    fn key_hasher(&self) -> Arc<dyn KeyHasher<K>>;

    /// Where the sector bitmap is persisted. `None` keeps it in memory only.
    fn bitmap_path(&self) -> Option<PathBuf>;
}

/// An owner keeping the bitmap in a directory, next to the index file.
pub struct DirectoryOwner<K: ?Sized + 'static> {
    hasher: Arc<dyn KeyHasher<K>>,
    dir: Option<PathBuf>,
}

impl<K: ?Sized + 'static> DirectoryOwner<K> {
    /// An owner storing the bitmap as [`BITMAP_FILE_NAME`] inside `dir`.
    pub fn new(dir: impl Into<PathBuf>, hasher: Arc<dyn KeyHasher<K>>) -> Self {
        DirectoryOwner {
            hasher,
            dir: Some(dir.into()),
        }
    }

    /// An owner which never persists the bitmap. Suitable for indexes over a [`MemChannel`].
    pub fn ephemeral(hasher: Arc<dyn KeyHasher<K>>) -> Self {
        DirectoryOwner { hasher, dir: None }
    }
}

impl<K: ?Sized + 'static> IndexOwner<K> for DirectoryOwner<K> {
    fn key_hasher(&self) -> Arc<dyn KeyHasher<K>> {
        self.hasher.clone()
    }

    fn bitmap_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(BITMAP_FILE_NAME))
    }
}

/// Index state shared by all operations. Passed explicitly to the nodes.
pub(crate) struct Shared {
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) allocator: SectorAllocator,
    pub(crate) cache: NodeCache,
    pub(crate) hash_length: usize,
    pub(crate) sync_writes: bool,
    pub(crate) metrics: Metrics,
}

impl Shared {
    /// Write a sector without syncing. Follow up with [`Shared::sync`].
    pub(crate) fn write_sector(&self, sector: SectorIndex, image: &SectorImage) -> Result<()> {
        io::write_sector(&*self.channel, sector, image, false)?;
        self.metrics.count(Metric::SectorWrites);
        Ok(())
    }

    /// Sync the channel if writes are configured to be durable.
    pub(crate) fn sync(&self) -> Result<()> {
        if self.sync_writes {
            self.channel.sync()?;
        }
        Ok(())
    }
}

/// Summary information about a loaded index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    /// The number of hash bytes, and so the depth of the trie.
    pub hash_length: usize,
    /// The number of nodes reachable from the root, the root included.
    pub nodes: u64,
    /// The number of sectors marked as allocated.
    pub allocated_sectors: u64,
    /// The number of occupied leaf slots.
    pub entries: u64,
    /// The length of the index file in bytes.
    pub file_len: u64,
}

enum Lifecycle<K: ?Sized + 'static> {
    Uninitialized,
    Initialized(Setup<K>),
    Loaded(Box<Loaded<K>>),
    Closed,
}

struct Setup<K: ?Sized + 'static> {
    hasher: Arc<dyn KeyHasher<K>>,
    channel: Arc<dyn Channel>,
    bitmap_path: Option<PathBuf>,
    locked: bool,
}

struct Loaded<K: ?Sized + 'static> {
    hasher: Arc<dyn KeyHasher<K>>,
    shared: Shared,
    root: Arc<TrieNode>,
    locked: bool,
}

impl<K: ?Sized + 'static> Lifecycle<K> {
    fn loaded(&self) -> Result<&Loaded<K>> {
        match self {
            Lifecycle::Loaded(loaded) => Ok(&**loaded),
            Lifecycle::Uninitialized => Err(Error::state("not initialized")),
            Lifecycle::Initialized(_) => Err(Error::state("not loaded")),
            Lifecycle::Closed => Err(Error::state("closed")),
        }
    }
}

/// A persistent hash-trie index.
///
/// All key operations take `&self` and may be called from many threads at once. Lifecycle
/// transitions (`init`, `load`, `clear`, `close`) wait for in-flight operations to finish.
pub struct HashTrieIndex<K: ?Sized + 'static> {
    options: Options,
    metrics: Metrics,
    state: RwLock<Lifecycle<K>>,
}

impl<K: ?Sized + 'static> HashTrieIndex<K> {
    /// Create an uninitialized index. Call [`HashTrieIndex::init`] and [`HashTrieIndex::load`]
    /// before using it.
    pub fn new(options: Options) -> Self {
        let metrics = Metrics::new(options.metrics);
        HashTrieIndex {
            options,
            metrics,
            state: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    /// Open the index stored in the directory at [`Options::path`], creating it if needed.
    pub fn open(options: Options, hasher: Arc<dyn KeyHasher<K>>) -> Result<Self> {
        std::fs::create_dir_all(&options.path)?;
        let channel = FileChannel::open(&options.path.join(INDEX_FILE_NAME))?;
        let owner = DirectoryOwner::new(options.path.clone(), hasher);

        let index = Self::new(options);
        index.init(&owner, Arc::new(channel))?;
        index.load()?;
        Ok(index)
    }

    /// Attach the index to its owner and backing channel.
    ///
    /// Takes the channel's exclusive lock if [`Options::lock_file`] is set. May only be called
    /// once.
    pub fn init(&self, owner: &dyn IndexOwner<K>, channel: Arc<dyn Channel>) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            Lifecycle::Uninitialized => {}
            Lifecycle::Closed => return Err(Error::state("closed")),
            _ => return Err(Error::state("already initialized")),
        }

        let hasher = owner.key_hasher();
        let hash_length = hasher.hash_length();
        if hash_length == 0 || hash_length > MAX_HASH_LENGTH {
            return Err(Error::state(format!(
                "hash length {hash_length} outside of 1..={MAX_HASH_LENGTH}"
            )));
        }

        if self.options.lock_file {
            channel.try_lock_exclusive()?;
        }

        *state = Lifecycle::Initialized(Setup {
            hasher,
            channel,
            bitmap_path: owner.bitmap_path(),
            locked: self.options.lock_file,
        });
        Ok(())
    }

    /// Load the index from its channel.
    ///
    /// An empty channel gets a fresh, empty root at sector 0. Otherwise sector 0 is taken as the
    /// existing root. If the bitmap does not know about the root, e.g. because the sidecar was
    /// lost, it is rebuilt from the trie.
    ///
    /// The sidecar records the hash length the index was created with. Loading with a hasher of
    /// another length fails with [`Error::State`].
    pub fn load(&self) -> Result<()> {
        let mut state = self.state.write();
        let loaded = match &*state {
            Lifecycle::Initialized(setup) => self.load_setup(setup)?,
            Lifecycle::Uninitialized => return Err(Error::state("not initialized")),
            Lifecycle::Loaded(_) => return Err(Error::state("already loaded")),
            Lifecycle::Closed => return Err(Error::state("closed")),
        };
        *state = Lifecycle::Loaded(Box::new(loaded));
        Ok(())
    }

    fn load_setup(&self, setup: &Setup<K>) -> Result<Loaded<K>> {
        let hash_length = setup.hasher.hash_length();
        let file_len = setup.channel.len()?;
        if file_len % SECTOR_SIZE as u64 != 0 {
            return Err(Error::consistency(format!(
                "index file length {file_len} is not a multiple of {SECTOR_SIZE}"
            )));
        }

        let mut bitmap = match setup.bitmap_path {
            Some(ref path) => SectorBitmap::load(path)?,
            None => SectorBitmap::in_memory(),
        };
        // the layout of an existing trie depends on its hash length.
        match bitmap.hash_length() {
            Some(recorded) if file_len != 0 && recorded != hash_length => {
                return Err(Error::state(format!(
                    "index was created with hash length {recorded}, not {hash_length}"
                )));
            }
            _ => bitmap.set_hash_length(hash_length),
        }
        let shared = Shared {
            channel: setup.channel.clone(),
            allocator: SectorAllocator::new(
                setup.channel.clone(),
                bitmap,
                self.options.max_sectors,
                self.options.sync_writes,
                self.metrics.clone(),
            )?,
            cache: NodeCache::new(
                self.options.node_cache_shards,
                self.options.node_cache_capacity(),
            ),
            hash_length,
            sync_writes: self.options.sync_writes,
            metrics: self.metrics.clone(),
        };

        if file_len == 0 {
            // a stale sidecar must not keep sector 0 from being handed out.
            shared.allocator.reset();
            let root = shared.allocator.allocate()?;
            if root != SectorIndex::ROOT {
                return Err(Error::consistency(format!(
                    "fresh index allocated {root} for the root"
                )));
            }
            shared.allocator.persist()?;
            tracing::info!(hash_length, "created new index");
        } else {
            // sectors are only released by `clear`, which truncates the file. A bitmap marking any
            // other number of sectors than the file holds was not saved after the last changes.
            let file_sectors = file_len / SECTOR_SIZE as u64;
            let marked = shared.allocator.allocated_count();
            if !shared.allocator.is_allocated(SectorIndex::ROOT) || marked != file_sectors {
                tracing::warn!(
                    marked,
                    file_sectors,
                    "sector bitmap out of date, rebuilding it from the trie"
                );
                rebuild_bitmap(&shared)?;
            }
            tracing::info!(
                hash_length,
                sectors = file_len / SECTOR_SIZE as u64,
                allocated = shared.allocator.allocated_count(),
                "reopened index"
            );
        }

        let root = Arc::new(TrieNode::load(&*shared.channel, SectorIndex::ROOT, 0)?);
        Ok(Loaded {
            hasher: setup.hasher.clone(),
            shared,
            root,
            locked: setup.locked,
        })
    }

    /// Flush the sector bitmap.
    pub fn save(&self) -> Result<()> {
        let state = self.state.read();
        let loaded = state.loaded()?;
        loaded.shared.allocator.persist()?;
        loaded.shared.channel.sync()?;
        Ok(())
    }

    /// Save and release the index. Calling this more than once is fine.
    ///
    /// The index ends up closed even if saving fails.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match std::mem::replace(&mut *state, Lifecycle::Closed) {
            Lifecycle::Loaded(loaded) => {
                let res = loaded.shared.allocator.persist().and_then(|()| {
                    loaded.shared.channel.sync()?;
                    Ok(())
                });
                loaded.shared.cache.clear();
                if loaded.locked {
                    loaded.shared.channel.unlock()?;
                }
                res
            }
            Lifecycle::Initialized(setup) => {
                if setup.locked {
                    setup.channel.unlock()?;
                }
                Ok(())
            }
            Lifecycle::Uninitialized | Lifecycle::Closed => Ok(()),
        }
    }

    /// Drop every entry.
    ///
    /// The file is truncated to the root sector, which is rewritten empty, and the bitmap is reset
    /// and persisted.
    pub fn clear(&self) -> Result<()> {
        let state = self.state.write();
        let loaded = state.loaded()?;
        let shared = &loaded.shared;

        shared.cache.clear();
        shared.allocator.reset();
        shared.channel.set_len(SECTOR_SIZE as u64)?;
        shared.allocator.set_file_sectors(1);
        shared.allocator.mark_used(SectorIndex::ROOT)?;
        loaded.root.reset(shared)?;
        shared.allocator.persist()?;

        tracing::debug!("cleared index");
        Ok(())
    }

    /// Get the value stored for `key`.
    pub fn get(&self, key: &K) -> Result<Option<i64>> {
        self.with_leaf(key, false, |loaded, leaf, hash| {
            let value = leaf.get_leaf(&loaded.shared, hash)?;
            Ok((value != EMPTY_SLOT).then_some(value))
        })
        .map(Option::flatten)
    }

    /// Store `value` for `key`, replacing any previous value.
    ///
    /// `-1` marks empty slots and is rejected with [`Error::ReservedValue`].
    pub fn set(&self, key: &K, value: i64) -> Result<()> {
        if value == EMPTY_SLOT {
            return Err(Error::ReservedValue(value));
        }
        self.with_leaf(key, true, |loaded, leaf, hash| {
            leaf.set_leaf(&loaded.shared, hash, value)
        })?;
        Ok(())
    }

    /// Whether a value is stored for `key`.
    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove the value stored for `key`, returning it.
    ///
    /// This only empties the leaf slot. Nodes are never unlinked and their sectors are never
    /// reclaimed, so the file does not shrink.
    pub fn remove(&self, key: &K) -> Result<Option<i64>> {
        self.with_leaf(key, false, |loaded, leaf, hash| {
            let prev = leaf.remove_leaf(&loaded.shared, hash)?;
            Ok((prev != EMPTY_SLOT).then_some(prev))
        })
        .map(Option::flatten)
    }

    /// Call `f` with the value stored for `key`, if any. Returns whether `f` was called.
    pub fn run_if_contains(&self, key: &K, f: impl FnOnce(i64)) -> Result<bool> {
        match self.get(key)? {
            Some(value) => {
                f(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the value stored for `key` with `f(value)`, if any. Returns whether a value was
    /// present.
    ///
    /// `f` runs while the leaf is locked, so the update is atomic with respect to other writers.
    pub fn change_if_contains(&self, key: &K, f: impl FnOnce(i64) -> i64) -> Result<bool> {
        let prev = self.with_leaf(key, false, |loaded, leaf, hash| {
            leaf.update_leaf(&loaded.shared, hash, |prev| {
                (prev != EMPTY_SLOT).then(|| f(prev))
            })
        })?;
        Ok(matches!(prev, Some(prev) if prev != EMPTY_SLOT))
    }

    /// Replace the value stored for `key` with `f(value)`, inserting `f(None)` if there is none.
    /// Returns the new value.
    ///
    /// `f` runs while the leaf is locked, so the update is atomic with respect to other writers.
    pub fn change(&self, key: &K, f: impl FnOnce(Option<i64>) -> i64) -> Result<i64> {
        let mut new = EMPTY_SLOT;
        self.with_leaf(key, true, |loaded, leaf, hash| {
            leaf.update_leaf(&loaded.shared, hash, |prev| {
                new = f((prev != EMPTY_SLOT).then_some(prev));
                Some(new)
            })
        })?;
        Ok(new)
    }

    /// The sectors visited from the root down to the leaf holding `key`, or `None` if the path
    /// does not exist. The leaf slot itself may still be empty.
    pub fn lookup_path(&self, key: &K) -> Result<Option<Vec<SectorIndex>>> {
        let state = self.state.read();
        let loaded = state.loaded()?;
        let hash = hash_key(loaded, key)?;

        let mut path = Vec::with_capacity(loaded.shared.hash_length);
        let mut node = loaded.root.clone();
        path.push(node.sector());
        while !node.is_leaf(loaded.shared.hash_length) {
            match node.child(&loaded.shared, &hash, false)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
            path.push(node.sector());
        }
        Ok(Some(path))
    }

    /// Call `f` with the hash and value of every entry, in ascending hash order.
    ///
    /// `f` must not call back into the index.
    pub fn for_each_entry(&self, mut f: impl FnMut(&[u8], i64)) -> Result<()> {
        let state = self.state.read();
        let loaded = state.loaded()?;
        walk(loaded, |_| (), &mut f)
    }

    /// The number of entries.
    pub fn len(&self) -> Result<u64> {
        let mut entries = 0;
        self.for_each_entry(|_, _| entries += 1)?;
        Ok(entries)
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Walk the whole trie and gather [`IndexStats`].
    pub fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read();
        let loaded = state.loaded()?;

        let hash_length = loaded.shared.hash_length;
        let mut nodes = 0;
        let mut entries = 0;
        walk(
            loaded,
            |node| {
                nodes += 1;
                if node.is_leaf(hash_length) {
                    entries += node.count_occupied() as u64;
                }
            },
            &mut |_, _| (),
        )?;

        Ok(IndexStats {
            hash_length,
            nodes,
            allocated_sectors: loaded.shared.allocator.allocated_count(),
            entries,
            file_len: loaded.shared.channel.len()?,
        })
    }

    /// Whether the sector bitmap has changes which were not saved yet. `false` unless loaded.
    pub fn is_dirty(&self) -> bool {
        self.state
            .read()
            .loaded()
            .map_or(false, |loaded| loaded.shared.allocator.is_dirty())
    }

    /// Override the dirty flag of the sector bitmap.
    pub fn set_dirty(&self, dirty: bool) -> Result<()> {
        let state = self.state.read();
        state.loaded()?.shared.allocator.set_dirty(dirty);
        Ok(())
    }

    /// The hash length of a loaded index.
    pub fn hash_length(&self) -> Option<usize> {
        self.state
            .read()
            .loaded()
            .ok()
            .map(|loaded| loaded.shared.hash_length)
    }

    /// The metrics collector. Inactive unless enabled in the [`Options`].
    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// The directory the index was configured with.
    pub fn path(&self) -> &Path {
        &self.options.path
    }

    // Descend to the leaf selected by `key` and run `f` on it. Returns `None` without calling `f`
    // if the path is missing and `create` is not set.
    fn with_leaf<T>(
        &self,
        key: &K,
        create: bool,
        f: impl FnOnce(&Loaded<K>, &TrieNode, &[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        let state = self.state.read();
        let loaded = state.loaded()?;
        let hash = hash_key(loaded, key)?;

        let mut node = loaded.root.clone();
        while !node.is_leaf(loaded.shared.hash_length) {
            match node.child(&loaded.shared, &hash, create)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        f(loaded, &*node, &hash[..]).map(Some)
    }
}

impl<K: ?Sized + 'static> Drop for HashTrieIndex<K> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(err = %e, "failed to close index on drop");
        }
    }
}

fn hash_key<K: ?Sized + 'static>(loaded: &Loaded<K>, key: &K) -> Result<KeyHash> {
    let hash = loaded.hasher.hash(key);
    if hash.len() != loaded.shared.hash_length {
        return Err(Error::consistency(format!(
            "hasher produced {} bytes, expected {}",
            hash.len(),
            loaded.shared.hash_length
        )));
    }
    Ok(hash)
}

// Depth-first walk over all nodes, calling `on_node` for every node and `on_entry` for every
// occupied leaf slot.
fn walk<K: ?Sized + 'static>(
    loaded: &Loaded<K>,
    mut on_node: impl FnMut(&TrieNode),
    on_entry: &mut dyn FnMut(&[u8], i64),
) -> Result<()> {
    let shared = &loaded.shared;
    let mut stack = vec![(loaded.root.clone(), KeyHash::new())];

    while let Some((node, prefix)) = stack.pop() {
        on_node(&*node);

        if node.is_leaf(shared.hash_length) {
            let mut hash = prefix;
            for (slot, value) in node.occupied_slots() {
                hash.push(slot);
                on_entry(&hash[..], value);
                hash.pop();
            }
            continue;
        }

        // push in reverse so the lowest slot is visited first.
        for (slot, _) in node.occupied_slots().into_iter().rev() {
            let child = node.child_at(shared, slot, false)?.ok_or_else(|| {
                Error::consistency(format!("slot {slot} of {} emptied during walk", node.sector()))
            })?;
            let mut child_prefix = prefix.clone();
            child_prefix.push(slot);
            stack.push((child, child_prefix));
        }
    }
    Ok(())
}

// Reconstruct the allocation bitmap from the sectors reachable from the root.
fn rebuild_bitmap(shared: &Shared) -> Result<()> {
    let file_sectors = shared.allocator.file_sectors();
    let mut reachable = SectorBitmap::in_memory();
    reachable.set(SectorIndex::ROOT.0);

    let mut stack = vec![(SectorIndex::ROOT, 0usize)];
    while let Some((sector, depth)) = stack.pop() {
        if depth + 1 == shared.hash_length {
            continue;
        }
        let image = io::read_sector(&*shared.channel, sector)?;
        for (slot, pointer) in image.iter_occupied() {
            let child = SectorIndex::from_slot(pointer)
                .filter(|child| child.0 < file_sectors)
                .ok_or_else(|| {
                    Error::consistency(format!(
                        "slot {slot} of {sector} points outside the file: {pointer}"
                    ))
                })?;
            if reachable.set(child.0) {
                return Err(Error::consistency(format!(
                    "{child} is linked from more than one slot"
                )));
            }
            stack.push((child, depth + 1));
        }
    }

    shared.allocator.with_bitmap(|bitmap| {
        bitmap.clear();
        for sector in reachable.iter_set() {
            bitmap.set(sector);
        }
    });
    shared.allocator.persist()
}
