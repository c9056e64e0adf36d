//! Trie nodes: the decoded, lockable view of one sector at a known depth.
//!
//! A node at depth `d` is selected by `hash[d]`. Below the leaf depth a non-empty slot holds the
//! sector index of a child, at the leaf depth it holds the caller's value. Every mutation is
//! written through to the node's sector before the node's lock is released.
//!
//! Locks are taken strictly parent before child. A parent's write lock is held while its child is
//! allocated and linked, but never while the child is locked.

use crate::{
    error::{Error, Result},
    io::{self, Channel},
    metrics::Metric,
    Shared,
};
use hashtrie_core::{SectorImage, SectorIndex, EMPTY_SLOT};
use parking_lot::RwLock;
use std::sync::Arc;

pub struct TrieNode {
    sector: SectorIndex,
    depth: usize,
    image: RwLock<SectorImage>,
}

impl TrieNode {
    /// A node whose sector holds nothing but empty slots.
    pub fn empty(sector: SectorIndex, depth: usize) -> Self {
        TrieNode {
            sector,
            depth,
            image: RwLock::new(SectorImage::empty()),
        }
    }

    /// Read a node from its sector.
    pub fn load(channel: &dyn Channel, sector: SectorIndex, depth: usize) -> Result<Self> {
        let image = io::read_sector(channel, sector)?;
        Ok(TrieNode {
            sector,
            depth,
            image: RwLock::new(image),
        })
    }

    pub fn sector(&self) -> SectorIndex {
        self.sector
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_leaf(&self, hash_length: usize) -> bool {
        self.depth + 1 == hash_length
    }

    /// Get the child selected by `hash`, creating it if it's absent and `create` is set.
    ///
    /// Returns `None` if the child does not exist and was not created.
    pub fn child(
        &self,
        shared: &Shared,
        hash: &[u8],
        create: bool,
    ) -> Result<Option<Arc<TrieNode>>> {
        self.check_internal(shared)?;
        self.child_at(shared, hash[self.depth], create)
    }

    /// Get the child behind `slot`, creating it if it's absent and `create` is set.
    pub fn child_at(
        &self,
        shared: &Shared,
        slot: u8,
        create: bool,
    ) -> Result<Option<Arc<TrieNode>>> {
        self.check_internal(shared)?;

        let pointer = self.image.read().get(slot);
        if pointer != EMPTY_SLOT {
            return self.load_child(shared, pointer).map(Some);
        }
        if !create {
            return Ok(None);
        }

        let mut image = self.image.write();

        // somebody else may have linked the child while we were waiting for the write lock.
        let pointer = image.get(slot);
        if pointer != EMPTY_SLOT {
            drop(image);
            return self.load_child(shared, pointer).map(Some);
        }

        let sector = shared.allocator.allocate()?;
        let child = Arc::new(TrieNode::empty(sector, self.depth + 1));
        shared.cache.insert(child.clone());

        image.set(slot, sector.to_slot());
        if let Err(e) = shared.write_sector(self.sector, &image) {
            // the sector stays allocated but unreachable.
            image.set(slot, EMPTY_SLOT);
            return Err(e);
        }
        shared.sync()?;

        tracing::trace!(parent = %self.sector, slot, child = %sector, "linked new node");
        Ok(Some(child))
    }

    fn load_child(&self, shared: &Shared, pointer: i64) -> Result<Arc<TrieNode>> {
        shared.metrics.count(Metric::NodeRequests);

        let depth = self.depth + 1;
        let sector = SectorIndex::from_slot(pointer)
            .filter(|s| *s != SectorIndex::ROOT)
            .ok_or_else(|| {
                Error::consistency(format!(
                    "node {} holds invalid child pointer {pointer}",
                    self.sector
                ))
            })?;

        let (node, hit) = shared.cache.get_or_load(sector, || {
            let _timer = shared.metrics.record(Metric::NodeLoadTime);
            if sector.0 >= shared.allocator.file_sectors() {
                return Err(Error::consistency(format!(
                    "child {sector} of node {} lies beyond the end of the file",
                    self.sector
                )));
            }
            TrieNode::load(&*shared.channel, sector, depth)
        })?;

        if !hit {
            shared.metrics.count(Metric::NodeCacheMisses);
        }
        if node.depth != depth {
            return Err(Error::consistency(format!(
                "sector {sector} is reachable at depths {} and {depth}",
                node.depth
            )));
        }
        Ok(node)
    }

    /// Read the leaf slot selected by `hash`. `-1` means absent.
    pub fn get_leaf(&self, shared: &Shared, hash: &[u8]) -> Result<i64> {
        let slot = self.leaf_slot(shared, hash)?;
        Ok(self.image.read().get(slot))
    }

    /// Store `value` in the leaf slot selected by `hash` and return the previous value.
    pub fn set_leaf(&self, shared: &Shared, hash: &[u8], value: i64) -> Result<i64> {
        if value == EMPTY_SLOT {
            return Err(Error::ReservedValue(value));
        }
        self.update_leaf(shared, hash, |_| Some(value))
    }

    /// Empty the leaf slot selected by `hash` and return the previous value.
    ///
    /// The node itself stays linked and allocated even if this empties it.
    pub fn remove_leaf(&self, shared: &Shared, hash: &[u8]) -> Result<i64> {
        let slot = self.leaf_slot(shared, hash)?;
        let mut image = self.image.write();
        self.write_slot(shared, &mut image, slot, EMPTY_SLOT)
    }

    /// Read-modify-write the leaf slot selected by `hash` under the write lock.
    ///
    /// `f` receives the current value (`-1` if absent) and returns the new value, or `None` to
    /// leave the slot untouched. Returns the previous value.
    pub fn update_leaf(
        &self,
        shared: &Shared,
        hash: &[u8],
        f: impl FnOnce(i64) -> Option<i64>,
    ) -> Result<i64> {
        let slot = self.leaf_slot(shared, hash)?;
        let mut image = self.image.write();
        let prev = image.get(slot);
        match f(prev) {
            None => Ok(prev),
            Some(EMPTY_SLOT) => Err(Error::ReservedValue(EMPTY_SLOT)),
            Some(value) => self.write_slot(shared, &mut image, slot, value),
        }
    }

    // Set a slot and write the sector through. Unchanged slots are not rewritten. If the write
    // fails the in-memory slot is restored. A failed sync keeps the new value, which the file
    // already holds.
    fn write_slot(
        &self,
        shared: &Shared,
        image: &mut SectorImage,
        slot: u8,
        value: i64,
    ) -> Result<i64> {
        let prev = image.set(slot, value);
        if prev == value {
            return Ok(prev);
        }
        if let Err(e) = shared.write_sector(self.sector, image) {
            image.set(slot, prev);
            return Err(e);
        }
        shared.sync()?;
        Ok(prev)
    }

    /// Replace the node's contents with empty slots and persist it.
    pub(crate) fn reset(&self, shared: &Shared) -> Result<()> {
        let mut image = self.image.write();
        *image = SectorImage::empty();
        shared.write_sector(self.sector, &image)?;
        shared.sync()
    }

    /// The number of non-empty slots.
    pub fn count_occupied(&self) -> usize {
        self.image.read().occupied()
    }

    /// A snapshot of the non-empty slots and their values.
    pub fn occupied_slots(&self) -> Vec<(u8, i64)> {
        self.image.read().iter_occupied().collect()
    }

    fn leaf_slot(&self, shared: &Shared, hash: &[u8]) -> Result<u8> {
        if !self.is_leaf(shared.hash_length) {
            return Err(Error::state(format!(
                "leaf operation on node {} at depth {}, leaf depth is {}",
                self.sector,
                self.depth,
                shared.hash_length - 1
            )));
        }
        Ok(hash[self.depth])
    }

    fn check_internal(&self, shared: &Shared) -> Result<()> {
        if self.is_leaf(shared.hash_length) {
            return Err(Error::state(format!(
                "child lookup on leaf node {}",
                self.sector
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::SectorAllocator,
        bitmap::SectorBitmap,
        io::{FaultyChannel, MemChannel},
        metrics::Metrics,
        node_cache::NodeCache,
    };

    fn shared(hash_length: usize) -> (Shared, Arc<TrieNode>) {
        shared_over(Arc::new(MemChannel::new()), hash_length, false)
    }

    fn shared_over(
        channel: Arc<dyn Channel>,
        hash_length: usize,
        sync_writes: bool,
    ) -> (Shared, Arc<TrieNode>) {
        let allocator = SectorAllocator::new(
            channel.clone(),
            SectorBitmap::in_memory(),
            1000,
            sync_writes,
            Metrics::new(true),
        )
        .unwrap();
        assert_eq!(allocator.allocate().unwrap(), SectorIndex::ROOT);
        let shared = Shared {
            channel,
            allocator,
            cache: NodeCache::new(1, 64),
            hash_length,
            sync_writes,
            metrics: Metrics::new(true),
        };
        let root = Arc::new(TrieNode::empty(SectorIndex::ROOT, 0));
        (shared, root)
    }

    #[test]
    fn creates_child_once() {
        let (shared, root) = shared(2);
        assert!(root.child(&shared, &[7, 1], false).unwrap().is_none());

        let a = root.child(&shared, &[7, 1], true).unwrap().unwrap();
        let b = root.child(&shared, &[7, 2], true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.sector(), SectorIndex(1));
        assert_eq!(a.depth(), 1);
        assert_eq!(root.occupied_slots(), vec![(7, 1)]);

        // the link was written through.
        let on_disk = io::read_sector(&*shared.channel, SectorIndex::ROOT).unwrap();
        assert_eq!(on_disk.get(7), 1);
    }

    #[test]
    fn leaf_write_through() {
        let (shared, root) = shared(2);
        let leaf = root.child(&shared, &[3, 9], true).unwrap().unwrap();

        assert_eq!(leaf.get_leaf(&shared, &[3, 9]).unwrap(), EMPTY_SLOT);
        assert_eq!(leaf.set_leaf(&shared, &[3, 9], 42).unwrap(), EMPTY_SLOT);
        assert_eq!(leaf.set_leaf(&shared, &[3, 9], 43).unwrap(), 42);
        assert_eq!(leaf.count_occupied(), 1);

        let on_disk = io::read_sector(&*shared.channel, leaf.sector()).unwrap();
        assert_eq!(on_disk.get(9), 43);

        assert_eq!(leaf.remove_leaf(&shared, &[3, 9]).unwrap(), 43);
        assert_eq!(leaf.count_occupied(), 0);
        let on_disk = io::read_sector(&*shared.channel, leaf.sector()).unwrap();
        assert_eq!(on_disk, SectorImage::empty());
    }

    #[test]
    fn reloaded_child_comes_from_disk() {
        let (shared, root) = shared(2);
        let leaf = root.child(&shared, &[0, 0], true).unwrap().unwrap();
        leaf.set_leaf(&shared, &[0, 0], 5).unwrap();
        drop(leaf);
        shared.cache.clear();

        let leaf = root.child(&shared, &[0, 0], false).unwrap().unwrap();
        assert_eq!(leaf.get_leaf(&shared, &[0, 0]).unwrap(), 5);
        let snapshot = shared.metrics.snapshot().unwrap();
        assert_eq!(snapshot.node_cache_misses, 1);
    }

    #[test]
    fn depth_mismatch_is_a_state_error() {
        let (shared, root) = shared(2);
        assert!(matches!(
            root.get_leaf(&shared, &[0, 0]),
            Err(Error::State(_))
        ));
        assert!(matches!(
            root.set_leaf(&shared, &[0, 0], 1),
            Err(Error::State(_))
        ));

        let leaf = root.child(&shared, &[0, 0], true).unwrap().unwrap();
        assert!(matches!(
            leaf.child(&shared, &[0, 0], true),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn sentinel_value_is_rejected() {
        let (shared, root) = shared(1);
        assert!(matches!(
            root.set_leaf(&shared, &[1], EMPTY_SLOT),
            Err(Error::ReservedValue(-1))
        ));
        assert!(matches!(
            root.update_leaf(&shared, &[1], |_| Some(EMPTY_SLOT)),
            Err(Error::ReservedValue(-1))
        ));
        assert_eq!(root.count_occupied(), 0);
    }

    #[test]
    fn pointer_beyond_file_is_a_consistency_error() {
        let (shared, root) = shared(2);
        {
            let mut image = root.image.write();
            image.set(4, 99);
        }
        assert!(matches!(
            root.child(&shared, &[4, 0], false),
            Err(Error::Consistency(_))
        ));
    }

    #[test]
    fn failed_link_restores_the_slot() {
        let channel = Arc::new(FaultyChannel::new());
        let (shared, root) = shared_over(channel.clone(), 2, false);

        // the new sector is blanked, but linking it into the root fails.
        channel.fail_writes_after(1);
        assert!(matches!(
            root.child(&shared, &[7, 1], true),
            Err(Error::Io(_))
        ));
        assert!(root.occupied_slots().is_empty());
        let on_disk = io::read_sector(&*shared.channel, SectorIndex::ROOT).unwrap();
        assert_eq!(on_disk, SectorImage::empty());
        assert!(shared.allocator.is_allocated(SectorIndex(1)));

        channel.heal();
        let child = root.child(&shared, &[7, 1], true).unwrap().unwrap();
        assert_eq!(child.sector(), SectorIndex(2));
        assert_eq!(root.occupied_slots(), vec![(7, 2)]);
    }

    #[test]
    fn failed_allocation_leaves_the_parent_alone() {
        let channel = Arc::new(FaultyChannel::new());
        let (shared, root) = shared_over(channel.clone(), 2, false);

        channel.fail_writes_after(0);
        assert!(matches!(
            root.child(&shared, &[7, 1], true),
            Err(Error::Io(_))
        ));
        assert!(root.occupied_slots().is_empty());
        assert!(!shared.allocator.is_allocated(SectorIndex(1)));

        channel.heal();
        let child = root.child(&shared, &[7, 1], true).unwrap().unwrap();
        assert_eq!(child.sector(), SectorIndex(1));
    }

    #[test]
    fn failed_leaf_write_restores_the_value() {
        let channel = Arc::new(FaultyChannel::new());
        let (shared, root) = shared_over(channel.clone(), 2, false);
        let leaf = root.child(&shared, &[3, 9], true).unwrap().unwrap();
        leaf.set_leaf(&shared, &[3, 9], 42).unwrap();

        channel.fail_writes_after(0);
        assert!(matches!(
            leaf.set_leaf(&shared, &[3, 9], 43),
            Err(Error::Io(_))
        ));
        assert!(leaf.remove_leaf(&shared, &[3, 9]).is_err());
        assert_eq!(leaf.get_leaf(&shared, &[3, 9]).unwrap(), 42);

        channel.heal();
        assert_eq!(leaf.set_leaf(&shared, &[3, 9], 43).unwrap(), 42);
        let on_disk = io::read_sector(&*shared.channel, leaf.sector()).unwrap();
        assert_eq!(on_disk.get(9), 43);
    }

    #[test]
    fn failed_sync_keeps_the_written_value() {
        let channel = Arc::new(FaultyChannel::new());
        let (shared, root) = shared_over(channel.clone(), 2, true);
        let leaf = root.child(&shared, &[3, 9], true).unwrap().unwrap();

        channel.fail_syncs(true);
        assert!(matches!(
            leaf.set_leaf(&shared, &[3, 9], 5),
            Err(Error::Io(_))
        ));
        // memory agrees with the file.
        assert_eq!(leaf.get_leaf(&shared, &[3, 9]).unwrap(), 5);
        let on_disk = io::read_sector(&*shared.channel, leaf.sector()).unwrap();
        assert_eq!(on_disk.get(9), 5);
    }
}
