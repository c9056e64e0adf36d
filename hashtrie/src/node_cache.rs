//! The node cache keeps recently visited trie nodes in memory.
//!
//! Nodes are keyed by their sector, not by their parent: a child is found by reading the sector
//! pointer out of the parent's slot and looking that sector up here. The cache is bounded and
//! evicts in least-recently-used order, but it never evicts a node which is referenced from
//! outside the cache. Whoever holds such a reference may be holding, or about to take, the node's
//! lock, and evicting it would allow a second in-memory copy of the same sector to appear.
//!
//! Eviction only runs when a node is inserted into a shard. A shard whose nodes are in use grows
//! beyond its bound and is trimmed back on its next insert after they are released.

use crate::{error::Result, node::TrieNode};
use hashtrie_core::SectorIndex;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use std::{collections::hash_map::RandomState, hash::BuildHasher, sync::Arc};

/// A cache for trie nodes.
///
/// This is cheap to clone.
#[derive(Clone)]
pub struct NodeCache {
    inner: Arc<Shared>,
}

impl NodeCache {
    /// Create a new cache with the given number of shards and the maximum number of items
    /// to hold. `shards` must be non-zero.
    pub fn new(shards: usize, max_items: usize) -> Self {
        let items_per_shard = max_items / shards;
        NodeCache {
            inner: Arc::new(Shared {
                shards: (0..shards)
                    .map(|_| Shard {
                        cache: LruCache::unbounded(),
                        max_items: items_per_shard,
                    })
                    .map(Mutex::new)
                    .collect::<Vec<_>>(),
                shard_assigner: RandomState::new(),
            }),
        }
    }

    /// Get a cache entry, updating the LRU state.
    #[cfg(test)]
    pub fn get(&self, sector: SectorIndex) -> Option<Arc<TrieNode>> {
        let mut shard = self.inner.shard_for(sector);

        shard.cache.get(&sector).cloned()
    }

    /// Get a cache entry or, on a miss, load it with `load` and insert it.
    ///
    /// The shard stays locked while loading so that the same sector is never loaded twice
    /// concurrently. Returns the node and whether it was a cache hit.
    pub fn get_or_load(
        &self,
        sector: SectorIndex,
        load: impl FnOnce() -> Result<TrieNode>,
    ) -> Result<(Arc<TrieNode>, bool)> {
        let mut shard = self.inner.shard_for(sector);

        if let Some(node) = shard.cache.get(&sector) {
            return Ok((node.clone(), true));
        }

        let node = Arc::new(load()?);
        shard.cache.put(sector, node.clone());
        shard.evict();
        Ok((node, false))
    }

    /// Insert a freshly created node.
    pub fn insert(&self, node: Arc<TrieNode>) {
        let mut shard = self.inner.shard_for(node.sector());

        shard.cache.put(node.sector(), node);
        shard.evict();
    }

    /// Check whether the cache contains a sector without updating the LRU state.
    #[cfg(test)]
    pub fn contains(&self, sector: SectorIndex) -> bool {
        self.inner.shard_for(sector).cache.contains(&sector)
    }

    /// The number of cached nodes.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().cache.len()).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached node.
    pub fn clear(&self) {
        for shard in &self.inner.shards {
            shard.lock().cache.clear();
        }
    }
}

struct Shared {
    shards: Vec<Mutex<Shard>>,
    shard_assigner: RandomState,
}

impl Shared {
    fn shard_for(&self, sector: SectorIndex) -> MutexGuard<'_, Shard> {
        self.shards[self.shard_index_for(sector)].lock()
    }

    fn shard_index_for(&self, sector: SectorIndex) -> usize {
        (self.shard_assigner.hash_one(sector.0) as usize) % self.shards.len()
    }
}

struct Shard {
    cache: LruCache<SectorIndex, Arc<TrieNode>>,
    max_items: usize,
}

impl Shard {
    // Evict least-recently-used nodes until the shard fits, skipping nodes in use.
    //
    // A node is in use iff a reference exists outside of the cache. References are only handed
    // out under the shard lock, so the count cannot grow while we hold it.
    fn evict(&mut self) {
        let excess = self.cache.len().saturating_sub(self.max_items);
        if excess == 0 {
            return;
        }

        let victims = self
            .cache
            .iter()
            .rev()
            .filter(|(_, node)| Arc::strong_count(node) == 1)
            .map(|(sector, _)| *sector)
            .take(excess)
            .collect::<Vec<_>>();

        for sector in victims {
            let _ = self.cache.pop(&sector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(sector: u64) -> TrieNode {
        TrieNode::empty(SectorIndex(sector), 1)
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = NodeCache::new(1, 2);
        cache.insert(Arc::new(node(1)));
        cache.insert(Arc::new(node(2)));
        assert!(cache.get(SectorIndex(1)).is_some());
        cache.insert(Arc::new(node(3)));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(SectorIndex(1)));
        assert!(!cache.contains(SectorIndex(2)));
        assert!(cache.contains(SectorIndex(3)));
    }

    #[test]
    fn never_evicts_nodes_in_use() {
        let cache = NodeCache::new(1, 1);
        let pinned = Arc::new(node(1));
        cache.insert(pinned.clone());
        cache.insert(Arc::new(node(2)));

        // sector 1 is older, but still referenced.
        assert!(cache.contains(SectorIndex(1)));
        assert!(!cache.contains(SectorIndex(2)));

        drop(pinned);
        cache.insert(Arc::new(node(3)));
        assert!(!cache.contains(SectorIndex(1)));
        assert!(cache.contains(SectorIndex(3)));
    }

    #[test]
    fn loads_once() {
        let cache = NodeCache::new(4, 16);
        let (a, hit) = cache.get_or_load(SectorIndex(7), || Ok(node(7))).unwrap();
        assert!(!hit);
        let (b, hit) = cache
            .get_or_load(SectorIndex(7), || panic!("must not load twice"))
            .unwrap();
        assert!(hit);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn failed_load_caches_nothing() {
        let cache = NodeCache::new(1, 16);
        let res = cache.get_or_load(SectorIndex(9), || {
            Err(crate::Error::consistency("broken"))
        });
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_only_pinned() {
        let cache = NodeCache::new(1, 0);
        let (kept, _) = cache.get_or_load(SectorIndex(1), || Ok(node(1))).unwrap();
        let (loaded, _) = cache.get_or_load(SectorIndex(2), || Ok(node(2))).unwrap();

        // both are referenced by their callers, so the shard runs over its bound.
        assert_eq!(cache.len(), 2);

        drop(loaded);
        let (third, _) = cache.get_or_load(SectorIndex(3), || Ok(node(3))).unwrap();
        assert!(cache.contains(SectorIndex(1)));
        assert!(!cache.contains(SectorIndex(2)));
        assert!(cache.contains(SectorIndex(3)));

        drop(kept);
        drop(third);
        cache.insert(Arc::new(node(4)));
        assert!(cache.is_empty());
    }
}
