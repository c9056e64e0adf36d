use hashtrie::{
    Blake3KeyHasher, DirectoryOwner, HashTrieIndex, KeyHash, KeyHasher, MemChannel, Options,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A hasher mapping a fixed set of string keys to hand-picked hashes, so tests can control
/// which keys share nodes.
#[allow(dead_code)]
pub struct TableHasher {
    len: usize,
    table: HashMap<String, Vec<u8>>,
}

#[allow(dead_code)]
impl TableHasher {
    pub fn new(entries: &[(&str, &[u8])]) -> Self {
        let len = entries[0].1.len();
        assert!(entries.iter().all(|(_, hash)| hash.len() == len));
        TableHasher {
            len,
            table: entries
                .iter()
                .map(|(key, hash)| (key.to_string(), hash.to_vec()))
                .collect(),
        }
    }

    /// "A" hashes to `[0x10, 0x20]` and "B" to `[0x10, 0x21]`: both share the depth-0 slot.
    pub fn a_and_b() -> Self {
        Self::new(&[("A", &[0x10, 0x20]), ("B", &[0x10, 0x21])])
    }
}

impl KeyHasher<str> for TableHasher {
    fn hash_length(&self) -> usize {
        self.len
    }

    fn hash(&self, key: &str) -> KeyHash {
        let mut hash = KeyHash::new();
        hash.try_extend_from_slice(&self.table[key]).unwrap();
        hash
    }
}

#[allow(dead_code)]
pub fn opts(path: impl Into<PathBuf>) -> Options {
    let mut o = Options::new();
    o.path(path);
    o.sync_writes(false);
    o.metrics(true);
    o
}

/// Open a file-backed index over byte keys inside `dir`.
#[allow(dead_code)]
pub fn open_bytes(dir: &Path, hash_length: usize) -> HashTrieIndex<[u8]> {
    open_bytes_with(opts(dir), hash_length)
}

#[allow(dead_code)]
pub fn open_bytes_with(o: Options, hash_length: usize) -> HashTrieIndex<[u8]> {
    let hasher = Blake3KeyHasher::new(hash_length).unwrap();
    HashTrieIndex::open(o, Arc::new(hasher)).unwrap()
}

/// An index living entirely in memory. The channel is returned for inspecting the raw file.
#[allow(dead_code)]
pub fn in_memory<K: ?Sized + 'static>(
    o: Options,
    hasher: Arc<dyn KeyHasher<K>>,
) -> (HashTrieIndex<K>, Arc<MemChannel>) {
    let channel = Arc::new(MemChannel::new());
    let index = HashTrieIndex::new(o);
    index
        .init(&DirectoryOwner::ephemeral(hasher), channel.clone())
        .unwrap();
    index.load().unwrap();
    (index, channel)
}

/// A key derived from an id, e.g. `account-17`.
#[allow(dead_code)]
pub fn key(id: u64) -> Vec<u8> {
    format!("account-{id}").into_bytes()
}
