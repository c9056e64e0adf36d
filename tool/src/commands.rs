use crate::cli::{HasherKind, IndexParams, KeyParams, SetParams};
use anyhow::Context as _;
use hashtrie::{
    Blake3KeyHasher, HashTrieIndex, KeyHasher, Options, Sha2KeyHasher, XxKeyHasher,
};
use std::sync::Arc;

pub type Index = HashTrieIndex<[u8]>;

pub fn make_hasher(kind: HasherKind, hash_length: usize) -> anyhow::Result<Arc<dyn KeyHasher<[u8]>>> {
    let hasher: Option<Arc<dyn KeyHasher<[u8]>>> = match kind {
        HasherKind::Blake3 => Blake3KeyHasher::new(hash_length).map(|h| Arc::new(h) as _),
        HasherKind::Sha2 => Sha2KeyHasher::new(hash_length).map(|h| Arc::new(h) as _),
        HasherKind::Xx => XxKeyHasher::new(0, hash_length).map(|h| Arc::new(h) as _),
    };
    hasher.with_context(|| format!("hasher {kind:?} does not support hash length {hash_length}"))
}

pub fn open(params: &IndexParams) -> anyhow::Result<Index> {
    let hasher = make_hasher(params.hasher, params.hash_length as usize)?;

    let mut o = Options::new();
    o.path(&params.path);
    o.node_cache_size(params.cache_size);
    o.sync_writes(!params.no_sync);
    o.metrics(true);

    let index = HashTrieIndex::open(o, hasher)
        .with_context(|| format!("failed to open index at {}", params.path.display()))?;
    Ok(index)
}

pub fn parse_key(params: &IndexParams, key: &str) -> anyhow::Result<Vec<u8>> {
    if params.hex_keys {
        hex::decode(key).with_context(|| format!("key {key:?} is not valid hex"))
    } else {
        Ok(key.as_bytes().to_vec())
    }
}

pub fn init(index: &Index) -> anyhow::Result<()> {
    let stats = index.stats()?;
    println!(
        "index at {} ready: hash length {}, {} entries",
        index.path().display(),
        stats.hash_length,
        stats.entries
    );
    Ok(())
}

pub fn get(index: &Index, params: &IndexParams, key: KeyParams) -> anyhow::Result<()> {
    let key = parse_key(params, &key.key)?;
    match index.get(&key)? {
        Some(value) => println!("{value}"),
        None => println!("not found"),
    }
    Ok(())
}

pub fn set(index: &Index, params: &IndexParams, set: SetParams) -> anyhow::Result<()> {
    let key = parse_key(params, &set.key)?;
    index.set(&key, set.value)?;
    Ok(())
}

pub fn remove(index: &Index, params: &IndexParams, key: KeyParams) -> anyhow::Result<()> {
    let key = parse_key(params, &key.key)?;
    match index.remove(&key)? {
        Some(prev) => println!("{prev}"),
        None => println!("not found"),
    }
    Ok(())
}

pub fn dump(index: &Index, limit: Option<u64>) -> anyhow::Result<()> {
    let limit = limit.unwrap_or(u64::MAX);
    let mut printed = 0;
    index.for_each_entry(|hash, value| {
        if printed < limit {
            println!("{} {value}", hex::encode(hash));
            printed += 1;
        }
    })?;
    Ok(())
}

pub fn stats(index: &Index) -> anyhow::Result<()> {
    let stats = index.stats()?;
    println!("hash length        {}", stats.hash_length);
    println!("entries            {}", stats.entries);
    println!("nodes              {}", stats.nodes);
    println!("allocated sectors  {}", stats.allocated_sectors);
    println!("file size          {} bytes", stats.file_len);
    if stats.nodes != stats.allocated_sectors {
        println!(
            "unreachable        {} sectors",
            stats.allocated_sectors.saturating_sub(stats.nodes)
        );
    }
    Ok(())
}
