use crate::{cli::BenchParams, commands::Index};
use rand::{RngCore as _, SeedableRng as _};
use std::{
    ops::Range,
    sync::Arc,
    time::{Duration, Instant},
};
use threadpool::ThreadPool;

type Op = fn(&Index, &[u8], i64) -> hashtrie::Result<()>;

pub fn run(index: Arc<Index>, params: BenchParams) -> anyhow::Result<()> {
    anyhow::ensure!(params.threads > 0, "at least one thread is needed");

    index.clear()?;
    let keys = Arc::new(generate_keys(params.seed, params.keys));
    let pool = ThreadPool::new(params.threads);

    let insert = in_parallel(&pool, &index, &keys, |index, key, value| {
        index.set(key, value)
    })?;
    report("insert", keys.len(), insert);

    let read = in_parallel(&pool, &index, &keys, |index, key, _| {
        index.get(key).map(|_| ())
    })?;
    report("read", keys.len(), read);

    index.save()?;

    let stats = index.stats()?;
    println!("entries            {}", stats.entries);
    println!("nodes              {}", stats.nodes);
    println!("file size          {} bytes", stats.file_len);
    if stats.entries < keys.len() as u64 {
        // with short hashes, random keys collide.
        println!(
            "colliding keys     {}",
            keys.len() as u64 - stats.entries
        );
    }
    index.metrics().print();
    Ok(())
}

// Keys must be uniformly distributed. A PRNG seeded once is good enough.
fn generate_keys(seed: u64, count: u64) -> Vec<[u8; 16]> {
    let mut rng = rand_pcg::Lcg64Xsh32::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut key = [0; 16];
            rng.fill_bytes(&mut key);
            key
        })
        .collect()
}

// Split the keys evenly across the pool and run `op` on every key. Waits for all jobs and
// returns the first error, if any.
fn in_parallel(
    pool: &ThreadPool,
    index: &Arc<Index>,
    keys: &Arc<Vec<[u8; 16]>>,
    op: Op,
) -> anyhow::Result<Duration> {
    let ranges = chunks(keys.len(), pool.max_count()).collect::<Vec<_>>();
    let (tx, rx) = crossbeam_channel::bounded(ranges.len());
    let start = Instant::now();

    for range in ranges {
        let index = index.clone();
        let keys = keys.clone();
        let tx = tx.clone();
        pool.execute(move || {
            let res = range
                .map(|i| op(&index, &keys[i], i as i64))
                .collect::<hashtrie::Result<()>>();
            let _ = tx.send(res);
        });
    }
    drop(tx);

    for res in rx {
        res?;
    }
    Ok(start.elapsed())
}

fn chunks(len: usize, parts: usize) -> impl Iterator<Item = Range<usize>> {
    let size = len.div_ceil(parts.max(1)).max(1);
    (0..len).step_by(size).map(move |start| start..(start + size).min(len))
}

fn report(phase: &str, ops: usize, elapsed: Duration) {
    let per_sec = ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{phase:<6} {ops} keys in {} ({per_sec:.0} ops/s)",
        humantime::format_duration(Duration::from_micros(elapsed.as_micros() as u64))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_everything_once() {
        let ranges = chunks(10, 3).collect::<Vec<_>>();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);

        assert_eq!(chunks(2, 8).collect::<Vec<_>>(), vec![0..1, 1..2]);
        assert_eq!(chunks(0, 4).count(), 0);
    }

    #[test]
    fn in_parallel_visits_every_key() {
        use clap::Parser as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let cli = crate::cli::Cli::parse_from(["htidx", "--path", path, "--no-sync", "stats"]);
        let index = Arc::new(crate::commands::open(&cli.index).unwrap());
        let keys = Arc::new(generate_keys(1, 50));
        let pool = ThreadPool::new(3);

        in_parallel(&pool, &index, &keys, |index, key, value| index.set(key, value)).unwrap();
        assert_eq!(index.len().unwrap(), 50);
        assert_eq!(index.get(&keys[17]).unwrap(), Some(17));

        // errors from any worker reach the caller.
        let res = in_parallel(&pool, &index, &keys, |index, key, _| index.set(key, -1));
        assert!(res.is_err());
    }

    #[test]
    fn keys_are_reproducible() {
        assert_eq!(generate_keys(7, 32), generate_keys(7, 32));
        assert_ne!(generate_keys(7, 32), generate_keys(8, 32));
    }
}
