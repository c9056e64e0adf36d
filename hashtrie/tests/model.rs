//! Random operation sequences checked against a `HashMap`.

mod common;

use hashtrie::{LeBytesHasher, ReconstructKey};
use quickcheck::{Arbitrary, Gen, QuickCheck};
use std::{collections::HashMap, sync::Arc};

#[derive(Clone, Debug)]
enum Op {
    Set(u16, i64),
    Remove(u16),
    Get(u16),
    Increment(u16),
}

// keep keys in a narrow range so that operations hit the same nodes and slots.
fn arbitrary_key(g: &mut Gen) -> u16 {
    u16::arbitrary(g) % 1024
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Op {
        let key = arbitrary_key(g);
        match u8::arbitrary(g) % 4 {
            0 | 1 => {
                let value = match i64::arbitrary(g) {
                    -1 => 0,
                    v => v,
                };
                Op::Set(key, value)
            }
            2 => Op::Remove(key),
            _ => match bool::arbitrary(g) {
                true => Op::Get(key),
                false => Op::Increment(key),
            },
        }
    }
}

fn matches_model(ops: Vec<Op>) -> bool {
    let hasher = Arc::new(LeBytesHasher::<u16>::new());
    let (index, _) = common::in_memory::<u16>(common::opts("unused"), hasher.clone());
    let mut model = HashMap::new();

    for op in ops {
        match op {
            Op::Set(key, value) => {
                index.set(&key, value).unwrap();
                model.insert(key, value);
            }
            Op::Remove(key) => {
                if index.remove(&key).unwrap() != model.remove(&key) {
                    return false;
                }
            }
            Op::Get(key) => {
                if index.get(&key).unwrap() != model.get(&key).copied() {
                    return false;
                }
            }
            Op::Increment(key) => {
                let next = |v: Option<i64>| match v.unwrap_or(0).wrapping_add(1) {
                    -1 => 0,
                    v => v,
                };
                let expected = next(model.get(&key).copied());
                if index.change(&key, next).unwrap() != expected {
                    return false;
                }
                model.insert(key, expected);
            }
        }
    }

    let mut entries = HashMap::new();
    index
        .for_each_entry(|hash, value| {
            entries.insert(hasher.reconstruct(hash), value);
        })
        .unwrap();
    entries == model && index.len().unwrap() == model.len() as u64
}

#[test]
fn index_matches_hashmap() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(matches_model as fn(Vec<Op>) -> bool);
}
