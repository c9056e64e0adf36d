//! Core schema and types of the hashtrie index.
//!
//! This crate defines the on-disk sector layout and the key hashing capability in a
//! backend-agnostic manner. It does no I/O on its own.

pub mod hasher;
pub mod sector;

pub use hasher::{KeyHash, KeyHasher, ReconstructKey, MAX_HASH_LENGTH};
pub use sector::{SectorImage, SectorIndex, EMPTY_SLOT, SECTOR_SIZE, SLOTS_PER_SECTOR};
