//! The sector bitmap: which sectors of the index file are in use.
//!
//! The bitmap lives next to the index file and is only written on explicit persistence, so the
//! on-disk copy may lag behind the sectors actually written. Layout of the sidecar file:
//!
//! ```rust,ignore
//! magic: [u8; 4] // "HTBM"
//! version: u32
//! hash_length: u32 // 0 if unknown
//! bits: u64
//! words: [u64; (bits + 63) / 64]
//! ```
//!
//! All integers are little-endian.

use bitvec::prelude::*;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read as _, Write as _},
    path::PathBuf,
};

const MAGIC: [u8; 4] = *b"HTBM";
const VERSION: u32 = 2;
const HEADER_SIZE: usize = 20;

pub struct SectorBitmap {
    path: Option<PathBuf>,
    bits: BitVec<u64, Lsb0>,
    hash_length: Option<usize>,
    dirty: bool,
}

impl SectorBitmap {
    /// A bitmap which is never written anywhere.
    pub fn in_memory() -> Self {
        SectorBitmap {
            path: None,
            bits: BitVec::new(),
            hash_length: None,
            dirty: false,
        }
    }

    /// Load the bitmap stored at `path`. A missing file yields an empty bitmap.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let (hash_length, bits) = match File::open(&path) {
            Ok(mut file) => {
                let mut raw = Vec::new();
                file.read_to_end(&mut raw)?;
                decode(&raw)?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (None, BitVec::new()),
            Err(e) => return Err(e),
        };

        Ok(SectorBitmap {
            path: Some(path),
            bits,
            hash_length,
            dirty: false,
        })
    }

    /// The hash length of the index this bitmap belongs to, if it was ever recorded.
    pub fn hash_length(&self) -> Option<usize> {
        self.hash_length
    }

    pub fn set_hash_length(&mut self, hash_length: usize) {
        if self.hash_length != Some(hash_length) {
            self.hash_length = Some(hash_length);
            self.dirty = true;
        }
    }

    pub fn get(&self, index: u64) -> bool {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.bits.get(i).map(|bit| *bit))
            .unwrap_or(false)
    }

    /// Set a bit, returning its previous value.
    pub fn set(&mut self, index: u64) -> bool {
        let i = index as usize;
        if i >= self.bits.len() {
            self.bits.resize(i + 1, false);
        }
        self.dirty = true;
        self.bits.replace(i, true)
    }

    /// Clear a bit, returning its previous value.
    pub fn unset(&mut self, index: u64) -> bool {
        let i = index as usize;
        if i >= self.bits.len() {
            return false;
        }
        self.dirty = true;
        let prev = self.bits.replace(i, false);
        // keep the tail trimmed so the persisted form stays short.
        let used = self.bits.last_one().map_or(0, |last| last + 1);
        self.bits.truncate(used);
        prev
    }

    /// The lowest clear bit.
    pub fn next_clear(&self) -> u64 {
        self.bits.first_zero().unwrap_or(self.bits.len()) as u64
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        self.bits.clear();
        self.dirty = true;
    }

    /// The number of set bits.
    pub fn count(&self) -> u64 {
        self.bits.count_ones() as u64
    }

    /// Iterate over all set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.iter_ones().map(|i| i as u64)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Write the bitmap to its file and clear the dirty flag.
    ///
    /// The new contents are written to a temporary file which then replaces the old one, so a
    /// crash leaves either the old or the new bitmap behind.
    pub fn persist(&mut self) -> io::Result<()> {
        let Some(path) = self.path.as_ref() else {
            self.dirty = false;
            return Ok(());
        };

        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&encode(self.hash_length, &self.bits))?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }

        self.dirty = false;
        Ok(())
    }
}

fn encode(hash_length: Option<usize>, bits: &BitSlice<u64, Lsb0>) -> Vec<u8> {
    let words = bits.len().div_ceil(64);
    let mut buf = Vec::with_capacity(HEADER_SIZE + words * 8);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(hash_length.unwrap_or(0) as u32).to_le_bytes());
    buf.extend_from_slice(&(bits.len() as u64).to_le_bytes());
    for chunk in bits.chunks(64) {
        buf.extend_from_slice(&chunk.load_le::<u64>().to_le_bytes());
    }
    buf
}

fn decode(raw: &[u8]) -> io::Result<(Option<usize>, BitVec<u64, Lsb0>)> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    if raw.len() < HEADER_SIZE || raw[0..4] != MAGIC {
        return Err(invalid("sector bitmap: bad magic"));
    }
    // UNWRAP: slices have the correct length.
    let version = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(invalid("sector bitmap: unsupported version"));
    }
    let hash_length = u32::from_le_bytes(raw[8..12].try_into().unwrap()) as usize;
    let len = u64::from_le_bytes(raw[12..20].try_into().unwrap()) as usize;
    let body = &raw[HEADER_SIZE..];
    if body.len() != len.div_ceil(64) * 8 {
        return Err(invalid("sector bitmap: length mismatch"));
    }

    let words = body
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect::<Vec<_>>();
    let mut bits = BitVec::<u64, Lsb0>::from_vec(words);
    bits.truncate(len);
    Ok(((hash_length != 0).then_some(hash_length), bits))
}
