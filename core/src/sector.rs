//! Sector geometry and the codec for a single trie node.
//!
//! The index file is a sequence of fixed-size sectors. Every sector holds exactly one trie node,
//! laid out as follows:
//!
//! ```rust,ignore
//! slots: [i64; 256] // little-endian, one per possible hash byte
//! ```
//!
//! A slot equal to [`EMPTY_SLOT`] is vacant. At internal depths an occupied slot holds the
//! [`SectorIndex`] of the child node, and at the leaf depth it holds the caller's value.

use core::fmt;

/// The size of a sector in bytes.
pub const SECTOR_SIZE: usize = 2048;

/// The number of slots in a sector: one for every value a hash byte can take.
pub const SLOTS_PER_SECTOR: usize = 256;

/// The size of a single slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// The value reserved for a vacant slot.
pub const EMPTY_SLOT: i64 = -1;

const _: () = assert!(SLOTS_PER_SECTOR * SLOT_SIZE == SECTOR_SIZE);

/// The number of a sector in the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorIndex(pub u64);

impl SectorIndex {
    /// The root node always lives in the first sector.
    pub const ROOT: SectorIndex = SectorIndex(0);

    /// The byte offset of this sector in the index file.
    pub fn offset(&self) -> u64 {
        self.0 * SECTOR_SIZE as u64
    }

    /// The file length needed for this sector to be addressable.
    pub fn end_offset(&self) -> u64 {
        (self.0 + 1) * SECTOR_SIZE as u64
    }

    /// Interpret a slot value as a child pointer. Negative values are never valid pointers.
    pub fn from_slot(slot: i64) -> Option<Self> {
        u64::try_from(slot).ok().map(SectorIndex)
    }

    /// Encode this index as a slot value.
    ///
    /// Panics if the index does not fit into a signed 64-bit slot. The allocator never hands out
    /// such indices.
    pub fn to_slot(&self) -> i64 {
        i64::try_from(self.0).expect("sector index exceeds slot range")
    }
}

impl From<u64> for SectorIndex {
    fn from(x: u64) -> Self {
        SectorIndex(x)
    }
}

impl fmt::Display for SectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The decoded contents of one sector.
#[derive(Clone, PartialEq, Eq)]
pub struct SectorImage {
    slots: [i64; SLOTS_PER_SECTOR],
}

impl SectorImage {
    /// An image with every slot vacant.
    pub const fn empty() -> Self {
        SectorImage {
            slots: [EMPTY_SLOT; SLOTS_PER_SECTOR],
        }
    }

    /// Decode a sector. `buf` must be exactly [`SECTOR_SIZE`] bytes long.
    pub fn decode(buf: &[u8]) -> Self {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut slots = [EMPTY_SLOT; SLOTS_PER_SECTOR];
        for (slot, chunk) in slots.iter_mut().zip(buf.chunks_exact(SLOT_SIZE)) {
            // UNWRAP: chunks_exact yields SLOT_SIZE-byte chunks.
            *slot = i64::from_le_bytes(chunk.try_into().unwrap());
        }
        SectorImage { slots }
    }

    /// Encode the sector into `buf`, which must be exactly [`SECTOR_SIZE`] bytes long.
    pub fn encode_to(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        for (slot, chunk) in self.slots.iter().zip(buf.chunks_exact_mut(SLOT_SIZE)) {
            chunk.copy_from_slice(&slot.to_le_bytes());
        }
    }

    /// Encode the sector into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Box<[u8; SECTOR_SIZE]> {
        let mut buf = Box::new([0u8; SECTOR_SIZE]);
        self.encode_to(&mut buf[..]);
        buf
    }

    /// Read out the raw value of a slot.
    pub fn get(&self, slot: u8) -> i64 {
        self.slots[slot as usize]
    }

    /// Overwrite a slot, returning its previous value.
    pub fn set(&mut self, slot: u8, value: i64) -> i64 {
        std::mem::replace(&mut self.slots[slot as usize], value)
    }

    /// Whether the slot holds anything.
    pub fn is_occupied(&self, slot: u8) -> bool {
        self.get(slot) != EMPTY_SLOT
    }

    /// The number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|&&v| v != EMPTY_SLOT).count()
    }

    /// Iterate over `(slot, value)` for all occupied slots in ascending slot order.
    pub fn iter_occupied(&self) -> impl Iterator<Item = (u8, i64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != EMPTY_SLOT)
            .map(|(i, &v)| (i as u8, v))
    }
}

impl Default for SectorImage {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SectorImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorImage")
            .field("occupied", &self.occupied())
            .finish()
    }
}
