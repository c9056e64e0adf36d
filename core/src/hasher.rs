//! Key hashers (partially feature-gated) and utilities for implementing them.
//!
//! The index never looks at keys directly. A [`KeyHasher`] turns every key into a fixed-length
//! byte string, and byte `d` of that string selects the slot at depth `d` of the trie. The length
//! of the hash is therefore also the depth of the trie, and it must not change for the lifetime of
//! an index.
//!
//! Two keys with identical hashes are indistinguishable to the index.

use arrayvec::ArrayVec;
use core::marker::PhantomData;

/// The longest hash supported by the index.
pub const MAX_HASH_LENGTH: usize = 64;

/// The hash of a key.
pub type KeyHash = ArrayVec<u8, MAX_HASH_LENGTH>;

/// A function mapping keys to fixed-length byte strings.
///
/// Every call to [`KeyHasher::hash`] must return exactly [`KeyHasher::hash_length`] bytes.
pub trait KeyHasher<K: ?Sized>: Send + Sync {
    /// The length of every hash produced by this hasher. Between 1 and [`MAX_HASH_LENGTH`].
    fn hash_length(&self) -> usize;

    /// Hash a key.
    fn hash(&self, key: &K) -> KeyHash;
}

/// A hasher whose output is the key itself, which allows keys to be recovered from the trie.
pub trait ReconstructKey<K>: KeyHasher<K> {
    /// Rebuild the key from its hash.
    fn reconstruct(&self, hash: &[u8]) -> K;
}

fn truncated(digest: &[u8], len: usize) -> KeyHash {
    let mut hash = KeyHash::new();
    // UNWRAP: hashers never produce more than MAX_HASH_LENGTH bytes.
    hash.try_extend_from_slice(&digest[..len]).unwrap();
    hash
}

/// A hasher based on xxHash64. Cheap, but limited to 8 bytes of output and not collision
/// resistant.
#[derive(Debug, Clone, Copy)]
pub struct XxKeyHasher {
    seed: u64,
    len: usize,
}

impl XxKeyHasher {
    /// Create a new hasher. Returns `None` if `len` is not within `1..=8`.
    pub fn new(seed: u64, len: usize) -> Option<Self> {
        (1..=8).contains(&len).then_some(XxKeyHasher { seed, len })
    }
}

impl<K: AsRef<[u8]> + ?Sized> KeyHasher<K> for XxKeyHasher {
    fn hash_length(&self) -> usize {
        self.len
    }

    fn hash(&self, key: &K) -> KeyHash {
        let h = twox_hash::XxHash64::oneshot(self.seed, key.as_ref());
        truncated(&h.to_le_bytes(), self.len)
    }
}

/// Integers which can serve as their own hash.
pub trait LeBytes: Copy + Send + Sync + 'static {
    /// The size of the integer in bytes.
    const SIZE: usize;

    /// Write the little-endian representation into `out`, which is exactly `SIZE` bytes long.
    fn write_le(self, out: &mut [u8]);

    /// Read the integer back from its little-endian representation.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_le_bytes {
    ($($t:ty),*) => {
        $(
            impl LeBytes for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$t>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_le_bytes!(u8, u16, u32, u64, i8, i16, i32, i64);

/// The identity "hash" for integer keys: the little-endian bytes of the key.
///
/// Keys are not scrambled, so sequential keys share long prefixes and the upper levels of the trie
/// stay small.
pub struct LeBytesHasher<T>(PhantomData<fn() -> T>);

impl<T> LeBytesHasher<T> {
    pub fn new() -> Self {
        LeBytesHasher(PhantomData)
    }
}

impl<T> Default for LeBytesHasher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: LeBytes> KeyHasher<T> for LeBytesHasher<T> {
    fn hash_length(&self) -> usize {
        T::SIZE
    }

    fn hash(&self, key: &T) -> KeyHash {
        let mut hash = KeyHash::new();
        for _ in 0..T::SIZE {
            hash.push(0);
        }
        key.write_le(&mut hash);
        hash
    }
}

impl<T: LeBytes> ReconstructKey<T> for LeBytesHasher<T> {
    fn reconstruct(&self, hash: &[u8]) -> T {
        T::read_le(hash)
    }
}

#[cfg(feature = "blake3-hasher")]
pub use self::blake3::Blake3KeyHasher;

/// A key hasher making use of blake3.
#[cfg(feature = "blake3-hasher")]
pub mod blake3 {
    use super::{KeyHash, KeyHasher, MAX_HASH_LENGTH};

    /// Hashes keys with blake3, using the extendable output for any length up to
    /// [`MAX_HASH_LENGTH`].
    #[derive(Debug, Clone, Copy)]
    pub struct Blake3KeyHasher {
        len: usize,
    }

    impl Blake3KeyHasher {
        /// Create a new hasher. Returns `None` if `len` is zero or exceeds [`MAX_HASH_LENGTH`].
        pub fn new(len: usize) -> Option<Self> {
            (1..=MAX_HASH_LENGTH)
                .contains(&len)
                .then_some(Blake3KeyHasher { len })
        }
    }

    impl<K: AsRef<[u8]> + ?Sized> KeyHasher<K> for Blake3KeyHasher {
        fn hash_length(&self) -> usize {
            self.len
        }

        fn hash(&self, key: &K) -> KeyHash {
            let mut out = [0u8; MAX_HASH_LENGTH];
            let mut hasher = blake3::Hasher::new();
            hasher.update(key.as_ref());
            hasher.finalize_xof().fill(&mut out[..self.len]);
            super::truncated(&out, self.len)
        }
    }
}

#[cfg(feature = "sha2-hasher")]
pub use self::sha2::Sha2KeyHasher;

/// A key hasher making use of sha2-256.
#[cfg(feature = "sha2-hasher")]
pub mod sha2 {
    use super::{KeyHash, KeyHasher};
    use sha2::{Digest, Sha256};

    /// Hashes keys with sha2-256, truncated to at most 32 bytes.
    #[derive(Debug, Clone, Copy)]
    pub struct Sha2KeyHasher {
        len: usize,
    }

    impl Sha2KeyHasher {
        /// Create a new hasher. Returns `None` if `len` is not within `1..=32`.
        pub fn new(len: usize) -> Option<Self> {
            (1..=32).contains(&len).then_some(Sha2KeyHasher { len })
        }
    }

    impl<K: AsRef<[u8]> + ?Sized> KeyHasher<K> for Sha2KeyHasher {
        fn hash_length(&self) -> usize {
            self.len
        }

        fn hash(&self, key: &K) -> KeyHash {
            let digest = Sha256::digest(key.as_ref());
            super::truncated(&digest, self.len)
        }
    }
}
