//! Fixed-width key-value records and the key-hashing capability.
//!
//! Every record handled by the collator is a [`Pair`] of a key and an opaque
//! value, both of a fixed byte width known at compile time. Records are
//! serialized as `K::WIDTH + V::WIDTH` contiguous little-endian bytes with no
//! framing, which is what the partition files store.

use crate::error::{CollateError, Result};

/// A fixed-width, plain-value type that can be stored into and loaded from a
/// byte slice.
///
/// Implementations exist for the integer primitives and for `[u8; N]` blobs.
/// Keys additionally need `Ord`; values only need the codec.
pub trait FixedWidth: Copy + Send + Sync + 'static {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Writes the encoding into `dst`, which must be exactly `WIDTH` bytes.
    fn store(&self, dst: &mut [u8]);

    /// Reads a value back from `src`, which must be exactly `WIDTH` bytes.
    fn load(src: &[u8]) -> Self;
}

macro_rules! impl_fixed_width_int {
    ($($ty:ty),*) => {
        $(
            impl FixedWidth for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn store(&self, dst: &mut [u8]) {
                    dst.copy_from_slice(&self.to_le_bytes());
                }

                fn load(src: &[u8]) -> Self {
                    <$ty>::from_le_bytes(src.try_into().unwrap())
                }
            }
        )*
    };
}

impl_fixed_width_int!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128);

impl<const N: usize> FixedWidth for [u8; N] {
    const WIDTH: usize = N;

    fn store(&self, dst: &mut [u8]) {
        dst.copy_from_slice(self);
    }

    fn load(src: &[u8]) -> Self {
        src.try_into().unwrap()
    }
}

/// A key-value record of fixed byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair<K, V> {
    /// The key; determines the partition and the collation order.
    pub key: K,
    /// The opaque payload carried alongside the key.
    pub value: V,
}

impl<K: FixedWidth, V: FixedWidth> Pair<K, V> {
    /// Serialized width of one record in bytes.
    pub const WIDTH: usize = K::WIDTH + V::WIDTH;

    /// Creates a record from its parts.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Writes the record into `dst`, which must be exactly [`Self::WIDTH`]
    /// bytes.
    pub fn store(&self, dst: &mut [u8]) {
        self.key.store(&mut dst[..K::WIDTH]);
        self.value.store(&mut dst[K::WIDTH..]);
    }

    /// Reads a record back from `src`, which must be exactly [`Self::WIDTH`]
    /// bytes.
    pub fn load(src: &[u8]) -> Self {
        Self {
            key: K::load(&src[..K::WIDTH]),
            value: V::load(&src[K::WIDTH..]),
        }
    }
}

/// Decodes a byte image of packed records, appending them to `out`.
///
/// The image must contain a whole number of records; partition files are
/// written record-at-a-time, so trailing bytes mean the file was damaged.
pub(crate) fn decode_pairs<K: FixedWidth, V: FixedWidth>(
    bytes: &[u8],
    out: &mut Vec<Pair<K, V>>,
) -> Result<()> {
    let width = Pair::<K, V>::WIDTH;
    let trailing = bytes.len() % width;
    if trailing != 0 {
        return Err(CollateError::TruncatedRecord(trailing));
    }

    out.reserve(bytes.len() / width);
    for chunk in bytes.chunks_exact(width) {
        out.push(Pair::load(chunk));
    }
    Ok(())
}

/// Encodes records into `out`, replacing its contents.
pub(crate) fn encode_pairs<K: FixedWidth, V: FixedWidth>(pairs: &[Pair<K, V>], out: &mut Vec<u8>) {
    let width = Pair::<K, V>::WIDTH;
    out.clear();
    out.resize(pairs.len() * width, 0);
    for (chunk, pair) in out.chunks_exact_mut(width).zip(pairs) {
        pair.store(chunk);
    }
}

/// The key-hashing capability used to assign records to partitions.
///
/// The hash must be pure: equal keys hash equal within one collator run. The
/// low `log2(partition_count)` bits of the hash select the partition.
pub trait KeyHasher<K>: Send + Sync {
    /// Hashes `key` to a non-negative integer.
    fn hash(&self, key: &K) -> u64;
}

/// Hasher for integer keys that uses the key itself as the hash.
///
/// Integer keys produced by upstream stages are already well distributed, so
/// the identity keeps partition assignment deterministic and free.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHasher;

macro_rules! impl_identity_hasher {
    ($($ty:ty),*) => {
        $(
            impl KeyHasher<$ty> for IdentityHasher {
                fn hash(&self, key: &$ty) -> u64 {
                    *key as u64
                }
            }
        )*
    };
}

impl_identity_hasher!(u8, u16, u32, u64, usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_store_load_roundtrip() {
        let pair = Pair::new(0xdead_beef_u32, 42_u64);
        let mut buf = [0u8; 12];
        pair.store(&mut buf);
        assert_eq!(Pair::<u32, u64>::WIDTH, 12);
        assert_eq!(Pair::<u32, u64>::load(&buf), pair);
    }

    #[test]
    fn test_blob_value_roundtrip() {
        let pair = Pair::new(7_u64, *b"opaque!!");
        let mut buf = [0u8; 16];
        pair.store(&mut buf);
        assert_eq!(Pair::<u64, [u8; 8]>::load(&buf), pair);
    }

    #[test]
    fn test_encode_decode_pairs() {
        let pairs: Vec<Pair<u32, u32>> = (0..100).map(|i| Pair::new(i, i * 3)).collect();
        let mut bytes = Vec::new();
        encode_pairs(&pairs, &mut bytes);
        assert_eq!(bytes.len(), 100 * Pair::<u32, u32>::WIDTH);

        let mut decoded = Vec::new();
        decode_pairs(&bytes, &mut decoded).unwrap();
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let pairs = vec![Pair::new(1_u32, 2_u32)];
        let mut bytes = Vec::new();
        encode_pairs(&pairs, &mut bytes);
        bytes.push(0xff);

        let mut decoded: Vec<Pair<u32, u32>> = Vec::new();
        let err = decode_pairs(&bytes, &mut decoded).unwrap_err();
        assert!(matches!(err, CollateError::TruncatedRecord(1)));
    }

    #[test]
    fn test_identity_hasher() {
        let hasher = IdentityHasher;
        assert_eq!(KeyHasher::<u32>::hash(&hasher, &17), 17);
        assert_eq!(KeyHasher::<u64>::hash(&hasher, &u64::MAX), u64::MAX);
    }
}
