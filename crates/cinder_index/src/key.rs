//! Keys and key hashing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Primary key of a stored object: the owning table plus an opaque,
/// variable-length byte key. Borrows the key bytes; a `Key` is a cheap
/// view built at the call site, not an owned value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Key<'a> {
    table_id: u64,
    bytes: &'a [u8],
}

impl<'a> Key<'a> {
    pub fn new(table_id: u64, bytes: &'a [u8]) -> Self {
        Self { table_id, bytes }
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// 64-bit hash over table id and key bytes. The high 16 bits become
    /// the secondary hash stored inline in index entries; the low 48 bits
    /// select a bucket.
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.table_id.hash(&mut hasher);
        self.bytes.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = Key::new(7, b"object-1");
        let b = Key::new(7, b"object-1");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn table_id_participates_in_hash() {
        let a = Key::new(0, b"0");
        let b = Key::new(1, b"0");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn key_bytes_participate_in_hash() {
        let a = Key::new(0, b"0");
        let b = Key::new(0, b"1");
        assert_ne!(a.hash(), b.hash());
    }
}
