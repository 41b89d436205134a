//! Cache-line-structured hash table.
//!
//! Each bucket is a chain of 64-byte cache lines holding eight packed
//! 64-bit entries. An entry is either empty, a (secondary hash, reference)
//! pair, or, in the last slot of a line only, a chain link to an overflow
//! line. References are 47-bit opaque handles owned by the object store;
//! the index never dereferences them and instead asks a `KeyComparer`
//! whether a candidate reference carries the probed key.

use crate::error::{Error, Result};
use crate::key::Key;

/// Packed entries per 64-byte cache line.
pub const ENTRIES_PER_CACHE_LINE: usize = 8;

const LAST_SLOT: usize = ENTRIES_PER_CACHE_LINE - 1;
const REFERENCE_MASK: u64 = (1 << 47) - 1;
const CHAIN_FLAG: u64 = 1 << 47;
const HASH_SHIFT: u32 = 48;
const BUCKET_HASH_MASK: u64 = (1 << 48) - 1;

/// Opaque handle to an object in the log-structured store. Must fit in
/// 47 bits so it packs into an index entry alongside the secondary hash
/// and the chain tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reference(u64);

impl Reference {
    pub fn new(value: u64) -> Result<Self> {
        if value & !REFERENCE_MASK != 0 {
            return Err(Error::OutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Decides whether the object behind a candidate reference carries the
/// probed key. Supplied by the store that owns the referenced objects.
pub trait KeyComparer {
    fn matches(&self, key: &Key<'_>, candidate: Reference) -> bool;
}

/// One 64-bit table word. All-zero means empty; the tag bit at position 47
/// distinguishes chain links from data.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct PackedEntry(u64);

struct UnpackedEntry {
    hash: u16,
    chain: bool,
    ptr: u64,
}

impl PackedEntry {
    fn pack(hash: u16, chain: bool, ptr: u64) -> Result<Self> {
        if ptr & !REFERENCE_MASK != 0 {
            return Err(Error::OutOfRange(ptr));
        }
        let chain_bit = if chain { CHAIN_FLAG } else { 0 };
        Ok(Self((u64::from(hash) << HASH_SHIFT) | chain_bit | ptr))
    }

    fn unpack(self) -> UnpackedEntry {
        UnpackedEntry {
            hash: (self.0 >> HASH_SHIFT) as u16,
            chain: self.0 & CHAIN_FLAG != 0,
            ptr: self.0 & REFERENCE_MASK,
        }
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn is_available(self) -> bool {
        self.0 == 0
    }

    fn is_chain(self) -> bool {
        self.0 & CHAIN_FLAG != 0
    }

    fn set_reference(&mut self, hash: u16, reference: Reference) {
        // Reference construction already enforced the 47-bit limit.
        self.0 = (u64::from(hash) << HASH_SHIFT) | reference.0;
    }

    fn set_chain(&mut self, overflow_index: usize) -> Result<()> {
        *self = Self::pack(0, true, overflow_index as u64)?;
        Ok(())
    }

    fn reference(self) -> Reference {
        debug_assert!(!self.is_chain());
        Reference(self.0 & REFERENCE_MASK)
    }

    /// Index of the overflow line this entry links to, if it is a chain.
    fn chain_index(self) -> Option<usize> {
        let unpacked = self.unpack();
        unpacked.chain.then_some(unpacked.ptr as usize)
    }

    fn hash_matches(self, hash: u16) -> bool {
        !self.is_available() && !self.is_chain() && (self.0 >> HASH_SHIFT) as u16 == hash
    }
}

#[repr(C, align(64))]
#[derive(Clone, Copy, Default)]
struct CacheLine {
    entries: [PackedEntry; ENTRIES_PER_CACHE_LINE],
}

/// Position of a cache line: a bucket head or an overflow line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Loc {
    Bucket(usize),
    Overflow(usize),
}

/// Instrumentation counters, cumulative since construction or the last
/// `reset_perf_counters`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfCounters {
    /// Probes through `lookup`, `replace`, and `remove`.
    pub lookup_calls: u64,
    /// Chain links crossed while probing.
    pub lookup_chains_followed: u64,
    /// Secondary hash matched but the full key did not.
    pub lookup_collisions: u64,
    pub replace_calls: u64,
    /// Chain links crossed while scanning for a free slot.
    pub insert_chains_followed: u64,
}

/// Open-addressed hash table mapping keys to 47-bit references.
///
/// Not internally synchronized; callers serialize access externally.
pub struct HashTable<C> {
    buckets: Vec<CacheLine>,
    overflow: Vec<CacheLine>,
    comparer: C,
    perf: PerfCounters,
}

impl<C: KeyComparer> HashTable<C> {
    /// Create a table with `num_buckets` rounded down to a power of two
    /// (minimum 1).
    pub fn new(num_buckets: usize, comparer: C) -> Self {
        let rounded = if num_buckets <= 1 {
            1
        } else {
            1 << (usize::BITS - 1 - num_buckets.leading_zeros())
        };
        Self {
            buckets: vec![CacheLine::default(); rounded],
            overflow: Vec::new(),
            comparer,
            perf: PerfCounters::default(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn perf_counters(&self) -> PerfCounters {
        self.perf
    }

    pub fn reset_perf_counters(&mut self) {
        self.perf = PerfCounters::default();
    }

    /// Find the reference stored under `key`, if any.
    pub fn lookup(&mut self, key: &Key<'_>) -> Option<Reference> {
        let (bucket, secondary) = self.index_for(key);
        self.find_entry(bucket, secondary, key)
            .map(|(loc, slot)| self.line(loc).entries[slot].reference())
    }

    /// Insert `reference` under `key`, overwriting any existing mapping.
    /// Returns true when an existing entry was replaced.
    pub fn replace(&mut self, key: &Key<'_>, reference: Reference) -> bool {
        let (bucket, secondary) = self.index_for(key);
        self.perf.replace_calls += 1;

        if let Some((loc, slot)) = self.find_entry(bucket, secondary, key) {
            self.line_mut(loc).entries[slot].set_reference(secondary, reference);
            return true;
        }

        // No existing entry: take the first empty slot along the chain.
        let mut loc = Loc::Bucket(bucket);
        loop {
            let line = *self.line(loc);
            for slot in 0..ENTRIES_PER_CACHE_LINE {
                if line.entries[slot].is_available() {
                    self.line_mut(loc).entries[slot].set_reference(secondary, reference);
                    return false;
                }
            }
            match line.entries[LAST_SLOT].chain_index() {
                Some(next) => {
                    self.perf.insert_chains_followed += 1;
                    loc = Loc::Overflow(next);
                }
                None => break,
            }
        }

        // The terminal line is full of data. Displace its last entry into a
        // fresh overflow line together with the new entry, and turn the old
        // last slot into a chain link.
        let displaced = self.line(loc).entries[LAST_SLOT];
        let overflow_index = self.overflow.len();
        let mut line = CacheLine::default();
        line.entries[0] = displaced;
        line.entries[1].set_reference(secondary, reference);
        self.overflow.push(line);
        // Overflow indices share the 47-bit field with references; a table
        // would need 2^47 overflow lines to exhaust it.
        self.line_mut(loc).entries[LAST_SLOT]
            .set_chain(overflow_index)
            .unwrap_or_else(|_| unreachable!("overflow arena outgrew the 47-bit index field"));
        false
    }

    /// Remove the mapping for `key`. Freed slots are left in place; chains
    /// are never compacted.
    pub fn remove(&mut self, key: &Key<'_>) -> bool {
        let (bucket, secondary) = self.index_for(key);
        match self.find_entry(bucket, secondary, key) {
            Some((loc, slot)) => {
                self.line_mut(loc).entries[slot].clear();
                true
            }
            None => false,
        }
    }

    /// Visit every stored reference exactly once. Returns the number of
    /// callback invocations. Order is unspecified but deterministic for a
    /// given table state.
    pub fn for_each<F: FnMut(Reference)>(&self, mut callback: F) -> u64 {
        let mut invoked = 0;
        for bucket in 0..self.buckets.len() {
            let mut loc = Loc::Bucket(bucket);
            loop {
                let line = self.line(loc);
                for entry in &line.entries {
                    if !entry.is_available() && !entry.is_chain() {
                        callback(entry.reference());
                        invoked += 1;
                    }
                }
                match line.entries[LAST_SLOT].chain_index() {
                    Some(next) => loc = Loc::Overflow(next),
                    None => break,
                }
            }
        }
        invoked
    }

    /// Bucket index and secondary hash for a key. The low 48 hash bits pick
    /// the bucket; the high 16 bits are stored inline in entries.
    fn index_for(&self, key: &Key<'_>) -> (usize, u16) {
        let hash = key.hash();
        let bucket = ((hash & BUCKET_HASH_MASK) % self.buckets.len() as u64) as usize;
        (bucket, (hash >> HASH_SHIFT) as u16)
    }

    fn line(&self, loc: Loc) -> &CacheLine {
        match loc {
            Loc::Bucket(i) => &self.buckets[i],
            Loc::Overflow(i) => &self.overflow[i],
        }
    }

    fn line_mut(&mut self, loc: Loc) -> &mut CacheLine {
        match loc {
            Loc::Bucket(i) => &mut self.buckets[i],
            Loc::Overflow(i) => &mut self.overflow[i],
        }
    }

    /// Walk the bucket's chain for an entry whose secondary hash and full
    /// key both match. A secondary-hash match that fails full comparison is
    /// counted as a collision.
    fn find_entry(&mut self, bucket: usize, secondary: u16, key: &Key<'_>) -> Option<(Loc, usize)> {
        self.perf.lookup_calls += 1;
        let mut loc = Loc::Bucket(bucket);
        loop {
            let line = *self.line(loc);
            for slot in 0..ENTRIES_PER_CACHE_LINE {
                let entry = line.entries[slot];
                if !entry.hash_matches(secondary) {
                    continue;
                }
                if self.comparer.matches(key, entry.reference()) {
                    return Some((loc, slot));
                }
                self.perf.lookup_collisions += 1;
            }
            match line.entries[LAST_SLOT].chain_index() {
                Some(next) => {
                    self.perf.lookup_chains_followed += 1;
                    loc = Loc::Overflow(next);
                }
                None => return None,
            }
        }
    }
}
