//! Chained-bucket hash tables with a swap-out protocol.
//!
//! Each aggregation table keys nodes by a kind-specific fingerprint. The
//! table itself never hashes keys; callers compute the fingerprint with the
//! helpers below and identify nodes with a match predicate, which keeps
//! compound keys (e.g. method + status + URL) out of the table's type.
//!
//! Swap-out bounds memory: a pass walks every bucket, asks the evaluator
//! whether a node may be evicted now, persists evictable nodes through the
//! writer, and drops them from memory. Two flags track the relationship
//! with the database: `cleared` means the table was emptied wholesale (rows
//! may still exist on disk), `swapped_out` means some rows were written and
//! removed since the last clear, so a missed lookup must consult the store
//! before concluding the key is new.

use crate::error::Result;

/// Bucket-count tiers, sized per kind.
pub const SMALL_HASH: usize = 1_024;
pub const MEDIUM_HASH: usize = 16_384;
pub const LARGE_HASH: usize = 1_048_576;

/// Rotate-and-fold fingerprint over one byte.
#[inline]
pub fn hash_byte(hashval: u64, b: u8) -> u64 {
    hashval.rotate_left(5) ^ b as u64
}

/// Fingerprints a byte slice, continuing from a previous value.
pub fn hash_bytes(hashval: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(hashval, |h, &b| hash_byte(h, b))
}

/// Fingerprints a string key.
pub fn hash_str(hashval: u64, s: &str) -> u64 {
    hash_bytes(hashval, s.as_bytes())
}

/// Fingerprints a numeric key.
pub fn hash_num(hashval: u64, num: u64) -> u64 {
    hash_bytes(hashval, &num.to_le_bytes())
}

pub struct HashTable<N> {
    buckets: Vec<Vec<N>>,
    count: usize,
    cleared: bool,
    swapped_out: bool,
}

impl<N> HashTable<N> {
    pub fn new(maxhash: usize) -> Self {
        let mut buckets = Vec::with_capacity(maxhash);
        buckets.resize_with(maxhash, Vec::new);
        Self {
            buckets,
            count: 0,
            cleared: false,
            swapped_out: false,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    pub fn set_cleared(&mut self, value: bool) {
        self.cleared = value;
    }

    pub fn is_swapped_out(&self) -> bool {
        self.swapped_out
    }

    pub fn set_swapped_out(&mut self, value: bool) {
        self.swapped_out = value;
    }

    fn bucket(&self, hashval: u64) -> usize {
        (hashval % self.buckets.len() as u64) as usize
    }

    /// Finds the node matching the predicate in the fingerprint's chain.
    pub fn find<F>(&self, hashval: u64, matches: F) -> Option<&N>
    where
        F: Fn(&N) -> bool,
    {
        self.buckets[self.bucket(hashval)].iter().find(|n| matches(n))
    }

    pub fn find_mut<F>(&mut self, hashval: u64, matches: F) -> Option<&mut N>
    where
        F: Fn(&N) -> bool,
    {
        let index = self.bucket(hashval);
        self.buckets[index].iter_mut().find(|n| matches(n))
    }

    /// Inserts at the head of the fingerprint's chain and returns the node.
    /// The caller is responsible for not inserting duplicate keys.
    pub fn put(&mut self, hashval: u64, node: N) -> &mut N {
        let index = self.bucket(hashval);
        self.buckets[index].insert(0, node);
        self.count += 1;
        &mut self.buckets[index][0]
    }

    /// Unlinks and returns the node matching the predicate.
    pub fn remove<F>(&mut self, hashval: u64, matches: F) -> Option<N>
    where
        F: Fn(&N) -> bool,
    {
        let index = self.bucket(hashval);
        let pos = self.buckets[index].iter().position(|n| matches(n))?;
        self.count -= 1;
        Some(self.buckets[index].remove(pos))
    }

    /// Visits all nodes in bucket-index order.
    pub fn iter(&self) -> impl Iterator<Item = &N> {
        self.buckets.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut N> {
        self.buckets.iter_mut().flatten()
    }

    /// Empties the table and marks it cleared. Rows persisted earlier are
    /// unaffected.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.count = 0;
        self.cleared = true;
    }

    /// One swap-out pass. For each node the evaluator approves, the writer
    /// persists it and the node is dropped from memory. A writer returning
    /// `Ok(false)` stops the pass early and leaves the remaining nodes in
    /// place; an `Err` aborts with the underlying failure.
    ///
    /// Returns whether the pass ran to completion.
    pub fn swap_out<E, W>(&mut self, mut evaluate: E, mut write: W) -> Result<bool>
    where
        E: FnMut(&N) -> bool,
        W: FnMut(&mut N) -> Result<bool>,
    {
        for bucket in &mut self.buckets {
            let mut i = 0;
            while i < bucket.len() {
                if !evaluate(&bucket[i]) {
                    i += 1;
                    continue;
                }
                if !write(&mut bucket[i])? {
                    return Ok(false);
                }
                bucket.swap_remove(i);
                self.count -= 1;
                self.swapped_out = true;
            }
        }
        Ok(true)
    }
}
