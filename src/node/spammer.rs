//! Spammer set.
//!
//! In-memory only: spammer classification is persisted as a flag on the
//! host nodes, and this table is repopulated from those flags as hosts are
//! restored or unpacked.

use crate::hashtab::{hash_str, HashTable, SMALL_HASH};

#[derive(Debug, Clone)]
pub struct SpammerNode {
    pub key: String,
}

pub struct SpammerTable {
    table: HashTable<SpammerNode>,
}

impl SpammerTable {
    pub fn new() -> Self {
        Self {
            table: HashTable::new(SMALL_HASH),
        }
    }

    pub fn insert(&mut self, host: &str) {
        let hashval = hash_str(0, host);
        if self.table.find(hashval, |n| n.key == host).is_none() {
            self.table.put(
                hashval,
                SpammerNode {
                    key: host.to_string(),
                },
            );
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.table
            .find(hash_str(0, host), |n| n.key == host)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}

impl Default for SpammerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut spammers = SpammerTable::new();
        spammers.insert("10.0.0.9");
        spammers.insert("10.0.0.9");
        assert_eq!(spammers.len(), 1);
        assert!(spammers.contains("10.0.0.9"));
        assert!(!spammers.contains("10.0.0.8"));
    }
}
