//! Country nodes.
//!
//! Identified by the two-letter code packed into 5-bit slots of the node
//! id. The packing only represents lowercase letters; codes are normalized
//! lowercase upstream. Display names come from the localized country list
//! at init and are never persisted.

use crate::encoding::{str_size, NodeData, Reader, Writer};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::{NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct CountryNode {
    pub ccode: String,
    /// Display name from the language table; runtime only
    pub cdesc: String,
    pub hits: u64,
    pub files: u64,
    pub pages: u64,
    pub visits: u64,
    pub xfer: u64,
}

impl CountryNode {
    pub fn new(ccode: impl Into<String>, cdesc: impl Into<String>) -> Self {
        Self {
            ccode: ccode.into(),
            cdesc: cdesc.into(),
            ..Default::default()
        }
    }

    /// Packs a lowercase country code into 5-bit slots of a 64-bit id.
    /// The unknown code ("*" or empty) packs to zero.
    pub fn ctry_idx(ccode: &str) -> u64 {
        let mut idx = 0u64;
        for b in ccode.bytes() {
            if !b.is_ascii_lowercase() {
                return 0;
            }
            idx = idx << 5 | (b - b'a' + 1) as u64;
        }
        idx
    }

    pub fn key_hash(ccode: &str) -> u64 {
        hash_str(0, ccode)
    }

    pub fn any_activity(&self) -> bool {
        self.hits != 0 || self.visits != 0
    }

    pub fn reset(&mut self) {
        self.hits = 0;
        self.files = 0;
        self.pages = 0;
        self.visits = 0;
        self.xfer = 0;
    }

    /// Folds counters restored from the database into this entry.
    pub fn update(&mut self, other: &CountryNode) {
        self.hits = other.hits;
        self.files = other.files;
        self.pages = other.pages;
        self.visits = other.visits;
        self.xfer = other.xfer;
    }
}

impl NodeData for CountryNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        8 * 5 + str_size(&self.ccode)
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.hits);
        w.put_u64(self.files);
        w.put_u64(self.pages);
        w.put_u64(self.visits);
        w.put_u64(self.xfer);
        w.put_str(&self.ccode);
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.hits = r.get_u64()?;
        node.files = r.get_u64()?;
        node.pages = r.get_u64()?;
        node.visits = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.ccode = r.get_str()?;
        Ok(node)
    }
}

impl StoreNode for CountryNode {
    const KIND: NodeKind = NodeKind::Country;

    fn node_id(&self) -> u64 {
        Self::ctry_idx(&self.ccode)
    }

    fn set_node_id(&mut self, _id: u64) {
        // the id is derived from the country code
    }
}

/// Offset reader for the visits field of an encoded country record.
pub fn field_visits(buf: &[u8]) -> Result<u64> {
    let mut r = Reader::new(buf);
    r.skip(crate::encoding::NODE_HDR_SIZE + 8 * 3)?;
    r.get_u64()
}

/// The country aggregation table, populated from the localized country
/// list at init. Codes outside the list accumulate under the unknown
/// entry, keyed "*".
pub struct CountryTable {
    table: crate::hashtab::HashTable<CountryNode>,
}

impl CountryTable {
    pub fn new() -> Self {
        let mut countries = Self {
            table: crate::hashtab::HashTable::new(crate::hashtab::SMALL_HASH),
        };
        countries.put_ccnode("*", "Unresolved/Unknown");
        countries
    }

    pub fn put_ccnode(&mut self, ccode: &str, cdesc: &str) {
        let hashval = CountryNode::key_hash(ccode);
        if self.table.find(hashval, |n| n.ccode == ccode).is_none() {
            self.table.put(hashval, CountryNode::new(ccode, cdesc));
        }
    }

    /// Counter entry for a code, falling back to the unknown entry.
    pub fn get_mut(&mut self, ccode: &str) -> &mut CountryNode {
        let hashval = CountryNode::key_hash(ccode);
        let known = self.table.find(hashval, |n| n.ccode == ccode).is_some();
        let key = if known { ccode } else { "*" };
        let hashval = CountryNode::key_hash(key);
        self.table
            .find_mut(hashval, |n| n.ccode == key)
            .expect("the unknown country entry always exists")
    }

    /// Folds a restored record into the matching entry.
    pub fn update_ccnode(&mut self, node: &CountryNode) {
        self.get_mut(&node.ccode).update(node);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CountryNode> {
        self.table.iter()
    }

    pub fn reset(&mut self) {
        for node in self.table.iter_mut() {
            node.reset();
        }
    }
}

impl Default for CountryTable {
    fn default() -> Self {
        Self::new()
    }
}
