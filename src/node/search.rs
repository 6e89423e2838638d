//! Search-string nodes.
//!
//! The key is a packed sequence of length-prefixed parts alternating term
//! type and term text, e.g. a phrase search for "logtally css" restricted
//! to any file type packs as:
//!
//! ```text
//! [6]Phrase[12]logtally css[9]File Type[3]any
//! ```
//!
//! A type length of zero means the engine could not classify the part. The
//! term count is stored alongside and must stay consistent with the packed
//! representation.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::{BaseNode, NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct SearchNode {
    pub base: BaseNode,
    pub termcnt: u16,
    pub hits: u64,
    pub visits: u64,
    pub dirty: bool,
}

impl SearchNode {
    pub fn new(key: impl Into<String>, termcnt: u16) -> Self {
        Self {
            base: BaseNode::new(key),
            termcnt,
            ..Default::default()
        }
    }

    pub fn key(&self) -> &str {
        &self.base.key
    }

    pub fn key_hash(key: &str) -> u64 {
        hash_str(0, key)
    }

    /// Packs (type, term) pairs into the key representation.
    pub fn pack_terms<'a>(terms: impl IntoIterator<Item = (&'a str, &'a str)>) -> (String, u16) {
        let mut packed = String::new();
        let mut count = 0u16;
        for (srchtype, term) in terms {
            packed.push_str(&format!("[{}]{}", srchtype.len(), srchtype));
            packed.push_str(&format!("[{}]{}", term.len(), term));
            count += 1;
        }
        (packed, count)
    }
}

impl NodeData for SearchNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        self.base.data_size() + 2 + 8 * 3
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_u16(self.termcnt);
        w.put_u64(self.hits);
        w.put_u64(self.visits);
        w.put_u64(hash_str(0, &self.base.key));
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.termcnt = r.get_u16()?;
        node.hits = r.get_u64()?;
        node.visits = r.get_u64()?;
        r.skip(8)?; // value hash
        Ok(node)
    }
}

impl StoreNode for SearchNode {
    const KIND: NodeKind = NodeKind::Search;

    fn node_id(&self) -> u64 {
        self.base.id
    }

    fn set_node_id(&mut self, id: u64) {
        self.base.id = id;
    }

    fn value_hash(&self) -> u64 {
        hash_str(0, &self.base.key)
    }
}

pub fn field_hits(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(2)?; // termcnt
    r.get_u64()
}

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(2 + 8 * 2)?;
    r.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_pack_terms() {
        let (packed, count) =
            SearchNode::pack_terms([("Phrase", "logtally css"), ("File Type", "any")]);
        assert_eq!(packed, "[6]Phrase[12]logtally css[9]File Type[3]any");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_round_trip() {
        let (packed, count) = SearchNode::pack_terms([("", "error logs")]);
        let mut node = SearchNode::new(packed.clone(), count);
        node.hits = 4;
        node.visits = 1;
        let buf = pack_record(&node);
        let back: SearchNode = unpack_record(&buf).unwrap();
        assert_eq!(back.key(), packed);
        assert_eq!(back.termcnt, 1);
        assert_eq!(back.hits, 4);
        assert_eq!(field_hits(&buf).unwrap(), 4);
    }
}
