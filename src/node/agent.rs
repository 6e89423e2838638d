//! User-agent nodes.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::{BaseNode, NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct AgentNode {
    pub base: BaseNode,
    pub hits: u64,
    pub xfer: u64,
    pub visits: u64,
    pub robot: bool,
    pub dirty: bool,
}

impl AgentNode {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            base: BaseNode::new(key),
            ..Default::default()
        }
    }

    pub fn group(key: impl Into<String>) -> Self {
        Self {
            base: BaseNode::group(key),
            ..Default::default()
        }
    }

    pub fn key(&self) -> &str {
        &self.base.key
    }

    pub fn key_hash(key: &str) -> u64 {
        hash_str(0, key)
    }
}

impl NodeData for AgentNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        self.base.data_size() + 8 * 4 + 1
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_u64(self.hits);
        w.put_u64(self.xfer);
        w.put_u64(self.visits);
        w.put_bool(self.robot);
        w.put_u64(hash_str(0, &self.base.key));
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.hits = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.visits = r.get_u64()?;
        node.robot = r.get_bool()?;
        r.skip(8)?; // value hash
        Ok(node)
    }
}

impl StoreNode for AgentNode {
    const KIND: NodeKind = NodeKind::Agent;

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

pub fn field_visits(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 2)?;
    r.get_u64()
}

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 3 + 1)?;
    r.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_round_trip() {
        let mut node = AgentNode::new("Mozilla/5.0 (X11; Linux x86_64)");
        node.hits = 15;
        node.xfer = 9_000;
        node.visits = 2;
        node.robot = true;
        let buf = pack_record(&node);
        let back: AgentNode = unpack_record(&buf).unwrap();
        assert_eq!(back.key(), "Mozilla/5.0 (X11; Linux x86_64)");
        assert_eq!(back.visits, 2);
        assert!(back.robot);
        assert_eq!(field_visits(&buf).unwrap(), 2);
    }
}
