//! Authenticated-user nodes.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::{BaseNode, NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct UserNode {
    pub base: BaseNode,
    pub hits: u64,
    pub files: u64,
    pub xfer: u64,
    pub visits: u64,
    /// Running average and maximum processing time in milliseconds
    pub avg_time: f64,
    pub max_time: f64,
    pub dirty: bool,
}

impl UserNode {
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

    pub fn update_time(&mut self, proctime: f64) {
        self.avg_time += (proctime - self.avg_time) / self.hits as f64;
        if proctime > self.max_time {
            self.max_time = proctime;
        }
    }
}

impl NodeData for UserNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        self.base.data_size() + 8 * 4 + 8 * 2 + 8
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_u64(self.hits);
        w.put_u64(self.files);
        w.put_u64(self.xfer);
        w.put_u64(self.visits);
        w.put_f64(self.avg_time);
        w.put_f64(self.max_time);
        w.put_u64(hash_str(0, &self.base.key));
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.hits = r.get_u64()?;
        node.files = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.visits = r.get_u64()?;
        node.avg_time = r.get_f64()?;
        node.max_time = r.get_f64()?;
        r.skip(8)?; // value hash
        Ok(node)
    }
}

impl StoreNode for UserNode {
    const KIND: NodeKind = NodeKind::User;

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
    crate::node::skip_base(buf)?.get_u64()
}

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 4 + 8 * 2)?;
    r.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_round_trip() {
        let mut node = UserNode::new("alice");
        node.hits = 9;
        node.files = 6;
        node.xfer = 700;
        node.visits = 2;
        node.avg_time = 5.0;
        node.max_time = 11.0;
        let buf = pack_record(&node);
        let back: UserNode = unpack_record(&buf).unwrap();
        assert_eq!(back.key(), "alice");
        assert_eq!(back.files, 6);
        assert_eq!(back.avg_time, 5.0);
        assert_eq!(field_hits(&buf).unwrap(), 9);
    }
}
