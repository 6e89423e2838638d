//! Daily-seen host records.
//!
//! An auxiliary table of host addresses observed on the current day. Kept
//! for the timestamp backfill performed when upgrading databases written
//! before hosts carried a last-hit timestamp; truncated once the backfill
//! runs.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::{BaseNode, NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct DailyHostNode {
    pub base: BaseNode,
    pub dirty: bool,
}

impl DailyHostNode {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            base: BaseNode::new(key),
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

impl NodeData for DailyHostNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        self.base.data_size() + 8
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_u64(hash_str(0, &self.base.key));
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        r.skip(8)?; // value hash
        Ok(Self {
            base,
            ..Default::default()
        })
    }
}

impl StoreNode for DailyHostNode {
    const KIND: NodeKind = NodeKind::DailyHost;

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

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    crate::node::skip_base(buf)?.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_round_trip() {
        let node = DailyHostNode::new("192.168.1.5");
        let buf = pack_record(&node);
        let back: DailyHostNode = unpack_record(&buf).unwrap();
        assert_eq!(back.key(), "192.168.1.5");
        assert_eq!(field_value_hash(&buf).unwrap(), hash_str(0, "192.168.1.5"));
    }
}
