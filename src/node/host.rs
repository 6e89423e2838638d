//! Monthly host nodes.
//!
//! A host aggregates everything one client address (or one grouping pattern)
//! did in the current month. Hosts own their active visit; a host carrying
//! an active visit, a pending group-visit chain, or any download reference
//! is pinned in memory and refused by the swap-out evaluator.
//!
//! Record versions: 2 added the robot flag, 3 the converted-visit count,
//! 4 a numeric last-hit timestamp, 5 the structured timestamp, 6 the city
//! name.

use crate::encoding::{str_size, NodeData, Reader, Writer, TSTAMP_SIZE};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::visit::VisitNode;
use crate::node::{BaseNode, NodeKind, StoreNode};
use crate::tstamp::Tstamp;

#[derive(Debug, Clone, Default)]
pub struct HostNode {
    pub base: BaseNode,
    pub spammer: bool,
    pub robot: bool,
    pub hits: u64,
    pub files: u64,
    pub pages: u64,
    pub xfer: u64,
    pub visits: u64,
    pub visits_conv: u64,
    /// Running average and maximum visit duration in seconds
    pub visit_avg: f64,
    pub visit_max: u64,
    pub max_v_hits: u64,
    pub max_v_files: u64,
    pub max_v_pages: u64,
    pub max_v_xfer: u64,
    pub ccode: [u8; 2],
    pub city: String,
    pub tstamp: Tstamp,

    /// Active visit, if one is open. Owned by the host.
    pub visit: Option<Box<VisitNode>>,
    /// Ended visits parked on a group host until the group totals fold them.
    pub grp_visits: Vec<VisitNode>,
    /// Number of download jobs holding this host; pins the node in memory.
    pub dlref: u64,
    /// Set by unpack when the record's active flag was on; the restore
    /// callback consumes it to load the visit row.
    pub unpacked_active: bool,
    pub dirty: bool,
}

impl HostNode {
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

    pub fn set_ccode(&mut self, ccode: &str) {
        let bytes = ccode.as_bytes();
        self.ccode[0] = bytes.first().copied().unwrap_or(0);
        self.ccode[1] = bytes.get(1).copied().unwrap_or(0);
    }

    pub fn ccode_str(&self) -> &str {
        if self.ccode[0] == 0 {
            return "";
        }
        std::str::from_utf8(&self.ccode).unwrap_or("")
    }

    /// True when nothing pins the node and swap-out may take it.
    pub fn evictable(&self) -> bool {
        self.visit.is_none() && self.grp_visits.is_empty() && self.dlref == 0
    }
}

impl NodeData for HostNode {
    const VERSION: u16 = 6;

    fn data_size(&self) -> usize {
        self.base.data_size()
            + 3                       // spammer, active, robot
            + 8 * 12                  // counters, maxima, value hash, visits_conv
            + 8                       // visit_avg
            + 2                       // country code
            + TSTAMP_SIZE
            + str_size(&self.city)
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_bool(self.spammer);
        w.put_u64(self.hits);
        w.put_u64(self.files);
        w.put_u64(self.pages);
        w.put_u64(self.xfer);
        w.put_u64(self.visits);
        w.put_f64(self.visit_avg);
        w.put_u64(self.visit_max);
        w.put_u64(self.max_v_hits);
        w.put_u64(self.max_v_files);
        w.put_u64(self.max_v_pages);
        w.put_u64(self.max_v_xfer);
        w.put_bool(self.visit.is_some());
        w.put_u64(hash_str(0, &self.base.key));
        w.put_bytes(&self.ccode);
        w.put_bool(self.robot);
        w.put_u64(self.visits_conv);
        w.put_tstamp(&self.tstamp);
        w.put_str(&self.city);
    }

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.spammer = r.get_bool()?;
        node.hits = r.get_u64()?;
        node.files = r.get_u64()?;
        node.pages = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.visits = r.get_u64()?;
        node.visit_avg = r.get_f64()?;
        node.visit_max = r.get_u64()?;
        node.max_v_hits = r.get_u64()?;
        node.max_v_files = r.get_u64()?;
        node.max_v_pages = r.get_u64()?;
        node.max_v_xfer = r.get_u64()?;
        let active = r.get_bool()?;
        r.skip(8)?; // value hash
        let cc = [r.get_u8()?, r.get_u8()?];
        node.ccode = cc;

        if version >= 2 {
            node.robot = r.get_bool()?;
        }
        if version >= 3 {
            node.visits_conv = r.get_u64()?;
        }
        if version >= 5 {
            node.tstamp = r.get_tstamp()?;
        } else if version >= 4 {
            node.tstamp = Tstamp::from_epoch(r.get_u64()? as i64, 0);
        }
        if version >= 6 {
            node.city = r.get_str()?;
        }

        // the caller resolves the active visit from this flag
        node.unpacked_active = active;
        Ok(node)
    }
}

impl StoreNode for HostNode {
    const KIND: NodeKind = NodeKind::Host;

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

/// Offset reader for the hits field of an encoded host record.
pub fn field_hits(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(1)?; // spammer
    r.get_u64()
}

/// Offset reader for the xfer field of an encoded host record.
pub fn field_xfer(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(1 + 8 * 3)?; // spammer, hits, files, pages
    r.get_u64()
}

/// Offset reader for the value hash of an encoded host record.
pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(1 + 8 * 4 + 8 + 8 + 8 + 8 * 4 + 1)?;
    r.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encoded_size, pack_record, unpack_record};
    use crate::node::NodeFlag;

    fn sample() -> HostNode {
        let mut node = HostNode::new("10.0.0.1");
        node.base.id = 17;
        node.hits = 120;
        node.files = 80;
        node.pages = 40;
        node.xfer = 1_048_576;
        node.visits = 3;
        node.visits_conv = 1;
        node.visit_avg = 95.5;
        node.visit_max = 300;
        node.max_v_hits = 60;
        node.max_v_files = 40;
        node.max_v_pages = 20;
        node.max_v_xfer = 524_288;
        node.robot = false;
        node.spammer = true;
        node.set_ccode("us");
        node.city = "Boston".to_string();
        node.tstamp = Tstamp::new(2020, 6, 15, 10, 30, 0, 0);
        node
    }

    #[test]
    fn test_round_trip() {
        let node = sample();
        let buf = pack_record(&node);
        assert_eq!(encoded_size(&buf).unwrap(), buf.len());

        let back: HostNode = unpack_record(&buf).unwrap();
        assert_eq!(back.base.key, "10.0.0.1");
        assert_eq!(back.base.flag, NodeFlag::Regular);
        assert_eq!(back.hits, 120);
        assert_eq!(back.xfer, 1_048_576);
        assert_eq!(back.visits_conv, 1);
        assert_eq!(back.visit_max, 300);
        assert!(back.spammer);
        assert_eq!(back.ccode_str(), "us");
        assert_eq!(back.city, "Boston");
        assert_eq!(back.tstamp, Tstamp::new(2020, 6, 15, 10, 30, 0, 0));
        assert!(!back.unpacked_active);
    }

    #[test]
    fn test_active_flag_survives_encoding() {
        let mut node = sample();
        node.visit = Some(Box::new(VisitNode::new(node.base.id)));
        let buf = pack_record(&node);
        let back: HostNode = unpack_record(&buf).unwrap();
        assert!(back.unpacked_active);
        assert!(back.visit.is_none());
    }

    #[test]
    fn test_field_offsets() {
        let buf = pack_record(&sample());
        assert_eq!(field_hits(&buf).unwrap(), 120);
        assert_eq!(field_xfer(&buf).unwrap(), 1_048_576);
        assert_eq!(field_value_hash(&buf).unwrap(), hash_str(0, "10.0.0.1"));
    }

    #[test]
    fn test_evictable_pins() {
        let mut node = sample();
        assert!(node.evictable());
        node.dlref = 1;
        assert!(!node.evictable());
        node.dlref = 0;
        node.visit = Some(Box::new(VisitNode::new(node.base.id)));
        assert!(!node.evictable());
    }
}
