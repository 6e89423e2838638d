//! Active visit nodes.
//!
//! A visit is a session in progress: it shares its node id with the owning
//! host, accumulates per-visit counters, and is destroyed on inactivity
//! timeout or at the end of the month, folding its totals into the host.
//! Only open visits exist in the database; ended ones are deleted during
//! save through the ended-visit ledger.
//!
//! Record versions: 2 added the converted flag, 3 replaced epoch timestamps
//! with structured ones.

use crate::encoding::{NodeData, Reader, Writer, TSTAMP_SIZE};
use crate::error::Result;
use crate::node::{NodeKind, StoreNode};
use crate::tstamp::Tstamp;

#[derive(Debug, Clone, Default)]
pub struct VisitNode {
    /// Same id as the owning host
    pub id: u64,
    pub hits: u64,
    pub files: u64,
    pub pages: u64,
    pub xfer: u64,
    /// Whether the visit's first URL was already counted as an entry
    pub entry_seen: bool,
    /// Last URL requested within the visit; zero when none
    pub last_url_id: u64,
    pub start: Tstamp,
    pub last: Tstamp,
    pub robot: bool,
    pub converted: bool,
    /// Key of the last URL, kept so the reference count on the in-memory
    /// URL node can be released; not serialized
    pub last_url_key: String,
    pub dirty: bool,
}

impl VisitNode {
    pub fn new(hostid: u64) -> Self {
        Self {
            id: hostid,
            ..Default::default()
        }
    }

    /// Visit duration in seconds.
    pub fn duration(&self) -> i64 {
        if self.start.is_null() || self.last.is_null() {
            return 0;
        }
        self.last.elapsed(&self.start)
    }
}

impl NodeData for VisitNode {
    const VERSION: u16 = 3;

    fn data_size(&self) -> usize {
        8 * 5 + 3 + TSTAMP_SIZE * 2
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.hits);
        w.put_u64(self.files);
        w.put_u64(self.pages);
        w.put_u64(self.xfer);
        w.put_bool(self.entry_seen);
        w.put_u64(self.last_url_id);
        w.put_bool(self.robot);
        w.put_bool(self.converted);
        w.put_tstamp(&self.start);
        w.put_tstamp(&self.last);
    }

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.hits = r.get_u64()?;
        node.files = r.get_u64()?;
        node.pages = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.entry_seen = r.get_bool()?;
        node.last_url_id = r.get_u64()?;
        node.robot = r.get_bool()?;
        if version >= 2 {
            node.converted = r.get_bool()?;
        }
        if version >= 3 {
            node.start = r.get_tstamp()?;
            node.last = r.get_tstamp()?;
        } else {
            node.start = Tstamp::from_epoch(r.get_u64()? as i64, 0);
            node.last = Tstamp::from_epoch(r.get_u64()? as i64, 0);
        }
        Ok(node)
    }
}

impl StoreNode for VisitNode {
    const KIND: NodeKind = NodeKind::Visit;

    fn node_id(&self) -> u64 {
        self.id
    }

    fn set_node_id(&mut self, id: u64) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encoded_size, pack_record, unpack_record};

    #[test]
    fn test_round_trip() {
        let mut visit = VisitNode::new(9);
        visit.hits = 12;
        visit.files = 8;
        visit.pages = 5;
        visit.xfer = 4096;
        visit.entry_seen = true;
        visit.last_url_id = 31;
        visit.converted = true;
        visit.start = Tstamp::new(2020, 6, 15, 10, 0, 0, 0);
        visit.last = Tstamp::new(2020, 6, 15, 10, 45, 0, 0);

        let buf = pack_record(&visit);
        assert_eq!(encoded_size(&buf).unwrap(), buf.len());

        let mut back: VisitNode = unpack_record(&buf).unwrap();
        back.id = 9; // record key carries the id
        assert_eq!(back.hits, 12);
        assert_eq!(back.last_url_id, 31);
        assert!(back.entry_seen);
        assert!(back.converted);
        assert_eq!(back.duration(), 2700);
    }

    #[test]
    fn test_null_timestamps_duration() {
        let visit = VisitNode::new(1);
        assert_eq!(visit.duration(), 0);
    }
}
