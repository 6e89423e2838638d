//! Daily totals.
//!
//! One record per day of the month, keyed 1..=31. Alongside the per-day
//! counters each record carries the hourly averages and maxima observed for
//! that day and the number of hours that contributed to them.
//!
//! Record version 2 added the hourly average/maximum block; version 1
//! records predate it and reset those fields on load. Databases older still
//! wrote these rows without any version header at all; see the fix-version
//! path in the migrator.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::node::{NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct DailyNode {
    /// Day of the month, 1..=31
    pub day: u32,
    pub tm_hits: u64,
    pub tm_files: u64,
    pub tm_pages: u64,
    pub tm_hosts: u64,
    pub tm_visits: u64,
    pub tm_xfer: u64,
    pub h_hits_max: u64,
    pub h_files_max: u64,
    pub h_pages_max: u64,
    pub h_xfer_max: u64,
    pub h_visits_max: u64,
    pub h_hosts_max: u64,
    pub h_hits_avg: f64,
    pub h_files_avg: f64,
    pub h_pages_avg: f64,
    pub h_xfer_avg: f64,
    pub h_visits_avg: f64,
    pub h_hosts_avg: f64,
    /// Hours of this day that saw activity; at most 24
    pub td_hours: u16,
}

impl DailyNode {
    pub fn new(day: u32) -> Self {
        Self {
            day,
            ..Default::default()
        }
    }

    pub fn reset(&mut self, day: u32) {
        *self = Self::new(day);
    }
}

impl NodeData for DailyNode {
    const VERSION: u16 = 2;

    fn data_size(&self) -> usize {
        8 * 6 + 8 * 6 + 8 * 6 + 2
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.tm_hits);
        w.put_u64(self.tm_files);
        w.put_u64(self.tm_pages);
        w.put_u64(self.tm_hosts);
        w.put_u64(self.tm_visits);
        w.put_u64(self.tm_xfer);

        w.put_u64(self.h_hits_max);
        w.put_u64(self.h_files_max);
        w.put_u64(self.h_pages_max);
        w.put_u64(self.h_xfer_max);
        w.put_u64(self.h_visits_max);
        w.put_u64(self.h_hosts_max);

        w.put_f64(self.h_hits_avg);
        w.put_f64(self.h_files_avg);
        w.put_f64(self.h_pages_avg);
        w.put_f64(self.h_xfer_avg);
        w.put_f64(self.h_visits_avg);
        w.put_f64(self.h_hosts_avg);

        w.put_u16(self.td_hours);
    }

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.tm_hits = r.get_u64()?;
        node.tm_files = r.get_u64()?;
        node.tm_pages = r.get_u64()?;
        node.tm_hosts = r.get_u64()?;
        node.tm_visits = r.get_u64()?;
        node.tm_xfer = r.get_u64()?;

        if version >= 2 {
            node.h_hits_max = r.get_u64()?;
            node.h_files_max = r.get_u64()?;
            node.h_pages_max = r.get_u64()?;
            node.h_xfer_max = r.get_u64()?;
            node.h_visits_max = r.get_u64()?;
            node.h_hosts_max = r.get_u64()?;

            node.h_hits_avg = r.get_f64()?;
            node.h_files_avg = r.get_f64()?;
            node.h_pages_avg = r.get_f64()?;
            node.h_xfer_avg = r.get_f64()?;
            node.h_visits_avg = r.get_f64()?;
            node.h_hosts_avg = r.get_f64()?;

            node.td_hours = r.get_u16()?;
        }
        Ok(node)
    }
}

impl StoreNode for DailyNode {
    const KIND: NodeKind = NodeKind::Daily;

    fn node_id(&self) -> u64 {
        self.day as u64
    }

    fn set_node_id(&mut self, id: u64) {
        self.day = id as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encoded_size, pack_record, unpack_record, unpack_record_fixver, Writer};

    fn sample() -> DailyNode {
        let mut node = DailyNode::new(15);
        node.tm_hits = 100;
        node.tm_files = 60;
        node.tm_pages = 30;
        node.tm_hosts = 12;
        node.tm_visits = 9;
        node.tm_xfer = 40_960;
        node.h_hits_max = 25;
        node.h_hits_avg = 12.5;
        node.td_hours = 8;
        node
    }

    #[test]
    fn test_round_trip() {
        let node = sample();
        let buf = pack_record(&node);
        assert_eq!(encoded_size(&buf).unwrap(), buf.len());
        let mut back: DailyNode = unpack_record(&buf).unwrap();
        back.day = 15;
        assert_eq!(back.tm_hits, 100);
        assert_eq!(back.h_hits_max, 25);
        assert_eq!(back.h_hits_avg, 12.5);
        assert_eq!(back.td_hours, 8);
    }

    #[test]
    fn test_version_1_resets_hourly_block() {
        let node = sample();
        let mut w = Writer::new();
        w.put_u16(1);
        w.put_u32((8 * 6) as u32);
        w.put_u64(node.tm_hits);
        w.put_u64(node.tm_files);
        w.put_u64(node.tm_pages);
        w.put_u64(node.tm_hosts);
        w.put_u64(node.tm_visits);
        w.put_u64(node.tm_xfer);
        let back: DailyNode = unpack_record(&w.into_vec()).unwrap();
        assert_eq!(back.tm_hits, 100);
        assert_eq!(back.h_hits_max, 0);
        assert_eq!(back.td_hours, 0);
    }

    #[test]
    fn test_headerless_fixver_decode() {
        // Rows written before version bytes existed: payload only.
        let node = sample();
        let mut w = Writer::new();
        w.put_u64(node.tm_hits);
        w.put_u64(node.tm_files);
        w.put_u64(node.tm_pages);
        w.put_u64(node.tm_hosts);
        w.put_u64(node.tm_visits);
        w.put_u64(node.tm_xfer);
        let back: DailyNode = unpack_record_fixver(&w.into_vec()).unwrap();
        assert_eq!(back.tm_hits, 100);
        assert_eq!(back.tm_xfer, 40_960);
    }
}
