//! Hourly totals.
//!
//! One record per hour of the day, keyed 0..=23. Version 1 records carried
//! hits only; version 2 added files, pages, and transfer. Like daily rows,
//! the oldest databases wrote these without a version header.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::node::{NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct HourlyNode {
    /// Hour of the day, 0..=23
    pub hour: u32,
    pub th_hits: u64,
    pub th_files: u64,
    pub th_pages: u64,
    pub th_xfer: u64,
}

impl HourlyNode {
    pub fn new(hour: u32) -> Self {
        Self {
            hour,
            ..Default::default()
        }
    }

    pub fn reset(&mut self, hour: u32) {
        *self = Self::new(hour);
    }
}

impl NodeData for HourlyNode {
    const VERSION: u16 = 2;

    fn data_size(&self) -> usize {
        8 * 4
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.th_hits);
        w.put_u64(self.th_files);
        w.put_u64(self.th_pages);
        w.put_u64(self.th_xfer);
    }

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.th_hits = r.get_u64()?;
        if version >= 2 {
            node.th_files = r.get_u64()?;
            node.th_pages = r.get_u64()?;
            node.th_xfer = r.get_u64()?;
        }
        Ok(node)
    }
}

impl StoreNode for HourlyNode {
    const KIND: NodeKind = NodeKind::Hourly;

    fn node_id(&self) -> u64 {
        self.hour as u64
    }

    fn set_node_id(&mut self, id: u64) {
        self.hour = id as u32;
    }
}
