//! HTTP status-code counters.
//!
//! The table is populated from the localized status-code list at init and
//! kept in ascending order, with index 0 reserved for unrecognized codes.
//! A per-class index records where each class (1xx..5xx) starts so lookup
//! scans only the class's slice.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::Result;
use crate::node::{NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct StatusCodeNode {
    /// Position in the table; doubles as the record id
    pub index: u32,
    pub code: u16,
    pub count: u64,
}

impl StatusCodeNode {
    pub fn new(code: u16) -> Self {
        Self {
            index: 0,
            code,
            count: 0,
        }
    }
}

impl NodeData for StatusCodeNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        8 + 2
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.count);
        w.put_u16(self.code);
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.count = r.get_u64()?;
        node.code = r.get_u16()?;
        Ok(node)
    }
}

impl StoreNode for StatusCodeNode {
    const KIND: NodeKind = NodeKind::StatusCode;

    fn node_id(&self) -> u64 {
        self.index as u64
    }

    fn set_node_id(&mut self, id: u64) {
        self.index = id as u32;
    }
}

/// Ascending status-code table with O(1) class starts.
#[derive(Debug, Default)]
pub struct StatusCodeTable {
    codes: Vec<StatusCodeNode>,
    clsindex: [usize; 6],
}

impl StatusCodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            codes: Vec::new(),
            clsindex: [0; 6],
        };
        // slot 0 catches codes the localized list does not know
        table.codes.push(StatusCodeNode::new(0));
        table
    }

    /// Appends a code. Codes must arrive in ascending order; out-of-order
    /// or out-of-class codes are dropped.
    pub fn add_status_code(&mut self, code: u16) {
        let cls = (code / 100) as usize;
        if !(1..=5).contains(&cls) {
            return;
        }
        if let Some(last) = self.codes.last() {
            if last.code != 0 && code <= last.code {
                return;
            }
        }
        if self.clsindex[cls] == 0 {
            self.clsindex[cls] = self.codes.len();
        }
        let mut node = StatusCodeNode::new(code);
        node.index = self.codes.len() as u32;
        self.codes.push(node);
    }

    /// Finds the counter for a code, falling back to the unknown slot.
    pub fn get_mut(&mut self, code: u16) -> &mut StatusCodeNode {
        let cls = (code / 100) as usize;
        if !(1..=5).contains(&cls) || self.clsindex[cls] == 0 {
            return &mut self.codes[0];
        }
        let mut found = 0;
        for index in self.clsindex[cls]..self.codes.len() {
            if self.codes[index].code == code {
                found = index;
                break;
            }
            // codes are sorted
            if code < self.codes[index].code {
                break;
            }
        }
        &mut self.codes[found]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatusCodeNode> {
        self.codes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StatusCodeNode> {
        self.codes.iter_mut()
    }

    pub fn get_by_index(&self, index: usize) -> Option<&StatusCodeNode> {
        self.codes.get(index)
    }

    pub fn get_by_index_mut(&mut self, index: usize) -> Option<&mut StatusCodeNode> {
        self.codes.get_mut(index)
    }

    pub fn reset_counts(&mut self) {
        for node in &mut self.codes {
            node.count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StatusCodeTable {
        let mut table = StatusCodeTable::new();
        for code in [200, 206, 301, 302, 304, 404, 410, 500, 503] {
            table.add_status_code(code);
        }
        table
    }

    #[test]
    fn test_class_lookup() {
        let mut table = table();
        table.get_mut(404).count += 1;
        table.get_mut(404).count += 1;
        table.get_mut(200).count += 1;
        assert_eq!(table.get_mut(404).count, 2);
        assert_eq!(table.get_mut(200).count, 1);
        assert_eq!(table.get_mut(503).count, 0);
    }

    #[test]
    fn test_unknown_codes_fall_back() {
        let mut table = table();
        table.get_mut(418).count += 1; // in class, not in list
        table.get_mut(999).count += 1; // no such class
        assert_eq!(table.codes[0].count, 2);
    }

    #[test]
    fn test_out_of_order_codes_dropped() {
        let mut table = table();
        let before = table.len();
        table.add_status_code(301);
        assert_eq!(table.len(), before);
    }

    #[test]
    fn test_codes_ascending() {
        let table = table();
        let codes: Vec<u16> = table.iter().skip(1).map(|n| n.code).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        assert_eq!(codes, sorted);
    }
}
