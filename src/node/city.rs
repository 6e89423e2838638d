//! City nodes.
//!
//! Identified by a GeoName id and a country code packed into one 64-bit
//! id. A GeoName id of zero marks an unknown city and must carry an empty
//! city name; the country may still be known.

use crate::encoding::{str_size, NodeData, Reader, Writer};
use crate::error::{Error, Result};
use crate::hashtab::hash_num;
use crate::node::{NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct CityNode {
    pub geoname_id: u32,
    pub ccode: String,
    pub city: String,
    pub hits: u64,
    pub files: u64,
    pub pages: u64,
    pub visits: u64,
    pub xfer: u64,
}

impl CityNode {
    pub fn new(geoname_id: u32, city: impl Into<String>, ccode: impl Into<String>) -> Result<Self> {
        let city = city.into();
        let ccode = ccode.into();
        if (geoname_id == 0) != city.is_empty() {
            return Err(Error::InvalidInput(format!(
                "geoname id {geoname_id} does not match city name \"{city}\""
            )));
        }
        Ok(Self {
            geoname_id,
            ccode,
            city,
            ..Default::default()
        })
    }

    /// Packs the country code into the high bits above the GeoName id.
    /// There is enough room to shift whole characters without the 5-bit
    /// packing country ids use.
    pub fn make_nodeid(geoname_id: u32, ccode: &str) -> u64 {
        let bytes = ccode.as_bytes();
        if bytes.is_empty() || bytes[0] == b'*' {
            return geoname_id as u64;
        }
        let c0 = bytes[0] as u64;
        let c1 = bytes.get(1).copied().unwrap_or(0) as u64;
        c0 << 48 | c1 << 32 | geoname_id as u64
    }

    pub fn key_hash(geoname_id: u32, ccode: &str) -> u64 {
        hash_num(0, Self::make_nodeid(geoname_id, ccode))
    }
}

impl NodeData for CityNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        8 * 5 + 4 + str_size(&self.ccode) + str_size(&self.city)
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.hits);
        w.put_u64(self.files);
        w.put_u64(self.pages);
        w.put_u64(self.visits);
        w.put_u64(self.xfer);
        w.put_u32(self.geoname_id);
        w.put_str(&self.ccode);
        w.put_str(&self.city);
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.hits = r.get_u64()?;
        node.files = r.get_u64()?;
        node.pages = r.get_u64()?;
        node.visits = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.geoname_id = r.get_u32()?;
        node.ccode = r.get_str()?;
        node.city = r.get_str()?;
        Ok(node)
    }
}

impl StoreNode for CityNode {
    const KIND: NodeKind = NodeKind::City;

    fn node_id(&self) -> u64 {
        Self::make_nodeid(self.geoname_id, &self.ccode)
    }

    fn set_node_id(&mut self, _id: u64) {
        // the id is derived from the GeoName id and country code
    }
}

pub fn field_visits(buf: &[u8]) -> Result<u64> {
    let mut r = Reader::new(buf);
    r.skip(crate::encoding::NODE_HDR_SIZE + 8 * 3)?;
    r.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_nodeid_packing() {
        let id = CityNode::make_nodeid(4930956, "us");
        assert_eq!(id, (b'u' as u64) << 48 | (b's' as u64) << 32 | 4930956);
        assert_eq!(CityNode::make_nodeid(123, "*"), 123);
        assert_eq!(CityNode::make_nodeid(123, ""), 123);
    }

    #[test]
    fn test_unknown_city_must_be_empty() {
        assert!(CityNode::new(0, "", "us").is_ok());
        assert!(CityNode::new(4930956, "Boston", "us").is_ok());
        assert!(CityNode::new(0, "Boston", "us").is_err());
        assert!(CityNode::new(4930956, "", "us").is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut node = CityNode::new(4930956, "Boston", "us").unwrap();
        node.hits = 12;
        node.visits = 2;
        let buf = pack_record(&node);
        let back: CityNode = unpack_record(&buf).unwrap();
        assert_eq!(back.geoname_id, 4930956);
        assert_eq!(back.city, "Boston");
        assert_eq!(back.ccode, "us");
        assert_eq!(back.node_id(), node.node_id());
        assert_eq!(field_visits(&buf).unwrap(), 2);
    }
}
