//! URL nodes.
//!
//! Keyed by the request path. A URL referenced as the last URL of any open
//! visit carries a non-zero visit refcount and is pinned against swap-out.
//!
//! Record version 2 added the scheme classification and the hex-encoded
//! flag.

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::{Error, Result};
use crate::hashtab::hash_str;
use crate::node::{BaseNode, NodeKind, StoreNode};

/// Scheme classification observed for a URL across the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlType {
    #[default]
    Other,
    Http,
    Https,
    /// Requested over both http and https
    Mixed,
}

impl UrlType {
    pub fn as_u8(self) -> u8 {
        match self {
            UrlType::Other => 0,
            UrlType::Http => 1,
            UrlType::Https => 2,
            UrlType::Mixed => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(UrlType::Other),
            1 => Ok(UrlType::Http),
            2 => Ok(UrlType::Https),
            3 => Ok(UrlType::Mixed),
            other => Err(Error::InvalidData(format!("unknown url type {other}"))),
        }
    }

    /// Folds another observation into the classification.
    pub fn combine(self, other: UrlType) -> UrlType {
        match (self, other) {
            (UrlType::Other, t) => t,
            (t, UrlType::Other) => t,
            (a, b) if a == b => a,
            _ => UrlType::Mixed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlNode {
    pub base: BaseNode,
    pub hits: u64,
    pub xfer: u64,
    /// Times this URL opened a visit
    pub entry: u64,
    /// Times this URL closed a visit
    pub exit: u64,
    /// Running average and maximum processing time in milliseconds
    pub avg_time: f64,
    pub max_time: f64,
    pub pathlen: u16,
    /// Configured conversion target
    pub target: bool,
    pub url_type: UrlType,
    pub hexenc: bool,

    /// Open visits whose last URL is this node; pins it in memory.
    pub vstref: u64,
    pub dirty: bool,
}

impl UrlNode {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let pathlen = key.find('?').unwrap_or(key.len()) as u16;
        let hexenc = key.contains('%');
        Self {
            base: BaseNode::new(key),
            pathlen,
            hexenc,
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

    pub fn evictable(&self) -> bool {
        self.vstref == 0
    }

    /// Updates the running average processing time for one more request.
    pub fn update_time(&mut self, proctime: f64) {
        self.avg_time += (proctime - self.avg_time) / self.hits as f64;
        if proctime > self.max_time {
            self.max_time = proctime;
        }
    }
}

impl NodeData for UrlNode {
    const VERSION: u16 = 2;

    fn data_size(&self) -> usize {
        self.base.data_size()
            + 8 * 4                   // hits, xfer, entry, exit
            + 8 * 2                   // avg_time, max_time
            + 8                       // value hash
            + 2                       // pathlen
            + 1                       // target
            + 2                       // url_type, hexenc
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_u64(self.hits);
        w.put_u64(self.xfer);
        w.put_u64(self.entry);
        w.put_u64(self.exit);
        w.put_f64(self.avg_time);
        w.put_f64(self.max_time);
        w.put_u64(hash_str(0, &self.base.key));
        w.put_u16(self.pathlen);
        w.put_bool(self.target);
        w.put_u8(self.url_type.as_u8());
        w.put_bool(self.hexenc);
    }

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.hits = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.entry = r.get_u64()?;
        node.exit = r.get_u64()?;
        node.avg_time = r.get_f64()?;
        node.max_time = r.get_f64()?;
        r.skip(8)?; // value hash
        node.pathlen = r.get_u16()?;
        node.target = r.get_bool()?;
        if version >= 2 {
            node.url_type = UrlType::from_u8(r.get_u8()?)?;
            node.hexenc = r.get_bool()?;
        }
        Ok(node)
    }
}

impl StoreNode for UrlNode {
    const KIND: NodeKind = NodeKind::Url;

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

pub fn field_xfer(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8)?;
    r.get_u64()
}

pub fn field_entry(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 2)?;
    r.get_u64()
}

pub fn field_exit(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 3)?;
    r.get_u64()
}

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 4 + 8 * 2)?;
    r.get_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encoded_size, pack_record, unpack_record};

    fn sample() -> UrlNode {
        let mut node = UrlNode::new("/docs/index.html?page=2");
        node.base.id = 5;
        node.hits = 10;
        node.xfer = 20_480;
        node.entry = 4;
        node.exit = 2;
        node.avg_time = 12.5;
        node.max_time = 80.0;
        node.target = true;
        node.url_type = UrlType::Https;
        node
    }

    #[test]
    fn test_round_trip() {
        let node = sample();
        let buf = pack_record(&node);
        assert_eq!(encoded_size(&buf).unwrap(), buf.len());

        let back: UrlNode = unpack_record(&buf).unwrap();
        assert_eq!(back.key(), "/docs/index.html?page=2");
        assert_eq!(back.hits, 10);
        assert_eq!(back.entry, 4);
        assert_eq!(back.exit, 2);
        assert_eq!(back.pathlen, 16);
        assert_eq!(back.url_type, UrlType::Https);
        assert!(back.target);
        assert!(!back.hexenc);
        assert_eq!(back.vstref, 0);
    }

    #[test]
    fn test_field_offsets() {
        let buf = pack_record(&sample());
        assert_eq!(field_hits(&buf).unwrap(), 10);
        assert_eq!(field_xfer(&buf).unwrap(), 20_480);
        assert_eq!(field_entry(&buf).unwrap(), 4);
        assert_eq!(field_exit(&buf).unwrap(), 2);
    }

    #[test]
    fn test_url_type_combine() {
        assert_eq!(UrlType::Http.combine(UrlType::Http), UrlType::Http);
        assert_eq!(UrlType::Http.combine(UrlType::Https), UrlType::Mixed);
        assert_eq!(UrlType::Other.combine(UrlType::Https), UrlType::Https);
        assert_eq!(UrlType::Mixed.combine(UrlType::Http), UrlType::Mixed);
    }

    #[test]
    fn test_update_time_running_mean() {
        let mut node = UrlNode::new("/a");
        node.hits = 1;
        node.update_time(10.0);
        assert_eq!(node.avg_time, 10.0);
        node.hits = 2;
        node.update_time(20.0);
        assert_eq!(node.avg_time, 15.0);
        assert_eq!(node.max_time, 20.0);
    }
}
