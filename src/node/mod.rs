//! Persistent node kinds.
//!
//! Every aggregate the engine tracks is one of the record kinds below. A
//! node is created on first observation in the current month, mutated in
//! place, marked dirty, and persisted on swap-out or save. Kinds that key by
//! a string share a common base layout: a type flag (regular or group)
//! followed by the key, then kind-specific fields.

pub mod agent;
pub mod city;
pub mod country;
pub mod daily;
pub mod dhost;
pub mod download;
pub mod errors;
pub mod host;
pub mod hourly;
pub mod referrer;
pub mod search;
pub mod spammer;
pub mod status;
pub mod sysnode;
pub mod totals;
pub mod url;
pub mod user;
pub mod visit;

use crate::encoding::{NodeData, Reader, Writer};
use crate::error::{Error, Result};

/// Regular nodes aggregate one observed entity; group nodes aggregate
/// everything matched by a configured grouping pattern. Both share a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlag {
    Regular,
    Group,
}

impl NodeFlag {
    pub fn as_u8(self) -> u8 {
        match self {
            NodeFlag::Regular => 0,
            NodeFlag::Group => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(NodeFlag::Regular),
            1 => Ok(NodeFlag::Group),
            other => Err(Error::InvalidData(format!("unknown node flag {other}"))),
        }
    }

    pub fn is_group(self) -> bool {
        self == NodeFlag::Group
    }
}

impl Default for NodeFlag {
    fn default() -> Self {
        NodeFlag::Regular
    }
}

/// The fixed set of persistent record kinds. Each kind owns one primary
/// table and one sequence counter in the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    System,
    Totals,
    Daily,
    Hourly,
    StatusCode,
    Country,
    City,
    Host,
    Visit,
    Url,
    Referrer,
    Agent,
    Search,
    User,
    Error,
    Download,
    ActiveDownload,
    DailyHost,
}

impl NodeKind {
    /// Primary table name inside the database.
    pub fn table_name(self) -> &'static str {
        match self {
            NodeKind::System => "system",
            NodeKind::Totals => "totals",
            NodeKind::Daily => "daily",
            NodeKind::Hourly => "hourly",
            NodeKind::StatusCode => "statuscodes",
            NodeKind::Country => "countries",
            NodeKind::City => "cities",
            NodeKind::Host => "hosts",
            NodeKind::Visit => "visits",
            NodeKind::Url => "urls",
            NodeKind::Referrer => "referrers",
            NodeKind::Agent => "agents",
            NodeKind::Search => "search",
            NodeKind::User => "users",
            NodeKind::Error => "errors",
            NodeKind::Download => "downloads",
            NodeKind::ActiveDownload => "active_downloads",
            NodeKind::DailyHost => "dhosts",
        }
    }

    pub fn all() -> &'static [NodeKind] {
        &[
            NodeKind::System,
            NodeKind::Totals,
            NodeKind::Daily,
            NodeKind::Hourly,
            NodeKind::StatusCode,
            NodeKind::Country,
            NodeKind::City,
            NodeKind::Host,
            NodeKind::Visit,
            NodeKind::Url,
            NodeKind::Referrer,
            NodeKind::Agent,
            NodeKind::Search,
            NodeKind::User,
            NodeKind::Error,
            NodeKind::Download,
            NodeKind::ActiveDownload,
            NodeKind::DailyHost,
        ]
    }
}

/// A record the storage engine can keep in a primary table.
pub trait StoreNode: NodeData {
    const KIND: NodeKind;

    fn node_id(&self) -> u64;

    fn set_node_id(&mut self, id: u64);

    /// Hash of the node's logical value, fed into the value index. Kinds
    /// addressed purely by id return zero and get no value index.
    fn value_hash(&self) -> u64 {
        0
    }
}

/// Shared base of string-keyed kinds: node id, type flag, and the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseNode {
    pub id: u64,
    pub flag: NodeFlag,
    pub key: String,
}

impl BaseNode {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            id: 0,
            flag: NodeFlag::Regular,
            key: key.into(),
        }
    }

    pub fn group(key: impl Into<String>) -> Self {
        Self {
            id: 0,
            flag: NodeFlag::Group,
            key: key.into(),
        }
    }

    pub fn data_size(&self) -> usize {
        1 + crate::encoding::str_size(&self.key)
    }

    pub fn pack(&self, w: &mut Writer) {
        w.put_u8(self.flag.as_u8());
        w.put_str(&self.key);
    }

    pub fn unpack(r: &mut Reader) -> Result<Self> {
        let flag = NodeFlag::from_u8(r.get_u8()?)?;
        let key = r.get_str()?;
        Ok(Self { id: 0, flag, key })
    }
}

/// Reads the type flag of an encoded string-keyed record without decoding.
pub fn record_flag(buf: &[u8]) -> Result<NodeFlag> {
    let mut r = Reader::new(buf);
    r.skip(crate::encoding::NODE_HDR_SIZE)?;
    NodeFlag::from_u8(r.get_u8()?)
}

/// Positions a reader past the header and base fields of an encoded
/// string-keyed record, for field-offset extraction.
pub fn skip_base(buf: &[u8]) -> Result<Reader<'_>> {
    let mut r = Reader::new(buf);
    r.skip(crate::encoding::NODE_HDR_SIZE)?;
    r.skip(1)?;
    r.skip_str()?;
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Writer;

    #[test]
    fn test_base_node_round_trip() {
        let base = BaseNode::group("www.example.com");
        let mut w = Writer::new();
        base.pack(&mut w);
        let buf = w.into_vec();
        assert_eq!(buf.len(), base.data_size());

        let back = BaseNode::unpack(&mut Reader::new(&buf)).unwrap();
        assert_eq!(back.flag, NodeFlag::Group);
        assert_eq!(back.key, "www.example.com");
    }

    #[test]
    fn test_bad_flag_rejected() {
        assert!(NodeFlag::from_u8(7).is_err());
    }

    #[test]
    fn test_table_names_unique() {
        let mut names: Vec<_> = NodeKind::all().iter().map(|k| k.table_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), NodeKind::all().len());
    }
}
