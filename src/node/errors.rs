//! HTTP error nodes.
//!
//! Keyed by the (method, status code, URL) triple; the key fingerprint
//! folds all three so two methods hitting the same URL with the same status
//! stay distinct.

use crate::encoding::{str_size, NodeData, Reader, Writer};
use crate::error::Result;
use crate::hashtab::{hash_num, hash_str};
use crate::node::{BaseNode, NodeKind, StoreNode};

#[derive(Debug, Clone, Default)]
pub struct ErrorNode {
    /// The key string is the request URL
    pub base: BaseNode,
    pub method: String,
    pub respcode: u16,
    pub hits: u64,
    pub hexenc: bool,
    pub dirty: bool,
}

impl ErrorNode {
    pub fn new(method: impl Into<String>, url: impl Into<String>, respcode: u16) -> Self {
        let url = url.into();
        let hexenc = url.contains('%');
        Self {
            base: BaseNode::new(url),
            method: method.into(),
            respcode,
            hexenc,
            ..Default::default()
        }
    }

    pub fn url(&self) -> &str {
        &self.base.key
    }

    pub fn key_hash(method: &str, url: &str, respcode: u16) -> u64 {
        hash_str(hash_str(hash_num(0, respcode as u64), method), url)
    }

    pub fn matches(&self, method: &str, url: &str, respcode: u16) -> bool {
        self.respcode == respcode && self.method == method && self.base.key == url
    }
}

impl NodeData for ErrorNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        self.base.data_size() + 1 + 2 + 8 + str_size(&self.method) + 8
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_bool(self.hexenc);
        w.put_u16(self.respcode);
        w.put_u64(self.hits);
        w.put_str(&self.method);
        w.put_u64(Self::key_hash(&self.method, &self.base.key, self.respcode));
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.hexenc = r.get_bool()?;
        node.respcode = r.get_u16()?;
        node.hits = r.get_u64()?;
        node.method = r.get_str()?;
        r.skip(8)?; // value hash
        Ok(node)
    }
}

impl StoreNode for ErrorNode {
    const KIND: NodeKind = NodeKind::Error;

    fn node_id(&self) -> u64 {
        self.base.id
    }

    fn set_node_id(&mut self, id: u64) {
        self.base.id = id;
    }

    fn value_hash(&self) -> u64 {
        Self::key_hash(&self.method, &self.base.key, self.respcode)
    }
}

pub fn field_hits(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(1 + 2)?; // hexenc, respcode
    r.get_u64()
}

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(1 + 2 + 8)?;
    r.skip_str()?; // method
    r.get_u64()
}
