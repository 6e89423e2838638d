//! Download nodes and their active-job records.
//!
//! A download aggregates one named download per host; its logical key is
//! the (host address, download name) pair, with the host carried as a node
//! id in the record. While a job is in flight an active-download record
//! exists under the same id, and the owning host is pinned through its
//! download refcount. The reference graph is a DAG:
//!
//! ```text
//! download -> host -> visit -> url
//!          -> active download
//! ```

use crate::encoding::{NodeData, Reader, Writer, TSTAMP_SIZE};
use crate::error::Result;
use crate::hashtab::hash_str;
use crate::node::host::HostNode;
use crate::node::{BaseNode, NodeKind, StoreNode};
use crate::tstamp::Tstamp;

#[derive(Debug, Clone, Default)]
pub struct DownloadNode {
    /// The key string is the download name
    pub base: BaseNode,
    pub hits: u64,
    pub xfer: u64,
    /// Total and average job time in minutes
    pub sumtime: f64,
    pub avgtime: f64,
    /// Completed download jobs
    pub count: u64,
    /// Owning host id; zero for group nodes
    pub host_id: u64,

    /// In-flight job record, if one is open
    pub job: Option<Box<ActiveDownloadNode>>,
    /// Host key of the owner, kept for fingerprinting; not serialized
    pub host_key: String,
    /// Owned host materialized by the reporting unpack path
    pub own_host: Option<Box<HostNode>>,
    /// Set by unpack when the record's active flag was on
    pub unpacked_active: bool,
    pub dirty: bool,
}

impl DownloadNode {
    pub fn new(host_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            base: BaseNode::new(name),
            host_key: host_key.into(),
            ..Default::default()
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            base: BaseNode::group(name),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.base.key
    }

    pub fn key_hash(host_key: &str, name: &str) -> u64 {
        hash_str(hash_str(0, host_key), name)
    }

    /// Folds a finished job into the aggregate.
    pub fn finish_job(&mut self, job: &ActiveDownloadNode) {
        self.count += 1;
        self.hits += job.hits;
        self.xfer += job.xfer;
        self.sumtime += job.proctime;
        self.avgtime = self.sumtime / self.count as f64;
    }
}

impl NodeData for DownloadNode {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        self.base.data_size() + 8 * 3 + 8 * 2 + 1 + 8 + 8
    }

    fn pack_data(&self, w: &mut Writer) {
        self.base.pack(w);
        w.put_u64(self.hits);
        w.put_u64(self.xfer);
        w.put_f64(self.sumtime);
        w.put_f64(self.avgtime);
        w.put_u64(self.count);
        w.put_bool(self.job.is_some());
        w.put_u64(self.host_id);
        w.put_u64(hash_str(hash_str(0, &self.host_key), &self.base.key));
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let base = BaseNode::unpack(r)?;
        let mut node = Self {
            base,
            ..Default::default()
        };
        node.hits = r.get_u64()?;
        node.xfer = r.get_u64()?;
        node.sumtime = r.get_f64()?;
        node.avgtime = r.get_f64()?;
        node.count = r.get_u64()?;
        node.unpacked_active = r.get_bool()?;
        node.host_id = r.get_u64()?;
        r.skip(8)?; // value hash
        Ok(node)
    }
}

impl StoreNode for DownloadNode {
    const KIND: NodeKind = NodeKind::Download;

    fn node_id(&self) -> u64 {
        self.base.id
    }

    fn set_node_id(&mut self, id: u64) {
        self.base.id = id;
    }

    fn value_hash(&self) -> u64 {
        hash_str(hash_str(0, &self.host_key), &self.base.key)
    }
}

pub fn field_xfer(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8)?;
    r.get_u64()
}

pub fn field_value_hash(buf: &[u8]) -> Result<u64> {
    let mut r = crate::node::skip_base(buf)?;
    r.skip(8 * 5 + 1 + 8)?;
    r.get_u64()
}

/// One download job in flight. Shares its id with the owning download and
/// is destroyed when the job times out.
///
/// Record version 2 replaced the epoch timestamp with a structured one.
#[derive(Debug, Clone, Default)]
pub struct ActiveDownloadNode {
    pub id: u64,
    pub hits: u64,
    /// Last activity
    pub tstamp: Tstamp,
    /// Job time so far in minutes
    pub proctime: f64,
    pub xfer: u64,
    pub dirty: bool,
}

impl ActiveDownloadNode {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

impl NodeData for ActiveDownloadNode {
    const VERSION: u16 = 2;

    fn data_size(&self) -> usize {
        8 + TSTAMP_SIZE + 8 + 8
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_u64(self.hits);
        w.put_tstamp(&self.tstamp);
        w.put_f64(self.proctime);
        w.put_u64(self.xfer);
    }

    fn unpack_data(r: &mut Reader, version: u16) -> Result<Self> {
        let mut node = Self::default();
        node.hits = r.get_u64()?;
        if version >= 2 {
            node.tstamp = r.get_tstamp()?;
        } else {
            node.tstamp = Tstamp::from_epoch(r.get_u64()? as i64, 0);
        }
        node.proctime = r.get_f64()?;
        node.xfer = r.get_u64()?;
        Ok(node)
    }
}

impl StoreNode for ActiveDownloadNode {
    const KIND: NodeKind = NodeKind::ActiveDownload;

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
    use crate::encoding::{pack_record, unpack_record};

    #[test]
    fn test_download_round_trip() {
        let mut node = DownloadNode::new("10.0.0.1", "release.tar.gz");
        node.base.id = 3;
        node.host_id = 11;
        node.hits = 5;
        node.xfer = 1 << 20;
        node.count = 2;
        node.sumtime = 8.0;
        node.avgtime = 4.0;
        let buf = pack_record(&node);
        let back: DownloadNode = unpack_record(&buf).unwrap();
        assert_eq!(back.name(), "release.tar.gz");
        assert_eq!(back.host_id, 11);
        assert_eq!(back.count, 2);
        assert!(!back.unpacked_active);
        assert_eq!(field_xfer(&buf).unwrap(), 1 << 20);
    }

    #[test]
    fn test_active_flag() {
        let mut node = DownloadNode::new("10.0.0.1", "file.iso");
        node.job = Some(Box::new(ActiveDownloadNode::new(3)));
        let buf = pack_record(&node);
        let back: DownloadNode = unpack_record(&buf).unwrap();
        assert!(back.unpacked_active);
        assert!(back.job.is_none());
    }

    #[test]
    fn test_active_download_round_trip() {
        let mut job = ActiveDownloadNode::new(3);
        job.hits = 4;
        job.xfer = 2048;
        job.proctime = 1.5;
        job.tstamp = Tstamp::new(2020, 6, 15, 11, 0, 0, 0);
        let buf = pack_record(&job);
        let back: ActiveDownloadNode = unpack_record(&buf).unwrap();
        assert_eq!(back.hits, 4);
        assert_eq!(back.xfer, 2048);
        assert_eq!(back.proctime, 1.5);
    }

    #[test]
    fn test_finish_job_updates_averages() {
        let mut node = DownloadNode::new("h", "f");
        let mut job = ActiveDownloadNode::new(1);
        job.hits = 2;
        job.xfer = 100;
        job.proctime = 3.0;
        node.finish_job(&job);
        job.proctime = 5.0;
        node.finish_job(&job);
        assert_eq!(node.count, 2);
        assert_eq!(node.sumtime, 8.0);
        assert_eq!(node.avgtime, 4.0);
        assert_eq!(node.xfer, 200);
    }
}
