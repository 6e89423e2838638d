//! The storage engine.
//!
//! Wraps one embedded B-tree store (sled). Every node kind owns a primary
//! tree keyed by the big-endian node id, a sequence counter, and, per the
//! index tables in [`index`], a value-hash tree plus zero or more named
//! report indexes. Value trees are maintained on every put; report indexes
//! are live-maintained only while attached, and can be rebuilt wholesale
//! after a batch run left them stale.
//!
//! Rollover archives the current database directory under a year-month
//! suffix and reopens an empty one; truncate empties every tree and resets
//! every sequence in place. With trickle mode on, dirty pages are synced
//! every N puts to bound the cache footprint of long ingestion runs.

pub mod index;

use std::path::{Path, PathBuf};

use crate::encoding::{pack_record, unpack_record, unpack_record_fixver};
use crate::error::{Error, Result};
use crate::node::download::DownloadNode;
use crate::node::host::HostNode;
use crate::node::{NodeKind, StoreNode};
use crate::tstamp::Tstamp;

use index::{index_key, key_id, spec_for, value_key, IndexDef};

const SEQUENCES_TREE: &str = "sequences";

pub struct StorageEngine {
    path: PathBuf,
    db: Option<sled::Db>,
    /// Report indexes are being live-maintained
    attached: bool,
    /// Sync dirty pages every `trickle_rate` puts; zero disables
    trickle_rate: u32,
    put_count: u32,
}

impl StorageEngine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: None,
            attached: false,
            trickle_rate: 0,
            put_count: 0,
        }
    }

    pub fn set_trickle(&mut self, rate: u32) {
        self.trickle_rate = rate;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.db.is_some() {
            return Ok(());
        }
        let db = sled::open(&self.path)
            .map_err(|e| Error::IO(format!("cannot open database {:?}: {e}", self.path)))?;
        tracing::info!(path = %self.path.display(), "database opened");
        self.db = Some(db);
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(db) = self.db.take() {
            db.flush()
                .map_err(|e| Error::IO(format!("cannot flush database on close: {e}")))?;
            tracing::info!(path = %self.path.display(), "database closed");
        }
        Ok(())
    }

    fn db(&self) -> Result<&sled::Db> {
        self.db
            .as_ref()
            .ok_or_else(|| Error::IO("database is not open".to_string()))
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.db()?.open_tree(name)?)
    }

    /// Raw tree handle, for test fixtures that fabricate legacy rows.
    pub(crate) fn raw_tree(&self, name: &str) -> Result<sled::Tree> {
        self.tree(name)
    }

    fn index_tree(&self, kind: NodeKind, index: &str) -> Result<sled::Tree> {
        self.tree(&format!("{}.{index}", kind.table_name()))
    }

    // --- sequences ---

    /// Allocates the next id in the kind's sequence.
    pub fn next_id(&mut self, kind: NodeKind) -> Result<u64> {
        let seqs = self.tree(SEQUENCES_TREE)?;
        let key = kind.table_name().as_bytes();
        let next = match seqs.get(key)? {
            Some(raw) => decode_u64(&raw)? + 1,
            None => 1,
        };
        seqs.insert(key, next.to_be_bytes().to_vec())?;
        Ok(next)
    }

    pub fn sequence(&self, kind: NodeKind) -> Result<u64> {
        let seqs = self.tree(SEQUENCES_TREE)?;
        match seqs.get(kind.table_name().as_bytes())? {
            Some(raw) => decode_u64(&raw),
            None => Ok(0),
        }
    }

    pub fn set_sequence(&mut self, kind: NodeKind, value: u64) -> Result<()> {
        let seqs = self.tree(SEQUENCES_TREE)?;
        seqs.insert(kind.table_name().as_bytes(), value.to_be_bytes().to_vec())?;
        Ok(())
    }

    // --- primary operations ---

    /// Writes a node, maintaining the value tree and any attached report
    /// indexes.
    pub fn put_node<T: StoreNode>(&mut self, node: &T) -> Result<()> {
        let kind = T::KIND;
        let spec = spec_for(kind);
        let id = node.node_id();
        let primary = self.tree(kind.table_name())?;
        let encoded = pack_record(node);

        if self.attached && !spec.indexes.is_empty() {
            let old = primary.get(id.to_be_bytes())?;
            for def in spec.indexes {
                self.update_index_entry(kind, def, id, old.as_deref(), Some(&encoded))?;
            }
        }

        if spec.value_hash.is_some() {
            let values = self.index_tree(kind, "values")?;
            values.insert(value_key(node.value_hash(), id), id.to_be_bytes().to_vec())?;
        }

        primary
            .insert(id.to_be_bytes(), encoded)
            .map_err(|e| put_error(kind, id, e))?;
        self.tick()
    }

    /// Reads a node by id, restoring the id field the record key carries.
    pub fn get_node<T: StoreNode>(&self, id: u64) -> Result<Option<T>> {
        let primary = self.tree(T::KIND.table_name())?;
        match primary.get(id.to_be_bytes())? {
            Some(raw) => {
                let mut node: T = unpack_record(&raw)
                    .map_err(|e| record_error(T::KIND, id, e))?;
                node.set_node_id(id);
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Reads a headerless legacy node by id; see the migrator.
    pub fn get_node_fixver<T: StoreNode>(&self, id: u64) -> Result<Option<T>> {
        let primary = self.tree(T::KIND.table_name())?;
        match primary.get(id.to_be_bytes())? {
            Some(raw) => {
                let mut node: T = unpack_record_fixver(&raw)
                    .map_err(|e| record_error(T::KIND, id, e))?;
                node.set_node_id(id);
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Finds a node through the value index. Hash collisions are resolved
    /// by the match predicate over decoded candidates.
    pub fn find_by_value<T, F>(&self, hash: u64, matches: F) -> Result<Option<T>>
    where
        T: StoreNode,
        F: Fn(&T) -> bool,
    {
        let values = self.index_tree(T::KIND, "values")?;
        for entry in values.scan_prefix(hash.to_be_bytes()) {
            let (_, raw_id) = entry?;
            let id = decode_u64(&raw_id)?;
            if let Some(node) = self.get_node::<T>(id)? {
                if matches(&node) {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    /// Finds a download by its logical (host, name) key, resolving the
    /// owning host to compare the host part.
    pub fn find_download(&self, host_key: &str, name: &str) -> Result<Option<DownloadNode>> {
        let hash = DownloadNode::key_hash(host_key, name);
        let values = self.index_tree(NodeKind::Download, "values")?;
        for entry in values.scan_prefix(hash.to_be_bytes()) {
            let (_, raw_id) = entry?;
            let id = decode_u64(&raw_id)?;
            let Some(mut node) = self.get_node::<DownloadNode>(id)? else {
                continue;
            };
            if node.name() != name {
                continue;
            }
            let Some(host) = self.get_node::<HostNode>(node.host_id)? else {
                continue;
            };
            if host.key() == host_key {
                node.host_key = host_key.to_string();
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Deletes a node and its index entries.
    pub fn delete_node<T: StoreNode>(&mut self, id: u64) -> Result<()> {
        let kind = T::KIND;
        let spec = spec_for(kind);
        let primary = self.tree(kind.table_name())?;
        let Some(old) = primary.remove(id.to_be_bytes())? else {
            return Ok(());
        };
        if self.attached {
            for def in spec.indexes {
                self.update_index_entry(kind, def, id, Some(&old), None)?;
            }
        }
        if let Some(value_hash) = spec.value_hash {
            let hash = value_hash(&old).map_err(|e| record_error(kind, id, e))?;
            self.index_tree(kind, "values")?
                .remove(value_key(hash, id))?;
        }
        Ok(())
    }

    /// Number of rows in the kind's primary table.
    pub fn count(&self, kind: NodeKind) -> Result<u64> {
        Ok(self.tree(kind.table_name())?.len() as u64)
    }

    /// Empties one primary table and its indexes.
    pub fn clear_table(&mut self, kind: NodeKind) -> Result<()> {
        self.tree(kind.table_name())?.clear()?;
        let spec = spec_for(kind);
        if spec.value_hash.is_some() {
            self.index_tree(kind, "values")?.clear()?;
        }
        for def in spec.indexes {
            self.index_tree(kind, def.name)?.clear()?;
        }
        Ok(())
    }

    // --- scans ---

    /// Streams every record of a primary table in id order.
    pub fn scan_primary<T: StoreNode>(&self) -> Result<impl Iterator<Item = Result<T>>> {
        let primary = self.tree(T::KIND.table_name())?;
        Ok(primary.iter().map(|entry| {
            let (raw_key, raw) = entry?;
            let id = decode_u64(&raw_key)?;
            let mut node: T =
                unpack_record(&raw).map_err(|e| record_error(T::KIND, id, e))?;
            node.set_node_id(id);
            Ok(node)
        }))
    }

    /// Streams records in a report index's order. The forward direction is
    /// the index order (descending field, ascending id on ties).
    pub fn scan_index<'a, T: StoreNode>(
        &'a self,
        name: &str,
        reverse: bool,
    ) -> Result<impl Iterator<Item = Result<T>> + 'a> {
        let tree = self.index_tree(T::KIND, name)?;
        let name = name.to_string();
        let entries: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = if reverse
        {
            Box::new(tree.iter().rev())
        } else {
            Box::new(tree.iter())
        };
        Ok(entries.map(move |entry| {
            let (key, _) = entry?;
            let id = key_id(&key).ok_or_else(|| {
                Error::InvalidData(format!("malformed index key in {}", T::KIND.table_name()))
            })?;
            self.get_node::<T>(id)?.ok_or_else(|| {
                Error::MissingNode(format!(
                    "index {} references {} node {id} that no longer exists",
                    name,
                    T::KIND.table_name()
                ))
            })
        }))
    }

    // --- index attach / rebuild ---

    pub fn indexes_attached(&self) -> bool {
        self.attached
    }

    /// Attaches report indexes. With `rebuild` set, every index tree is
    /// dropped and repopulated from its primary table; otherwise the trees
    /// are trusted as-is and live maintenance resumes.
    pub fn attach_indexes(&mut self, rebuild: bool) -> Result<()> {
        if rebuild {
            for &kind in NodeKind::all() {
                let spec = spec_for(kind);
                if spec.indexes.is_empty() {
                    continue;
                }
                self.rebuild_indexes(kind, spec.indexes)?;
            }
            tracing::info!("secondary indexes rebuilt");
        }
        self.attached = true;
        Ok(())
    }

    pub fn detach_indexes(&mut self) {
        self.attached = false;
    }

    fn rebuild_indexes(&mut self, kind: NodeKind, indexes: &[IndexDef]) -> Result<()> {
        for def in indexes {
            self.index_tree(kind, def.name)?.clear()?;
        }
        let primary = self.tree(kind.table_name())?;
        for entry in primary.iter() {
            let (raw_key, raw) = entry?;
            let id = decode_u64(&raw_key)?;
            for def in indexes {
                if let Some(field) = (def.field)(&raw).map_err(|e| record_error(kind, id, e))? {
                    self.index_tree(kind, def.name)?
                        .insert(index_key(field, id), id.to_be_bytes().to_vec())?;
                }
            }
        }
        Ok(())
    }

    fn update_index_entry(
        &self,
        kind: NodeKind,
        def: &IndexDef,
        id: u64,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<()> {
        let tree = self.index_tree(kind, def.name)?;
        let old_field = match old {
            Some(buf) => (def.field)(buf).map_err(|e| record_error(kind, id, e))?,
            None => None,
        };
        let new_field = match new {
            Some(buf) => (def.field)(buf).map_err(|e| record_error(kind, id, e))?,
            None => None,
        };
        if old_field == new_field {
            return Ok(());
        }
        if let Some(field) = old_field {
            tree.remove(index_key(field, id))?;
        }
        if let Some(field) = new_field {
            tree.insert(index_key(field, id), id.to_be_bytes().to_vec())?;
        }
        Ok(())
    }

    // --- whole-database operations ---

    /// True when a sysnode row exists, i.e. a previous run wrote state.
    pub fn has_sysnode(&self) -> Result<bool> {
        Ok(self
            .tree(NodeKind::System.table_name())?
            .contains_key(1u64.to_be_bytes())?)
    }

    /// Empties every table and resets every sequence.
    pub fn truncate(&mut self) -> Result<()> {
        let db = self.db()?;
        for name in db.tree_names() {
            if name == db.name() {
                continue;
            }
            db.open_tree(&name)?.clear()?;
        }
        tracing::warn!(path = %self.path.display(), "database truncated");
        Ok(())
    }

    /// Archives the current database under a year-month suffix and reopens
    /// an empty one at the original path.
    pub fn rollover(&mut self, ts: &Tstamp) -> Result<()> {
        let archive = rollover_path(&self.path, ts);
        self.close()?;
        std::fs::rename(&self.path, &archive).map_err(|e| {
            Error::IO(format!(
                "cannot archive database {:?} as {:?}: {e}",
                self.path, archive
            ))
        })?;
        tracing::info!(archive = %archive.display(), "database rolled over");
        self.open()
    }

    /// Syncs dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.db()?.flush()?;
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.put_count += 1;
        if self.trickle_rate != 0 && self.put_count % self.trickle_rate == 0 {
            tracing::debug!(puts = self.put_count, "trickle sync");
            self.flush()?;
        }
        Ok(())
    }
}

/// Archive name for a rollover: the year-month lands before the extension,
/// e.g. `logtally.db` becomes `logtally_202006.db`.
fn rollover_path(path: &Path, ts: &Tstamp) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("logtally");
    let suffix = format!("{:04}{:02}", ts.year, ts.month);
    let name = match path.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{stem}_{suffix}.{ext}"),
        None => format!("{stem}_{suffix}"),
    };
    path.with_file_name(name)
}

fn decode_u64(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::InvalidData(format!("expected 8 key bytes, got {}", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn put_error(kind: NodeKind, id: u64, e: sled::Error) -> Error {
    Error::IO(format!(
        "cannot write {} node (id: {id}): {e}",
        kind.table_name()
    ))
}

fn record_error(kind: NodeKind, id: u64, e: Error) -> Error {
    Error::InvalidData(format!("{} node (id: {id}): {e}", kind.table_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::host::HostNode;
    use crate::node::url::UrlNode;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, StorageEngine) {
        let dir = TempDir::new().unwrap();
        let mut store = StorageEngine::new(dir.path().join("logtally.db"));
        store.open().unwrap();
        (dir, store)
    }

    fn host(key: &str, id: u64, hits: u64, xfer: u64) -> HostNode {
        let mut node = HostNode::new(key);
        node.base.id = id;
        node.hits = hits;
        node.xfer = xfer;
        node
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, mut store) = open_store();
        store.put_node(&host("10.0.0.1", 3, 10, 999)).unwrap();

        let back: HostNode = store.get_node(3).unwrap().unwrap();
        assert_eq!(back.base.id, 3);
        assert_eq!(back.key(), "10.0.0.1");
        assert_eq!(back.xfer, 999);
        assert!(store.get_node::<HostNode>(4).unwrap().is_none());
    }

    #[test]
    fn test_sequences_are_per_kind() {
        let (_dir, mut store) = open_store();
        assert_eq!(store.next_id(NodeKind::Host).unwrap(), 1);
        assert_eq!(store.next_id(NodeKind::Host).unwrap(), 2);
        assert_eq!(store.next_id(NodeKind::Url).unwrap(), 1);
        assert_eq!(store.sequence(NodeKind::Host).unwrap(), 2);
    }

    #[test]
    fn test_find_by_value() {
        let (_dir, mut store) = open_store();
        store.put_node(&host("10.0.0.1", 1, 5, 0)).unwrap();
        store.put_node(&host("10.0.0.2", 2, 6, 0)).unwrap();

        let hash = HostNode::key_hash("10.0.0.2");
        let found: HostNode = store
            .find_by_value(hash, |n: &HostNode| n.key() == "10.0.0.2")
            .unwrap()
            .unwrap();
        assert_eq!(found.base.id, 2);

        let missing: Option<HostNode> = store
            .find_by_value(HostNode::key_hash("10.0.0.9"), |n: &HostNode| {
                n.key() == "10.0.0.9"
            })
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_live_index_order_with_ties() {
        let (_dir, mut store) = open_store();
        store.attach_indexes(false).unwrap();

        store.put_node(&host("a", 1, 10, 100)).unwrap();
        store.put_node(&host("b", 2, 30, 300)).unwrap();
        store.put_node(&host("c", 3, 10, 200)).unwrap();

        let hits: Vec<u64> = store
            .scan_index::<HostNode>("hits", false)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();
        // 30 first, then the tied 10s by ascending id
        assert_eq!(hits, vec![2, 1, 3]);

        let reversed: Vec<u64> = store
            .scan_index::<HostNode>("hits", true)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();
        assert_eq!(reversed, vec![3, 1, 2]);
    }

    #[test]
    fn test_live_index_updates_on_rewrite() {
        let (_dir, mut store) = open_store();
        store.attach_indexes(false).unwrap();

        store.put_node(&host("a", 1, 10, 0)).unwrap();
        store.put_node(&host("b", 2, 20, 0)).unwrap();
        // rewrite host 1 with more hits than host 2
        store.put_node(&host("a", 1, 50, 0)).unwrap();

        let ids: Vec<u64> = store
            .scan_index::<HostNode>("hits", false)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_rebuild_matches_live_maintenance() {
        let (_dir, mut store) = open_store();

        // batch-style run: no live maintenance
        for i in 0..20u64 {
            store
                .put_node(&host(&format!("h{i}"), i + 1, i * 7 % 13, i))
                .unwrap();
        }
        store.attach_indexes(true).unwrap();
        let rebuilt: Vec<u64> = store
            .scan_index::<HostNode>("hits", false)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();

        // same data with live maintenance from the start
        let (_dir2, mut live) = open_store();
        live.attach_indexes(false).unwrap();
        for i in 0..20u64 {
            live.put_node(&host(&format!("h{i}"), i + 1, i * 7 % 13, i))
                .unwrap();
        }
        let maintained: Vec<u64> = live
            .scan_index::<HostNode>("hits", false)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();

        assert_eq!(rebuilt, maintained);
    }

    #[test]
    fn test_groups_split_indexes() {
        let (_dir, mut store) = open_store();
        store.attach_indexes(false).unwrap();

        store.put_node(&host("10.0.0.1", 1, 10, 0)).unwrap();
        let mut grp = HostNode::group("lab machines");
        grp.base.id = 2;
        grp.hits = 99;
        store.put_node(&grp).unwrap();

        let regular: Vec<u64> = store
            .scan_index::<HostNode>("hits", false)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();
        let groups: Vec<u64> = store
            .scan_index::<HostNode>("groups.hits", false)
            .unwrap()
            .map(|n| n.unwrap().base.id)
            .collect();
        assert_eq!(regular, vec![1]);
        assert_eq!(groups, vec![2]);
    }

    #[test]
    fn test_delete_removes_index_entries() {
        let (_dir, mut store) = open_store();
        store.attach_indexes(false).unwrap();
        store.put_node(&host("a", 1, 10, 5)).unwrap();
        store.delete_node::<HostNode>(1).unwrap();

        assert!(store.get_node::<HostNode>(1).unwrap().is_none());
        assert_eq!(store.scan_index::<HostNode>("hits", false).unwrap().count(), 0);
        let found: Option<HostNode> =
            store.find_by_value(HostNode::key_hash("a"), |n: &HostNode| n.key() == "a").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_truncate_resets_everything() {
        let (_dir, mut store) = open_store();
        store.put_node(&host("a", 1, 1, 1)).unwrap();
        store.next_id(NodeKind::Host).unwrap();
        store.truncate().unwrap();
        assert_eq!(store.count(NodeKind::Host).unwrap(), 0);
        assert_eq!(store.sequence(NodeKind::Host).unwrap(), 0);
    }

    #[test]
    fn test_rollover_archives_current_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logtally.db");
        let mut store = StorageEngine::new(&path);
        store.open().unwrap();
        store.put_node(&host("a", 1, 1, 1)).unwrap();

        let ts = Tstamp::new(2020, 6, 30, 23, 0, 0, 0);
        store.rollover(&ts).unwrap();

        assert!(dir.path().join("logtally_202006.db").exists());
        assert_eq!(store.count(NodeKind::Host).unwrap(), 0);
        assert!(!store.has_sysnode().unwrap());
    }

    #[test]
    fn test_index_order_over_random_volumes() {
        use rand::Rng;

        let (_dir, mut store) = open_store();
        store.attach_indexes(false).unwrap();

        let mut rng = rand::thread_rng();
        let mut expected: Vec<(u64, u64)> = Vec::new();
        for id in 1..=200u64 {
            let hits = rng.gen_range(0..50);
            store
                .put_node(&host(&format!("h{id}"), id, hits, 0))
                .unwrap();
            expected.push((hits, id));
        }
        // descending by hits, ties by ascending id
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let scanned: Vec<(u64, u64)> = store
            .scan_index::<HostNode>("hits", false)
            .unwrap()
            .map(|n| {
                let n = n.unwrap();
                (n.hits, n.base.id)
            })
            .collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn test_scan_primary_in_id_order() {
        let (_dir, mut store) = open_store();
        let mut url = UrlNode::new("/b");
        url.base.id = 2;
        store.put_node(&url).unwrap();
        let mut url = UrlNode::new("/a");
        url.base.id = 1;
        store.put_node(&url).unwrap();

        let keys: Vec<String> = store
            .scan_primary::<UrlNode>()
            .unwrap()
            .map(|n| n.unwrap().key().to_string())
            .collect();
        assert_eq!(keys, vec!["/a", "/b"]);
    }
}
