//! Secondary-index key encoding and per-kind index tables.
//!
//! Report indexes order node ids by one record field, descending, with ties
//! broken by ascending id. Index keys are composed so plain lexicographic
//! iteration of the tree yields that order: the field is complemented and
//! big-endian encoded, followed by the big-endian id.
//!
//! Extractors read the ordering field straight out of an encoded record
//! through the per-kind field-offset helpers, so a rebuild never decodes
//! whole records. An extractor returns None when a record does not belong
//! to the index (the groups-first variants split on the node type flag).

use crate::error::Result;
use crate::node::{self, record_flag, NodeKind};

/// Composes a descending-order index key.
pub fn index_key(field: u64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&(!field).to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Composes a value-index key: the value hash followed by the id, so nodes
/// sharing a hash stay distinct.
pub fn value_key(hash: u64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&hash.to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Recovers the node id from either key form.
pub fn key_id(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(8..16)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// One named report index over a primary table.
pub struct IndexDef {
    /// Name suffix; the tree is `<table>.<name>`
    pub name: &'static str,
    /// Ordering-field extractor over an encoded record
    pub field: fn(&[u8]) -> Result<Option<u64>>,
}

/// Index tables and the value-hash extractor of one node kind.
pub struct TableSpec {
    /// Reads the value hash from an encoded record; None for kinds without
    /// a value index
    pub value_hash: Option<fn(&[u8]) -> Result<u64>>,
    pub indexes: &'static [IndexDef],
}

/// Index layout per kind. Kinds absent here keep only their primary table.
pub fn spec_for(kind: NodeKind) -> &'static TableSpec {
    match kind {
        NodeKind::Host => &HOST_SPEC,
        NodeKind::Url => &URL_SPEC,
        NodeKind::Referrer => &REFERRER_SPEC,
        NodeKind::Agent => &AGENT_SPEC,
        NodeKind::Search => &SEARCH_SPEC,
        NodeKind::User => &USER_SPEC,
        NodeKind::Error => &ERROR_SPEC,
        NodeKind::Download => &DOWNLOAD_SPEC,
        NodeKind::Country => &COUNTRY_SPEC,
        NodeKind::City => &CITY_SPEC,
        NodeKind::DailyHost => &DHOST_SPEC,
        _ => &BARE_SPEC,
    }
}

static BARE_SPEC: TableSpec = TableSpec {
    value_hash: None,
    indexes: &[],
};

static HOST_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::host::field_value_hash),
    indexes: &[
        IndexDef {
            name: "hits",
            field: |buf| regular_only(buf, node::host::field_hits),
        },
        IndexDef {
            name: "xfer",
            field: |buf| regular_only(buf, node::host::field_xfer),
        },
        IndexDef {
            name: "groups.hits",
            field: |buf| groups_only(buf, node::host::field_hits),
        },
        IndexDef {
            name: "groups.xfer",
            field: |buf| groups_only(buf, node::host::field_xfer),
        },
    ],
};

static URL_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::url::field_value_hash),
    indexes: &[
        IndexDef {
            name: "hits",
            field: |buf| regular_only(buf, node::url::field_hits),
        },
        IndexDef {
            name: "xfer",
            field: |buf| regular_only(buf, node::url::field_xfer),
        },
        IndexDef {
            name: "entry",
            field: |buf| regular_only(buf, node::url::field_entry),
        },
        IndexDef {
            name: "exit",
            field: |buf| regular_only(buf, node::url::field_exit),
        },
        IndexDef {
            name: "groups.hits",
            field: |buf| groups_only(buf, node::url::field_hits),
        },
        IndexDef {
            name: "groups.xfer",
            field: |buf| groups_only(buf, node::url::field_xfer),
        },
    ],
};

static REFERRER_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::referrer::field_value_hash),
    indexes: &[
        IndexDef {
            name: "hits",
            field: |buf| regular_only(buf, node::referrer::field_hits),
        },
        IndexDef {
            name: "groups.hits",
            field: |buf| groups_only(buf, node::referrer::field_hits),
        },
    ],
};

static AGENT_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::agent::field_value_hash),
    indexes: &[
        IndexDef {
            name: "visits",
            field: |buf| regular_only(buf, node::agent::field_visits),
        },
        IndexDef {
            name: "groups.visits",
            field: |buf| groups_only(buf, node::agent::field_visits),
        },
    ],
};

static SEARCH_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::search::field_value_hash),
    indexes: &[IndexDef {
        name: "hits",
        field: |buf| node::search::field_hits(buf).map(Some),
    }],
};

static USER_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::user::field_value_hash),
    indexes: &[
        IndexDef {
            name: "hits",
            field: |buf| regular_only(buf, node::user::field_hits),
        },
        IndexDef {
            name: "groups.hits",
            field: |buf| groups_only(buf, node::user::field_hits),
        },
    ],
};

static ERROR_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::errors::field_value_hash),
    indexes: &[IndexDef {
        name: "hits",
        field: |buf| node::errors::field_hits(buf).map(Some),
    }],
};

static DOWNLOAD_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::download::field_value_hash),
    indexes: &[
        IndexDef {
            name: "xfer",
            field: |buf| regular_only(buf, node::download::field_xfer),
        },
        IndexDef {
            name: "groups.xfer",
            field: |buf| groups_only(buf, node::download::field_xfer),
        },
    ],
};

static COUNTRY_SPEC: TableSpec = TableSpec {
    value_hash: None,
    indexes: &[IndexDef {
        name: "visits",
        field: |buf| node::country::field_visits(buf).map(Some),
    }],
};

static CITY_SPEC: TableSpec = TableSpec {
    value_hash: None,
    indexes: &[IndexDef {
        name: "visits",
        field: |buf| node::city::field_visits(buf).map(Some),
    }],
};

static DHOST_SPEC: TableSpec = TableSpec {
    value_hash: Some(node::dhost::field_value_hash),
    indexes: &[],
};

fn regular_only(buf: &[u8], field: fn(&[u8]) -> Result<u64>) -> Result<Option<u64>> {
    if record_flag(buf)?.is_group() {
        return Ok(None);
    }
    field(buf).map(Some)
}

fn groups_only(buf: &[u8], field: fn(&[u8]) -> Result<u64>) -> Result<Option<u64>> {
    if !record_flag(buf)?.is_group() {
        return Ok(None);
    }
    field(buf).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::pack_record;
    use crate::node::host::HostNode;

    #[test]
    fn test_index_key_orders_descending_with_id_tiebreak() {
        let mut keys = vec![
            index_key(10, 5),
            index_key(30, 2),
            index_key(10, 1),
            index_key(20, 9),
        ];
        keys.sort();
        let ids: Vec<u64> = keys.iter().map(|k| key_id(k).unwrap()).collect();
        // fields 30, 20, then the two 10s by ascending id
        assert_eq!(ids, vec![2, 9, 1, 5]);
    }

    #[test]
    fn test_group_filtering() {
        let mut host = HostNode::new("10.0.0.1");
        host.hits = 5;
        let reg = pack_record(&host);
        let mut grp = HostNode::group("internal hosts");
        grp.hits = 8;
        let grp = pack_record(&grp);

        let spec = spec_for(NodeKind::Host);
        let hits = &spec.indexes[0];
        let grp_hits = &spec.indexes[2];
        assert_eq!((hits.field)(&reg).unwrap(), Some(5));
        assert_eq!((hits.field)(&grp).unwrap(), None);
        assert_eq!((grp_hits.field)(&reg).unwrap(), None);
        assert_eq!((grp_hits.field)(&grp).unwrap(), Some(8));
    }

    #[test]
    fn test_key_id_recovers_id() {
        assert_eq!(key_id(&index_key(u64::MAX, 7)), Some(7));
        assert_eq!(key_id(&value_key(0, 9)), Some(9));
        assert_eq!(key_id(&[0u8; 4]), None);
    }
}
