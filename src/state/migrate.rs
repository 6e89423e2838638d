//! The schema-upgrade pipeline.
//!
//! Runs when the database's last writer differs from the current version,
//! applying version-gated fixes in ascending order. Each step repairs one
//! historical defect in place; the sysnode is stamped with the current
//! version at the end so the next run skips the pipeline entirely.

use crate::error::Result;
use crate::node::daily::DailyNode;
use crate::node::dhost::DailyHostNode;
use crate::node::host::HostNode;
use crate::node::hourly::HourlyNode;
use crate::node::sysnode::{
    VERSION, VERSION_3_3_1_5, VERSION_3_4_1_1, VERSION_3_5_1_1, VERSION_3_8_0_4,
};
use crate::node::totals::Totals;
use crate::node::{NodeKind, StoreNode};
use crate::state::State;
use crate::tstamp::Tstamp;

pub fn upgrade_database(state: &mut State) -> Result<()> {
    // a new or truncated database has nothing to upgrade
    if state.sysnode.appver == 0 {
        return Ok(());
    }

    tracing::info!(
        appver = format_args!("{:#010x}", state.sysnode.appver),
        appver_last = format_args!("{:#010x}", state.sysnode.appver_last),
        "upgrading database"
    );

    // Sequence ids at or before 3.8.0.4 could be drawn from the wrong
    // sequence tables; renumber every sequence past its table's largest id
    // so new allocations cannot collide.
    if state.sysnode.appver_last <= VERSION_3_8_0_4 {
        fix_sequences(state)?;
    }

    // Daily and hourly rows written before 3.3.1.5 carried no version
    // header; read them headerless and write them back framed. The
    // one-shot sysnode flag keeps rows fixed in this run readable by the
    // normal path from now on.
    if state.sysnode.appver < VERSION_3_3_1_5 && !state.sysnode.fixed_dhv {
        for day in 1..=31u64 {
            if let Some(node) = state.storage.get_node_fixver::<DailyNode>(day)? {
                state.storage.put_node(&node)?;
            }
        }
        for hour in 0..24u64 {
            if let Some(node) = state.storage.get_node_fixver::<HourlyNode>(hour)? {
                state.storage.put_node(&node)?;
            }
        }
        state.sysnode.fixed_dhv = true;
    }

    // Read totals into a local node so upgrade data cannot linger in the
    // run's own totals.
    let mut totals: Totals = state
        .storage
        .get_node(1)?
        .unwrap_or_default();

    // Hosts written before 3.4.1.1 carried no last-hit timestamp. Every
    // host in the daily-hosts table was seen today; stamp it with the
    // start of the current day and drop the table.
    if state.sysnode.appver < VERSION_3_4_1_1 {
        let day_start = totals.cur_tstamp.mktime() / 86400 * 86400;
        let keys: Vec<String> = state
            .storage
            .scan_primary::<DailyHostNode>()?
            .map(|n| n.map(|n| n.key().to_string()))
            .collect::<Result<_>>()?;
        for key in keys {
            let hash = DailyHostNode::key_hash(&key);
            let found = state
                .storage
                .find_by_value::<HostNode, _>(hash, |n| n.key() == key)?;
            if let Some(mut host) = found {
                if host.tstamp.is_null() {
                    host.tstamp = Tstamp::from_epoch(day_start, 0);
                    state.storage.put_node(&host)?;
                }
            }
        }
        state.storage.clear_table(NodeKind::DailyHost)?;
    }

    // Record counts missing before 3.5.1.1 are recovered from the table
    // row counts.
    if state.sysnode.appver < VERSION_3_5_1_1 {
        if totals.t_srchits != 0 && totals.t_search == 0 {
            totals.t_search = state.storage.count(NodeKind::Search)?;
        }
        if totals.t_dlcount != 0 && totals.t_downloads == 0 {
            totals.t_downloads = state.storage.count(NodeKind::Download)?;
        }
        if totals.t_grp_hosts == 0 {
            totals.t_grp_hosts = state
                .storage
                .count(NodeKind::Host)?
                .saturating_sub(totals.t_hosts);
        }
        if totals.t_grp_urls == 0 {
            totals.t_grp_urls = state
                .storage
                .count(NodeKind::Url)?
                .saturating_sub(totals.t_url);
        }
        if totals.t_grp_users == 0 {
            totals.t_grp_users = state
                .storage
                .count(NodeKind::User)?
                .saturating_sub(totals.t_user);
        }
        if totals.t_grp_refs == 0 {
            totals.t_grp_refs = state
                .storage
                .count(NodeKind::Referrer)?
                .saturating_sub(totals.t_ref);
        }
        if totals.t_grp_agents == 0 {
            totals.t_grp_agents = state
                .storage
                .count(NodeKind::Agent)?
                .saturating_sub(totals.t_agent);
        }
    }

    state.storage.put_node(&totals)?;

    state.sysnode.appver_last = VERSION;
    let sysnode = state.sysnode.clone();
    state.storage.put_node(&sysnode)?;
    Ok(())
}

/// Bumps every kind's sequence past the largest id its primary table
/// holds, so future allocations cannot collide with existing rows.
fn fix_sequences(state: &mut State) -> Result<()> {
    for &kind in NodeKind::all() {
        let max_id = match kind {
            NodeKind::Host => max_primary_id::<HostNode>(state)?,
            NodeKind::Url => max_primary_id::<crate::node::url::UrlNode>(state)?,
            NodeKind::Referrer => max_primary_id::<crate::node::referrer::ReferrerNode>(state)?,
            NodeKind::Agent => max_primary_id::<crate::node::agent::AgentNode>(state)?,
            NodeKind::Search => max_primary_id::<crate::node::search::SearchNode>(state)?,
            NodeKind::User => max_primary_id::<crate::node::user::UserNode>(state)?,
            NodeKind::Error => max_primary_id::<crate::node::errors::ErrorNode>(state)?,
            NodeKind::Download => max_primary_id::<crate::node::download::DownloadNode>(state)?,
            NodeKind::DailyHost => max_primary_id::<DailyHostNode>(state)?,
            _ => continue,
        };
        if state.storage.sequence(kind)? < max_id {
            tracing::warn!(table = kind.table_name(), max_id, "renumbering sequence");
            state.storage.set_sequence(kind, max_id)?;
        }
    }
    Ok(())
}

fn max_primary_id<T: StoreNode>(state: &State) -> Result<u64> {
    let mut max_id = 0;
    for node in state.storage.scan_primary::<T>()? {
        max_id = max_id.max(node?.node_id());
    }
    Ok(max_id)
}
