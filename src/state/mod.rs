//! The run state.
//!
//! Owns every in-memory aggregation table, the totals and time cursor, the
//! sysnode, and the storage engine, and orchestrates the full lifecycle:
//! initialize, restore, aggregate (see [`aggregate`]), swap-out, save,
//! monthly rollover, and the schema upgrade pipeline in [`migrate`].
//!
//! Save order respects node references: an active child row (visit,
//! download job) is written before its parent, so a crash between the two
//! leaves a readable store with a missing child rather than a dangling
//! reference.

pub mod aggregate;
pub mod migrate;

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::hashtab::{HashTable, MEDIUM_HASH, SMALL_HASH};
use crate::history::History;
use crate::node::agent::AgentNode;
use crate::node::city::CityNode;
use crate::node::country::{CountryNode, CountryTable};
use crate::node::daily::DailyNode;
use crate::node::download::{ActiveDownloadNode, DownloadNode};
use crate::node::errors::ErrorNode;
use crate::node::host::HostNode;
use crate::node::hourly::HourlyNode;
use crate::node::referrer::ReferrerNode;
use crate::node::search::SearchNode;
use crate::node::spammer::SpammerTable;
use crate::node::status::{StatusCodeNode, StatusCodeTable};
use crate::node::sysnode::{SysNode, VERSION};
use crate::node::totals::Totals;
use crate::node::url::UrlNode;
use crate::node::user::UserNode;
use crate::node::visit::VisitNode;
use crate::node::{NodeFlag, StoreNode};
use crate::store::StorageEngine;
use crate::tstamp::Tstamp;

pub struct State {
    pub config: RunConfig,
    pub storage: StorageEngine,
    pub history: History,
    pub sysnode: SysNode,
    pub totals: Totals,
    pub t_daily: [DailyNode; 31],
    pub t_hourly: [HourlyNode; 24],
    pub response: StatusCodeTable,
    pub countries: CountryTable,
    pub cities: HashTable<CityNode>,

    pub hosts: HashTable<HostNode>,
    pub urls: HashTable<UrlNode>,
    pub referrers: HashTable<ReferrerNode>,
    pub agents: HashTable<AgentNode>,
    pub searches: HashTable<SearchNode>,
    pub users: HashTable<UserNode>,
    pub errors: HashTable<ErrorNode>,
    pub downloads: HashTable<DownloadNode>,
    pub spammers: SpammerTable,

    /// Ids of visits that ended this run; their rows are deleted on save
    pub v_ended: Vec<u64>,
    /// Ids of download jobs that finished this run
    pub dl_ended: Vec<u64>,

    /// Hosts and URLs may be swapped out (memory mode off)
    swap_enabled: bool,
    /// The legacy state file existed when the run started
    stfile: bool,
}

impl State {
    pub fn new(config: RunConfig) -> Self {
        let storage = StorageEngine::new(config.db_path());
        let history = History::new(&config);
        Self {
            storage,
            history,
            sysnode: SysNode::default(),
            totals: Totals::default(),
            t_daily: std::array::from_fn(|i| DailyNode::new(i as u32 + 1)),
            t_hourly: std::array::from_fn(|i| HourlyNode::new(i as u32)),
            response: StatusCodeTable::new(),
            countries: CountryTable::new(),
            cities: HashTable::new(SMALL_HASH),
            hosts: HashTable::new(MEDIUM_HASH),
            urls: HashTable::new(MEDIUM_HASH),
            referrers: HashTable::new(MEDIUM_HASH),
            agents: HashTable::new(SMALL_HASH),
            searches: HashTable::new(MEDIUM_HASH),
            users: HashTable::new(SMALL_HASH),
            errors: HashTable::new(SMALL_HASH),
            downloads: HashTable::new(SMALL_HASH),
            spammers: SpammerTable::new(),
            v_ended: Vec::new(),
            dl_ended: Vec::new(),
            swap_enabled: false,
            stfile: false,
            config,
        }
    }

    // ----------------------------------------------------------------
    // lifecycle
    // ----------------------------------------------------------------

    pub fn initialize(&mut self) -> Result<()> {
        self.sysnode.reset(&self.config);

        for &code in &self.config.status_codes {
            self.response.add_status_code(code);
        }
        for (ccode, cdesc) in &self.config.countries {
            self.countries.put_ccnode(ccode, cdesc);
        }

        // hash tables start in sync with the database
        self.set_table_flags(false, false);
        self.totals.init_counters();
        self.reset_time_tables();
        self.clear_tables();

        self.swap_enabled = !self.config.memory_mode;
        self.stfile = self.config.state_path().exists();

        if self.config.is_maintenance() && !self.storage.path().exists() {
            return Err(Error::IO(format!(
                "no database to maintain at {:?}",
                self.storage.path()
            )));
        }

        if self.config.db_trickle_rate != 0 && !self.config.memory_mode {
            self.storage.set_trickle(self.config.db_trickle_rate);
        }

        self.storage.open()?;

        if self.storage.has_sysnode()? {
            self.sysnode = self
                .storage
                .get_node(1)?
                .ok_or_else(|| Error::MissingNode("system node".to_string()))?;

            self.sysnode.check_sizeof()?;
            self.sysnode.check_byte_order()?;
            // informational reads do not enforce time settings
            if !self.config.db_info {
                self.sysnode.check_time_settings(&self.config)?;
            }

            if !self.config.compact_db && !self.config.db_info {
                if self.config.prep_report || self.config.end_month {
                    // a batch run left the report indexes stale
                    self.storage.attach_indexes(self.sysnode.batch)?;
                } else {
                    if !self.config.incremental && self.sysnode.incremental {
                        return Err(Error::Incompatible(
                            "cannot truncate an incremental database for a non-incremental run"
                                .to_string(),
                        ));
                    }
                    // truncate for a non-incremental run, or an incremental
                    // run following a non-incremental one
                    if !self.config.incremental || !self.sysnode.incremental {
                        self.storage.truncate()?;
                        self.sysnode.reset(&self.config);
                    }
                    if !self.config.batch {
                        self.storage.attach_indexes(false)?;
                    }
                }
            }
        } else if !self.config.batch {
            self.storage.attach_indexes(false)?;
        }

        if self.config.ignore_hist {
            tracing::info!("history file ignored");
        } else {
            self.history.get_history();
        }

        if self.sysnode.appver_last != VERSION {
            migrate::upgrade_database(self)?;
        }

        Ok(())
    }

    /// Reads the previous run's state back from the database.
    pub fn restore_state(&mut self) -> Result<()> {
        // a new or truncated database has nothing to restore
        if self.sysnode.appver == 0 {
            return Ok(());
        }

        self.totals = self
            .storage
            .get_node(1)?
            .ok_or_else(|| Error::MissingNode("totals node".to_string()))?;

        for day in 1..=31u64 {
            if let Some(node) = self.storage.get_node::<DailyNode>(day)? {
                self.t_daily[day as usize - 1] = node;
            }
        }
        for hour in 0..24u64 {
            if let Some(node) = self.storage.get_node::<HourlyNode>(hour)? {
                self.t_hourly[hour as usize] = node;
            }
        }
        for index in 0..self.response.len() as u64 {
            if let Some(node) = self.storage.get_node::<StatusCodeNode>(index)? {
                if let Some(slot) = self.response.get_by_index_mut(index as usize) {
                    slot.count = node.count;
                }
            }
        }

        for node in self.storage.scan_primary::<CountryNode>()? {
            let node = node?;
            self.countries.update_ccnode(&node);
        }
        for node in self.storage.scan_primary::<CityNode>()? {
            let node = node?;
            let hashval = CityNode::key_hash(node.geoname_id, &node.ccode);
            self.cities.put(hashval, node);
        }

        // Update current history before any mode check; if the history file
        // was missing, the current month is recovered from the database.
        // Note this runs even for report-only reads of a partial month.
        self.update_current_history();

        if self.config.prep_report {
            return Ok(());
        }

        if !self.config.memory_mode {
            // read only what must be in memory: active visits and download
            // jobs, with their owning nodes
            let visit_ids: Vec<u64> = self
                .storage
                .scan_primary::<VisitNode>()?
                .map(|v| v.map(|v| v.id))
                .collect::<Result<_>>()?;
            for id in visit_ids {
                let host = self.load_host(id)?.ok_or_else(|| {
                    Error::MissingNode(format!("host node (id: {id}) of an active visit"))
                })?;
                let hashval = HostNode::key_hash(host.key());
                self.hosts.put(hashval, host);
            }

            let job_ids: Vec<u64> = self
                .storage
                .scan_primary::<ActiveDownloadNode>()?
                .map(|j| j.map(|j| j.id))
                .collect::<Result<_>>()?;
            for id in job_ids {
                let download = self.load_download(id)?.ok_or_else(|| {
                    Error::MissingNode(format!("download node (id: {id}) of an active job"))
                })?;
                let hashval = DownloadNode::key_hash(&download.host_key, download.name());
                self.downloads.put(hashval, download);
            }

            // every other lookup must fall through to the store
            self.set_table_flags(false, true);
            return Ok(());
        }

        // memory mode: URLs first so visit unpack can resolve its last URL
        // against the table
        let urls: Vec<UrlNode> = self.storage.scan_primary::<UrlNode>()?.collect::<Result<_>>()?;
        for node in urls {
            let hashval = UrlNode::key_hash(node.key());
            self.urls.put(hashval, node);
        }

        let host_ids: Vec<u64> = self
            .storage
            .scan_primary::<HostNode>()?
            .map(|h| h.map(|h| h.node_id()))
            .collect::<Result<_>>()?;
        for id in host_ids {
            if let Some(host) = self.load_host(id)? {
                let hashval = HostNode::key_hash(host.key());
                self.hosts.put(hashval, host);
            }
        }

        for node in self.storage.scan_primary::<ReferrerNode>()?.collect::<Result<Vec<_>>>()? {
            let hashval = ReferrerNode::key_hash(node.key());
            self.referrers.put(hashval, node);
        }
        for node in self.storage.scan_primary::<AgentNode>()?.collect::<Result<Vec<_>>>()? {
            let hashval = AgentNode::key_hash(node.key());
            self.agents.put(hashval, node);
        }
        for node in self.storage.scan_primary::<SearchNode>()?.collect::<Result<Vec<_>>>()? {
            let hashval = SearchNode::key_hash(node.key());
            self.searches.put(hashval, node);
        }
        for node in self.storage.scan_primary::<UserNode>()?.collect::<Result<Vec<_>>>()? {
            let hashval = UserNode::key_hash(node.key());
            self.users.put(hashval, node);
        }
        for node in self.storage.scan_primary::<ErrorNode>()?.collect::<Result<Vec<_>>>()? {
            let hashval = ErrorNode::key_hash(&node.method, node.url(), node.respcode);
            self.errors.put(hashval, node);
        }

        let download_ids: Vec<u64> = self
            .storage
            .scan_primary::<DownloadNode>()?
            .map(|d| d.map(|d| d.node_id()))
            .collect::<Result<_>>()?;
        for id in download_ids {
            if let Some(download) = self.load_download(id)? {
                let hashval = DownloadNode::key_hash(&download.host_key, download.name());
                self.downloads.put(hashval, download);
            }
        }

        Ok(())
    }

    /// Writes the in-memory state to the database.
    pub fn save_state(&mut self) -> Result<()> {
        // the creating version is immutable once set
        if self.sysnode.appver == 0 {
            self.sysnode.appver = VERSION;
        }
        self.sysnode.appver_last = VERSION;
        // only a processing run updates the mode flags
        if !self.config.is_maintenance() {
            self.sysnode.incremental = self.config.incremental;
            self.sysnode.batch = self.config.batch;
        }
        let sysnode = self.sysnode.clone();
        self.storage.put_node(&sysnode)?;

        // drop rows of entities that ended during this run
        for id in std::mem::take(&mut self.v_ended) {
            self.storage.delete_node::<VisitNode>(id)?;
        }
        for id in std::mem::take(&mut self.dl_ended) {
            self.storage.delete_node::<ActiveDownloadNode>(id)?;
        }

        let totals = self.totals.clone();
        self.storage.put_node(&totals)?;
        for day in 0..31 {
            let node = self.t_daily[day].clone();
            self.storage.put_node(&node)?;
        }
        for hour in 0..24 {
            let node = self.t_hourly[hour].clone();
            self.storage.put_node(&node)?;
        }
        let codes: Vec<StatusCodeNode> = self.response.iter().cloned().collect();
        for node in codes {
            self.storage.put_node(&node)?;
        }
        let countries: Vec<CountryNode> = self
            .countries
            .iter()
            .filter(|n| n.any_activity())
            .cloned()
            .collect();
        for node in countries {
            self.storage.put_node(&node)?;
        }
        let cities: Vec<CityNode> = self.cities.iter().cloned().collect();
        for node in cities {
            self.storage.put_node(&node)?;
        }

        // group hosts accumulate ended visits until save folds them
        self.fold_group_visits();

        // reference order: download -> host -> visit -> url; each active
        // child row lands before its parent
        let mut jobs: Vec<ActiveDownloadNode> = Vec::new();
        let mut dls: Vec<DownloadNode> = Vec::new();
        for node in self.downloads.iter() {
            if let Some(job) = node.job.as_ref() {
                if job.dirty {
                    jobs.push((**job).clone());
                }
            }
            if node.dirty {
                dls.push(node.clone());
            }
        }
        for job in jobs {
            self.storage.put_node(&job)?;
        }
        for node in dls {
            self.storage.put_node(&node)?;
        }
        self.downloads.clear();

        let mut visits: Vec<VisitNode> = Vec::new();
        let mut host_nodes: Vec<HostNode> = Vec::new();
        for node in self.hosts.iter() {
            if let Some(visit) = node.visit.as_ref() {
                if visit.dirty {
                    visits.push((**visit).clone());
                }
            }
            if node.dirty {
                host_nodes.push(node.clone());
            }
        }
        for visit in visits {
            self.storage.put_node(&visit)?;
        }
        for node in host_nodes {
            self.storage.put_node(&node)?;
        }
        self.hosts.clear();

        self.save_table(|state| &state.urls)?;
        self.urls.clear();
        self.save_table(|state| &state.referrers)?;
        self.referrers.clear();
        self.save_table(|state| &state.agents)?;
        self.agents.clear();
        self.save_table(|state| &state.searches)?;
        self.searches.clear();
        self.save_table(|state| &state.users)?;
        self.users.clear();
        self.save_table(|state| &state.errors)?;
        self.errors.clear();

        self.update_current_history();
        self.history.put_history()?;

        // the legacy state file is a single-writer sentinel; incremental
        // runs clean it up once the database holds the state
        if self.config.incremental && self.stfile {
            if let Err(e) = std::fs::remove_file(self.config.state_path()) {
                tracing::warn!(error = %e, "cannot delete the legacy state file; remove it manually before the next run");
            } else {
                self.stfile = false;
            }
        }

        self.storage.flush()?;
        Ok(())
    }

    pub fn cleanup(&mut self) -> Result<()> {
        if let Err(e) = self.history.put_history() {
            tracing::warn!(error = %e, "cannot write the history file");
        }
        self.storage.close()
    }

    /// Rolls the state over into a new month: archives the database file,
    /// resets the sysnode, and clears every in-memory table and counter.
    pub fn clear_month(&mut self) -> Result<()> {
        if !self.totals.cur_tstamp.is_null() {
            let ts = self.totals.cur_tstamp;
            self.storage.rollover(&ts)?;
            self.sysnode.reset(&self.config);
        }
        self.totals.init_counters();
        self.reset_time_tables();
        self.clear_tables();
        self.countries.reset();
        self.response.reset_counts();
        self.v_ended.clear();
        self.dl_ended.clear();
        Ok(())
    }

    // ----------------------------------------------------------------
    // time machine
    // ----------------------------------------------------------------

    /// Advances the current-timestamp cursor, firing the deferred hourly
    /// and daily rollups on hour and day transitions.
    pub fn set_tstamp(&mut self, tstamp: &Tstamp) {
        let prev = self.totals.cur_tstamp;

        if prev.year != tstamp.year || prev.month != tstamp.month {
            self.totals.f_day = tstamp.day as u32;
            self.totals.l_day = tstamp.day as u32;
        }
        if tstamp.day as u32 > self.totals.l_day {
            self.totals.l_day = tstamp.day as u32;
        }

        if prev.hour != tstamp.hour {
            self.update_hourly_stats();
        }

        if !prev.is_null() && prev.day != tstamp.day {
            let index = prev.day as usize - 1;
            self.t_daily[index].tm_hosts = self.totals.dt_hosts;
            self.totals.dt_hosts = 0;
        }

        self.totals.cur_tstamp = *tstamp;
    }

    /// Folds the current hour's accumulators into the day's hourly
    /// averages and maxima. Runs on hour transitions, at the end of the
    /// month, and when the caller knows no more data is coming.
    pub fn update_hourly_stats(&mut self) {
        // zero accumulators mean the current hour saw no activity yet
        if self.totals.ht_hits == 0 {
            return;
        }
        let day = self.totals.cur_tstamp.day as usize;
        if day == 0 || day > 31 {
            return;
        }
        let daily = &mut self.t_daily[day - 1];
        daily.td_hours += 1;
        let hours = daily.td_hours as u64;

        update_avg_max(
            &mut daily.h_hits_avg,
            &mut daily.h_hits_max,
            self.totals.ht_hits,
            hours,
        );
        update_avg_max(
            &mut daily.h_files_avg,
            &mut daily.h_files_max,
            self.totals.ht_files,
            hours,
        );
        update_avg_max(
            &mut daily.h_pages_avg,
            &mut daily.h_pages_max,
            self.totals.ht_pages,
            hours,
        );
        update_avg_max(
            &mut daily.h_xfer_avg,
            &mut daily.h_xfer_max,
            self.totals.ht_xfer,
            hours,
        );
        update_avg_max(
            &mut daily.h_visits_avg,
            &mut daily.h_visits_max,
            self.totals.ht_visits,
            hours,
        );
        update_avg_max(
            &mut daily.h_hosts_avg,
            &mut daily.h_hosts_max,
            self.totals.ht_hosts,
            hours,
        );

        if self.totals.ht_hits > self.totals.hm_hit {
            self.totals.hm_hit = self.totals.ht_hits;
        }

        self.totals.ht_hits = 0;
        self.totals.ht_files = 0;
        self.totals.ht_pages = 0;
        self.totals.ht_xfer = 0;
        self.totals.ht_visits = 0;
        self.totals.ht_hosts = 0;
    }

    // ----------------------------------------------------------------
    // swap-out drive
    // ----------------------------------------------------------------

    /// One swap-out cycle over the two evictable tables. Write failures
    /// stop the pass early and leave the remaining nodes in memory.
    pub fn swap_out(&mut self) -> Result<()> {
        if !self.swap_enabled {
            return Ok(());
        }

        let storage = &mut self.storage;
        self.hosts.swap_out(
            |host| host.evictable(),
            |host| {
                if !host.dirty {
                    return Ok(true);
                }
                match storage.put_node(host) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        tracing::warn!(id = host.node_id(), error = %e, "host swap-out write failed");
                        Ok(false)
                    }
                }
            },
        )?;

        self.urls.swap_out(
            |url| url.evictable(),
            |url| {
                if !url.dirty {
                    return Ok(true);
                }
                match storage.put_node(url) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        tracing::warn!(id = url.node_id(), error = %e, "url swap-out write failed");
                        Ok(false)
                    }
                }
            },
        )?;

        Ok(())
    }

    // ----------------------------------------------------------------
    // unpack callbacks
    // ----------------------------------------------------------------

    /// Loads a host by id, resolving its active visit and the visit's last
    /// URL against the in-memory tables. Spammer-flagged hosts repopulate
    /// the spammer set.
    pub fn load_host(&mut self, id: u64) -> Result<Option<HostNode>> {
        let Some(host) = self.storage.get_node::<HostNode>(id)? else {
            return Ok(None);
        };
        self.resolve_host(host).map(Some)
    }

    /// Resolves the cross-references of a freshly decoded host.
    fn resolve_host(&mut self, mut host: HostNode) -> Result<HostNode> {
        if host.base.flag == NodeFlag::Group {
            return Ok(host);
        }
        if host.unpacked_active {
            let id = host.node_id();
            let visit = self.load_visit(id)?.ok_or_else(|| {
                Error::MissingNode(format!("active visit of host node (id: {id})"))
            })?;
            host.visit = Some(Box::new(visit));
            host.unpacked_active = false;
        }
        if host.spammer {
            self.spammers.insert(host.key());
        }
        Ok(host)
    }

    /// Loads an active visit row, resolving its last URL: an in-memory URL
    /// node gains a reference, a missing one is materialized from the
    /// store first.
    fn load_visit(&mut self, id: u64) -> Result<Option<VisitNode>> {
        let Some(mut visit) = self.storage.get_node::<VisitNode>(id)? else {
            return Ok(None);
        };
        if visit.last_url_id != 0 {
            let url = self
                .storage
                .get_node::<UrlNode>(visit.last_url_id)?
                .ok_or_else(|| {
                    Error::MissingNode(format!(
                        "last URL (id: {}) of active visit (id: {id})",
                        visit.last_url_id
                    ))
                })?;
            let hashval = UrlNode::key_hash(url.key());
            let key = url.key().to_string();
            match self.urls.find_mut(hashval, |n| n.key() == key) {
                Some(existing) => existing.vstref += 1,
                None => {
                    let mut url = url;
                    url.vstref = 1;
                    self.urls.put(hashval, url);
                }
            }
            visit.last_url_key = key;
        }
        Ok(Some(visit))
    }

    /// Loads a download by id, resolving its active job and owning host.
    /// The host lands in the host table (with its own visit resolved)
    /// unless it is already there.
    pub fn load_download(&mut self, id: u64) -> Result<Option<DownloadNode>> {
        let Some(mut download) = self.storage.get_node::<DownloadNode>(id)? else {
            return Ok(None);
        };
        if download.unpacked_active {
            let job = self
                .storage
                .get_node::<ActiveDownloadNode>(id)?
                .ok_or_else(|| {
                    Error::MissingNode(format!("active job of download node (id: {id})"))
                })?;
            download.job = Some(Box::new(job));
            download.unpacked_active = false;
        }
        if download.host_id != 0 {
            let host = self
                .storage
                .get_node::<HostNode>(download.host_id)?
                .ok_or_else(|| {
                    Error::MissingNode(format!(
                        "host node (id: {}) of download node (id: {id})",
                        download.host_id
                    ))
                })?;
            let hashval = HostNode::key_hash(host.key());
            let key = host.key().to_string();
            download.host_key = key.clone();
            let pinned = download.job.is_some();
            // a host already in the table has its references resolved
            match self.hosts.find_mut(hashval, |n| n.key() == key) {
                Some(existing) => {
                    if pinned {
                        existing.dlref += 1;
                    }
                }
                None => {
                    let mut host = self.resolve_host(host)?;
                    host.dlref = if pinned { 1 } else { 0 };
                    self.hosts.put(hashval, host);
                }
            }
        }
        Ok(Some(download))
    }

    /// Report-side host load: resolves the active visit without touching
    /// any in-memory table.
    pub fn load_host_report(&self, id: u64) -> Result<Option<HostNode>> {
        let Some(mut host) = self.storage.get_node::<HostNode>(id)? else {
            return Ok(None);
        };
        if host.base.flag == NodeFlag::Group {
            return Ok(Some(host));
        }
        if host.unpacked_active {
            let mut visit = self
                .storage
                .get_node::<VisitNode>(id)?
                .ok_or_else(|| {
                    Error::MissingNode(format!("active visit of host node (id: {id})"))
                })?;
            if visit.last_url_id != 0 {
                let url = self
                    .storage
                    .get_node::<UrlNode>(visit.last_url_id)?
                    .ok_or_else(|| {
                        Error::MissingNode(format!(
                            "last URL (id: {}) of active visit (id: {id})",
                            visit.last_url_id
                        ))
                    })?;
                visit.last_url_key = url.key().to_string();
            }
            host.visit = Some(Box::new(visit));
            host.unpacked_active = false;
        }
        Ok(Some(host))
    }

    /// Report-side download load: the materialized host is owned by the
    /// returned node and no table is touched.
    pub fn load_download_report(&self, id: u64) -> Result<Option<DownloadNode>> {
        let Some(mut download) = self.storage.get_node::<DownloadNode>(id)? else {
            return Ok(None);
        };
        if download.unpacked_active {
            let job = self
                .storage
                .get_node::<ActiveDownloadNode>(id)?
                .ok_or_else(|| {
                    Error::MissingNode(format!("active job of download node (id: {id})"))
                })?;
            download.job = Some(Box::new(job));
            download.unpacked_active = false;
        }
        if download.host_id != 0 {
            let host = self
                .storage
                .get_node::<HostNode>(download.host_id)?
                .ok_or_else(|| {
                    Error::MissingNode(format!(
                        "host node (id: {}) of download node (id: {id})",
                        download.host_id
                    ))
                })?;
            download.host_key = host.key().to_string();
            download.own_host = Some(Box::new(host));
        }
        Ok(Some(download))
    }

    // ----------------------------------------------------------------
    // report scans
    // ----------------------------------------------------------------

    /// Top hosts by hit count, with active visits resolved report-side.
    pub fn hosts_by_hits(&self, limit: usize) -> Result<Vec<HostNode>> {
        let mut out = Vec::new();
        for node in self.storage.scan_index::<HostNode>("hits", false)? {
            if out.len() == limit {
                break;
            }
            let node = node?;
            let node = self
                .load_host_report(node.node_id())?
                .ok_or_else(|| Error::MissingNode(format!("host node (id: {})", node.node_id())))?;
            out.push(node);
        }
        Ok(out)
    }

    /// Top downloads by transfer, with jobs and owning hosts resolved
    /// report-side.
    pub fn downloads_by_xfer(&self, limit: usize) -> Result<Vec<DownloadNode>> {
        let mut out = Vec::new();
        for node in self.storage.scan_index::<DownloadNode>("xfer", false)? {
            if out.len() == limit {
                break;
            }
            let node = node?;
            let node = self.load_download_report(node.node_id())?.ok_or_else(|| {
                Error::MissingNode(format!("download node (id: {})", node.node_id()))
            })?;
            out.push(node);
        }
        Ok(out)
    }

    // ----------------------------------------------------------------
    // helpers
    // ----------------------------------------------------------------

    fn save_table<N, F>(&mut self, table: F) -> Result<()>
    where
        N: StoreNode + Clone + Dirty,
        F: Fn(&State) -> &HashTable<N>,
    {
        let nodes: Vec<N> = table(self)
            .iter()
            .filter(|n| n.is_dirty())
            .cloned()
            .collect();
        for node in nodes {
            self.storage.put_node(&node)?;
        }
        Ok(())
    }

    /// Folds ended visits parked on group hosts into their visit stats.
    fn fold_group_visits(&mut self) {
        for host in self.hosts.iter_mut() {
            if host.grp_visits.is_empty() {
                continue;
            }
            for visit in host.grp_visits.drain(..) {
                host.visits += 1;
                let duration = visit.duration().max(0) as u64;
                host.visit_avg +=
                    (duration as f64 - host.visit_avg) / host.visits as f64;
                if duration > host.visit_max {
                    host.visit_max = duration;
                }
                if visit.converted {
                    host.visits_conv += 1;
                }
            }
            host.dirty = true;
        }
    }

    fn update_current_history(&mut self) {
        let ts = self.totals.cur_tstamp;
        if ts.is_null() {
            return;
        }
        self.history.update(
            ts.year as u32,
            ts.month as u32,
            self.totals.t_hit,
            self.totals.t_file,
            self.totals.t_page,
            self.totals.t_visits,
            self.totals.t_hosts,
            self.totals.t_xfer / 1024,
            self.totals.f_day,
            self.totals.l_day,
        );
    }

    fn set_table_flags(&mut self, cleared: bool, swapped_out: bool) {
        self.hosts.set_cleared(cleared);
        self.urls.set_cleared(cleared);
        self.referrers.set_cleared(cleared);
        self.agents.set_cleared(cleared);
        self.searches.set_cleared(cleared);
        self.users.set_cleared(cleared);
        self.errors.set_cleared(cleared);
        self.downloads.set_cleared(cleared);

        self.hosts.set_swapped_out(swapped_out);
        self.urls.set_swapped_out(swapped_out);
        self.referrers.set_swapped_out(swapped_out);
        self.agents.set_swapped_out(swapped_out);
        self.searches.set_swapped_out(swapped_out);
        self.users.set_swapped_out(swapped_out);
        self.errors.set_swapped_out(swapped_out);
        self.downloads.set_swapped_out(swapped_out);
    }

    fn reset_time_tables(&mut self) {
        for (i, node) in self.t_daily.iter_mut().enumerate() {
            node.reset(i as u32 + 1);
        }
        for (i, node) in self.t_hourly.iter_mut().enumerate() {
            node.reset(i as u32);
        }
    }

    fn clear_tables(&mut self) {
        self.downloads.clear();
        self.hosts.clear();
        self.urls.clear();
        self.referrers.clear();
        self.agents.clear();
        self.searches.clear();
        self.users.clear();
        self.errors.clear();
        self.spammers.clear();
        self.cities.clear();
    }
}

/// Dirty-node filter used by the generic table save.
pub trait Dirty {
    fn is_dirty(&self) -> bool;
}

macro_rules! impl_dirty {
    ($($node:ty),*) => {
        $(impl Dirty for $node {
            fn is_dirty(&self) -> bool {
                self.dirty
            }
        })*
    };
}

impl_dirty!(
    HostNode,
    UrlNode,
    ReferrerNode,
    AgentNode,
    SearchNode,
    UserNode,
    ErrorNode,
    DownloadNode
);

/// Running-mean and maximum update: `avg' = avg + (x - avg) / n`.
fn update_avg_max(avg: &mut f64, max: &mut u64, value: u64, count: u64) {
    *avg += (value as f64 - *avg) / count as f64;
    if value > *max {
        *max = value;
    }
}
