//! Record aggregation.
//!
//! One pre-classified log record flows through the time machine, the
//! global counters, and every per-kind table: URL first (so the visit can
//! reference it), then host and visit, then the remaining aggregates.
//! Lookups on a swapped-out table consult the store before concluding a
//! key is new.

use crate::config::find_group;
use crate::error::{Error, Result};
use crate::node::agent::AgentNode;
use crate::node::city::CityNode;
use crate::node::download::{ActiveDownloadNode, DownloadNode};
use crate::node::errors::ErrorNode;
use crate::node::host::HostNode;
use crate::node::referrer::ReferrerNode;
use crate::node::search::SearchNode;
use crate::node::url::{UrlNode, UrlType};
use crate::node::user::UserNode;
use crate::node::visit::VisitNode;
use crate::node::{NodeKind, StoreNode};
use crate::record::LogRecord;
use crate::state::State;
use crate::tstamp::Tstamp;

impl State {
    /// Aggregates one log record. Records are expected in time order; a
    /// record from a later month finalizes and rolls the current one over
    /// first.
    pub fn process_record(&mut self, rec: &LogRecord) -> Result<()> {
        if rec.tstamp.is_null() {
            return Err(crate::errinput!("log record carries no timestamp"));
        }
        let day = rec.tstamp.day as usize;
        let hour = rec.tstamp.hour as usize;
        if !(1..=31).contains(&day) || hour > 23 {
            return Err(crate::errinput!("timestamp day {day} hour {hour} out of range"));
        }

        if !self.totals.cur_tstamp.is_null() && rec.tstamp.new_month(&self.totals.cur_tstamp) {
            self.end_month()?;
        }

        self.set_tstamp(&rec.tstamp);
        self.count_record(rec, day - 1, hour);

        let (url_id, url_key) = self.update_url(rec)?;
        let visit_started = self.update_host(rec, url_id, &url_key)?;
        self.update_geo(rec, visit_started);
        self.update_referrer(rec, visit_started)?;
        self.update_agent(rec, visit_started)?;
        self.update_user(rec, visit_started)?;
        self.update_search(rec, visit_started)?;
        if rec.status >= 400 {
            self.update_error(rec)?;
        }
        if rec.download.is_some() {
            self.update_download(rec)?;
        }

        self.maybe_swap_out()?;
        Ok(())
    }

    /// Finalizes the month in progress: ends every active entity, folds
    /// the last hour, writes the finalized history row, saves, and rolls
    /// the database over.
    pub fn end_month(&mut self) -> Result<()> {
        self.end_all_visits()?;
        self.end_all_downloads()?;
        self.update_hourly_stats();
        // the last day's host count has no day transition to snapshot it
        let day = self.totals.cur_tstamp.day as usize;
        if (1..=31).contains(&day) {
            self.t_daily[day - 1].tm_hosts = self.totals.dt_hosts;
            self.totals.dt_hosts = 0;
        }
        self.save_state()?;
        tracing::info!(
            year = self.totals.cur_tstamp.year,
            month = self.totals.cur_tstamp.month,
            hits = self.totals.t_hit,
            "month finalized"
        );
        self.clear_month()
    }

    // ----------------------------------------------------------------
    // counters
    // ----------------------------------------------------------------

    fn count_record(&mut self, rec: &LogRecord, day: usize, hour: usize) {
        self.totals.t_hit += 1;
        self.totals.ht_hits += 1;
        self.totals.t_xfer += rec.xfer;
        self.totals.ht_xfer += rec.xfer;
        self.t_daily[day].tm_hits += 1;
        self.t_daily[day].tm_xfer += rec.xfer;
        self.t_hourly[hour].th_hits += 1;
        self.t_hourly[hour].th_xfer += rec.xfer;

        if rec.file {
            self.totals.t_file += 1;
            self.totals.ht_files += 1;
            self.t_daily[day].tm_files += 1;
            self.t_hourly[hour].th_files += 1;
        }
        if rec.page {
            self.totals.t_page += 1;
            self.totals.ht_pages += 1;
            self.t_daily[day].tm_pages += 1;
            self.t_hourly[hour].th_pages += 1;
        }

        // robots and spammers count into the main totals and additionally
        // into their own
        if rec.robot {
            self.totals.t_rhits += 1;
            self.totals.t_rxfer += rec.xfer;
            if rec.file {
                self.totals.t_rfiles += 1;
            }
            if rec.page {
                self.totals.t_rpages += 1;
            }
        }
        if rec.spammer {
            self.totals.t_spmhits += 1;
        }

        self.response.get_mut(rec.status).count += 1;
    }

    // ----------------------------------------------------------------
    // URLs
    // ----------------------------------------------------------------

    fn update_url(&mut self, rec: &LogRecord) -> Result<(u64, String)> {
        let key = rec.url.clone();
        let hashval = UrlNode::key_hash(&key);

        if self.urls.find(hashval, |n| n.key() == key && !n.base.flag.is_group()).is_none() {
            let stored = if self.urls.is_swapped_out() {
                self.storage
                    .find_by_value::<UrlNode, _>(hashval, |n| {
                        n.key() == key && !n.base.flag.is_group()
                    })?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = UrlNode::new(key.clone());
                    node.base.id = self.storage.next_id(NodeKind::Url)?;
                    self.totals.t_url += 1;
                    node
                }
            };
            self.urls.put(hashval, node);
        }

        let node = self
            .urls
            .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .expect("url node was just ensured");
        node.hits += 1;
        node.xfer += rec.xfer;
        node.url_type = node.url_type.combine(if rec.secure {
            UrlType::Https
        } else {
            UrlType::Http
        });
        if rec.target {
            node.target = true;
        }
        if rec.proctime > 0.0 {
            node.update_time(rec.proctime);
        }
        node.dirty = true;
        let url_id = node.base.id;

        if let Some(group) = find_group(&self.config.group_urls, &key).map(str::to_string) {
            self.update_url_group(&group, rec)?;
        }

        Ok((url_id, key))
    }

    fn update_url_group(&mut self, group: &str, rec: &LogRecord) -> Result<()> {
        let hashval = UrlNode::key_hash(group);
        if self
            .urls
            .find(hashval, |n| n.key() == group && n.base.flag.is_group())
            .is_none()
        {
            let mut node = UrlNode::group(group);
            node.base.id = self.storage.next_id(NodeKind::Url)?;
            self.totals.t_grp_urls += 1;
            self.urls.put(hashval, node);
        }
        let node = self
            .urls
            .find_mut(hashval, |n| n.key() == group && n.base.flag.is_group())
            .expect("group url node was just ensured");
        node.hits += 1;
        node.xfer += rec.xfer;
        node.dirty = true;
        Ok(())
    }

    // ----------------------------------------------------------------
    // hosts and visits
    // ----------------------------------------------------------------

    /// Updates the host and its visit. Returns whether a new visit
    /// started with this record.
    fn update_host(&mut self, rec: &LogRecord, url_id: u64, url_key: &str) -> Result<bool> {
        let key = rec.host.clone();
        let hashval = HostNode::key_hash(&key);

        let mut created = false;
        if self
            .hosts
            .find(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .is_none()
        {
            let stored = if self.hosts.is_swapped_out() {
                // a swapped-out host never carries an active visit
                self.storage.find_by_value::<HostNode, _>(hashval, |n| {
                    n.key() == key && !n.base.flag.is_group()
                })?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = HostNode::new(key.clone());
                    node.base.id = self.storage.next_id(NodeKind::Host)?;
                    created = true;
                    node
                }
            };
            self.hosts.put(hashval, node);
        }

        let must_end = {
            let node = self
                .hosts
                .find(hashval, |n| n.key() == key && !n.base.flag.is_group())
                .expect("host node was just ensured");
            match node.visit.as_ref() {
                Some(visit) => rec.tstamp.elapsed(&visit.last) >= self.config.visit_timeout,
                None => false,
            }
        };

        if created {
            self.totals.t_hosts += 1;
            // the daily and hourly host counters accumulate first-in-month
            // observations, so their sums reconcile with the distinct count
            self.totals.dt_hosts += 1;
            self.totals.ht_hosts += 1;
            if rec.robot {
                self.totals.t_rhosts += 1;
            }
            if rec.spammer {
                self.totals.t_sphosts += 1;
            }
        }

        if must_end {
            self.end_visit(&key, Some(rec.tstamp))?;
        }

        // mutate the host itself
        {
            let node = self
                .hosts
                .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
                .expect("host node was just ensured");
            node.hits += 1;
            node.xfer += rec.xfer;
            if rec.file {
                node.files += 1;
            }
            if rec.page {
                node.pages += 1;
            }
            node.tstamp = rec.tstamp;
            if rec.robot {
                node.robot = true;
            }
            if let Some(ccode) = rec.country.as_deref() {
                node.set_ccode(ccode);
            }
            if let Some(city) = rec.city.as_deref() {
                if node.city.is_empty() {
                    node.city = city.to_string();
                }
            }
            node.dirty = true;
        }
        if rec.spammer {
            self.flag_spammer(&key);
        }

        // visit bookkeeping
        let (visit_started, old_url_key, converted_now) = {
            let node = self
                .hosts
                .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
                .expect("host node was just ensured");
            match node.visit.as_mut() {
                Some(visit) => {
                    visit.hits += 1;
                    visit.xfer += rec.xfer;
                    if rec.file {
                        visit.files += 1;
                    }
                    if rec.page {
                        visit.pages += 1;
                    }
                    visit.last = rec.tstamp;
                    let old = if visit.last_url_key != url_key {
                        let old = std::mem::replace(&mut visit.last_url_key, url_key.to_string());
                        visit.last_url_id = url_id;
                        Some(old)
                    } else {
                        None
                    };
                    let converted_now = rec.target && !visit.converted;
                    if converted_now {
                        visit.converted = true;
                    }
                    visit.dirty = true;
                    (false, old, converted_now)
                }
                None => {
                    let mut visit = VisitNode::new(node.base.id);
                    visit.hits = 1;
                    visit.xfer = rec.xfer;
                    visit.files = rec.file as u64;
                    visit.pages = rec.page as u64;
                    visit.start = rec.tstamp;
                    visit.last = rec.tstamp;
                    visit.robot = rec.robot;
                    visit.converted = rec.target;
                    visit.entry_seen = true;
                    visit.last_url_id = url_id;
                    visit.last_url_key = url_key.to_string();
                    visit.dirty = true;
                    node.visit = Some(Box::new(visit));
                    node.visits += 1;
                    node.dirty = true;
                    (true, None, rec.target)
                }
            }
        };

        if converted_now {
            self.totals.t_visits_conv += 1;
            let node = self
                .hosts
                .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
                .expect("host node was just ensured");
            node.visits_conv += 1;
            if node.visits_conv == 1 {
                self.totals.t_hosts_conv += 1;
            }
        }

        // URL reference counts follow the visit's last URL
        if visit_started {
            let day = rec.tstamp.day as usize - 1;
            self.totals.t_visits += 1;
            self.totals.ht_visits += 1;
            self.t_daily[day].tm_visits += 1;
            if rec.robot {
                self.totals.t_rvisits += 1;
            }
            self.totals.t_entry += 1;
            if let Some(url) = self.find_url_mut(url_key) {
                url.entry += 1;
                url.vstref += 1;
                url.dirty = true;
            }
        } else if let Some(old_key) = old_url_key {
            if let Some(url) = self.find_url_mut(url_key) {
                url.vstref += 1;
            }
            if let Some(url) = self.find_url_mut(&old_key) {
                url.vstref = url.vstref.saturating_sub(1);
            }
        }

        // group hosts accumulate raw traffic as it happens
        if let Some(group) = find_group(&self.config.group_hosts, &key).map(str::to_string) {
            self.update_host_group(&group, rec)?;
        }

        Ok(visit_started)
    }

    fn update_host_group(&mut self, group: &str, rec: &LogRecord) -> Result<()> {
        let hashval = HostNode::key_hash(group);
        if self
            .hosts
            .find(hashval, |n| n.key() == group && n.base.flag.is_group())
            .is_none()
        {
            let mut node = HostNode::group(group);
            node.base.id = self.storage.next_id(NodeKind::Host)?;
            self.totals.t_grp_hosts += 1;
            self.hosts.put(hashval, node);
        }
        let node = self
            .hosts
            .find_mut(hashval, |n| n.key() == group && n.base.flag.is_group())
            .expect("group host node was just ensured");
        node.hits += 1;
        node.xfer += rec.xfer;
        if rec.file {
            node.files += 1;
        }
        if rec.page {
            node.pages += 1;
        }
        node.tstamp = rec.tstamp;
        node.dirty = true;
        Ok(())
    }

    /// Closes the host's visit, folding its totals into the host and the
    /// month. `at` is the observation that closed it; a visit closed at
    /// end of data keeps its last-activity time as the end.
    pub fn end_visit(&mut self, host_key: &str, at: Option<Tstamp>) -> Result<()> {
        let hashval = HostNode::key_hash(host_key);
        let pred = |n: &HostNode| n.key() == host_key && !n.base.flag.is_group();

        let Some(visit) = self.hosts.find_mut(hashval, pred).and_then(|h| h.visit.take()) else {
            return Ok(());
        };

        let end = at.unwrap_or(visit.last);
        let duration = end.elapsed(&visit.start).max(0) as u64;

        {
            let host = self
                .hosts
                .find_mut(hashval, pred)
                .expect("host owned the visit just taken");
            host.visit_avg += (duration as f64 - host.visit_avg) / host.visits as f64;
            if duration > host.visit_max {
                host.visit_max = duration;
            }
            host.max_v_hits = host.max_v_hits.max(visit.hits);
            host.max_v_files = host.max_v_files.max(visit.files);
            host.max_v_pages = host.max_v_pages.max(visit.pages);
            host.max_v_xfer = host.max_v_xfer.max(visit.xfer);
            host.dirty = true;
        }

        self.totals.t_visit_avg +=
            (duration as f64 - self.totals.t_visit_avg) / self.totals.t_visits.max(1) as f64;
        if duration > self.totals.t_visit_max {
            self.totals.t_visit_max = duration;
        }
        self.totals.max_v_hits = self.totals.max_v_hits.max(visit.hits);
        self.totals.max_v_files = self.totals.max_v_files.max(visit.files);
        self.totals.max_v_pages = self.totals.max_v_pages.max(visit.pages);
        self.totals.max_v_xfer = self.totals.max_v_xfer.max(visit.xfer);

        // the visit's last URL becomes an exit URL and drops its pin
        if !visit.last_url_key.is_empty() {
            self.totals.t_exit += 1;
            let last_url_key = visit.last_url_key.clone();
            if let Some(url) = self.find_url_mut(&last_url_key) {
                url.exit += 1;
                url.vstref = url.vstref.saturating_sub(1);
                url.dirty = true;
            }
        }

        self.v_ended.push(visit.id);

        // park a copy on the matching group host until save folds it
        if let Some(group) = find_group(&self.config.group_hosts, host_key).map(str::to_string) {
            let ghash = HostNode::key_hash(&group);
            if let Some(ghost) = self
                .hosts
                .find_mut(ghash, |n| n.key() == group && n.base.flag.is_group())
            {
                ghost.grp_visits.push((*visit).clone());
            }
        }

        Ok(())
    }

    /// Ends every open visit, at the end of the month or of all input.
    pub fn end_all_visits(&mut self) -> Result<()> {
        let keys: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| h.visit.is_some())
            .map(|h| h.key().to_string())
            .collect();
        for key in keys {
            self.end_visit(&key, None)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // countries and cities
    // ----------------------------------------------------------------

    fn update_geo(&mut self, rec: &LogRecord, visit_started: bool) {
        let ccode = rec.country.as_deref().unwrap_or("*");
        let country = self.countries.get_mut(ccode);
        country.hits += 1;
        country.xfer += rec.xfer;
        if rec.file {
            country.files += 1;
        }
        if rec.page {
            country.pages += 1;
        }
        if visit_started {
            country.visits += 1;
        }

        let city = rec.city.as_deref().unwrap_or("");
        let geoname_id = if city.is_empty() { 0 } else { rec.geoname_id };
        let hashval = CityNode::key_hash(geoname_id, ccode);
        let nodeid = CityNode::make_nodeid(geoname_id, ccode);
        if self
            .cities
            .find(hashval, |n| n.node_id() == nodeid)
            .is_none()
        {
            match CityNode::new(geoname_id, city, ccode) {
                Ok(node) => {
                    self.cities.put(hashval, node);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed city");
                    return;
                }
            }
        }
        let node = self
            .cities
            .find_mut(hashval, |n| n.node_id() == nodeid)
            .expect("city node was just ensured");
        node.hits += 1;
        node.xfer += rec.xfer;
        if rec.file {
            node.files += 1;
        }
        if rec.page {
            node.pages += 1;
        }
        if visit_started {
            node.visits += 1;
        }
    }

    // ----------------------------------------------------------------
    // referrers, agents, users, searches, errors
    // ----------------------------------------------------------------

    fn update_referrer(&mut self, rec: &LogRecord, visit_started: bool) -> Result<()> {
        let Some(key) = rec.referrer.clone() else {
            return Ok(());
        };
        let hashval = ReferrerNode::key_hash(&key);
        if self
            .referrers
            .find(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .is_none()
        {
            let stored = if self.referrers.is_swapped_out() {
                self.storage.find_by_value::<ReferrerNode, _>(hashval, |n| {
                    n.key() == key && !n.base.flag.is_group()
                })?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = ReferrerNode::new(key.clone());
                    node.base.id = self.storage.next_id(NodeKind::Referrer)?;
                    self.totals.t_ref += 1;
                    node
                }
            };
            self.referrers.put(hashval, node);
        }
        let node = self
            .referrers
            .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .expect("referrer node was just ensured");
        node.hits += 1;
        if visit_started {
            node.visits += 1;
        }
        node.dirty = true;

        if let Some(group) = find_group(&self.config.group_refs, &key).map(str::to_string) {
            let ghash = ReferrerNode::key_hash(&group);
            if self
                .referrers
                .find(ghash, |n| n.key() == group && n.base.flag.is_group())
                .is_none()
            {
                let mut node = ReferrerNode::group(group.clone());
                node.base.id = self.storage.next_id(NodeKind::Referrer)?;
                self.totals.t_grp_refs += 1;
                self.referrers.put(ghash, node);
            }
            let node = self
                .referrers
                .find_mut(ghash, |n| n.key() == group && n.base.flag.is_group())
                .expect("group referrer node was just ensured");
            node.hits += 1;
            node.dirty = true;
        }
        Ok(())
    }

    fn update_agent(&mut self, rec: &LogRecord, visit_started: bool) -> Result<()> {
        let Some(key) = rec.agent.clone() else {
            return Ok(());
        };
        let hashval = AgentNode::key_hash(&key);
        if self
            .agents
            .find(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .is_none()
        {
            let stored = if self.agents.is_swapped_out() {
                self.storage
                    .find_by_value::<AgentNode, _>(hashval, |n| {
                        n.key() == key && !n.base.flag.is_group()
                    })?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = AgentNode::new(key.clone());
                    node.base.id = self.storage.next_id(NodeKind::Agent)?;
                    self.totals.t_agent += 1;
                    node
                }
            };
            self.agents.put(hashval, node);
        }
        let node = self
            .agents
            .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .expect("agent node was just ensured");
        node.hits += 1;
        node.xfer += rec.xfer;
        if rec.robot {
            node.robot = true;
        }
        if visit_started {
            node.visits += 1;
        }
        node.dirty = true;

        if let Some(group) = find_group(&self.config.group_agents, &key).map(str::to_string) {
            let ghash = AgentNode::key_hash(&group);
            if self
                .agents
                .find(ghash, |n| n.key() == group && n.base.flag.is_group())
                .is_none()
            {
                let mut node = AgentNode::group(group.clone());
                node.base.id = self.storage.next_id(NodeKind::Agent)?;
                self.totals.t_grp_agents += 1;
                self.agents.put(ghash, node);
            }
            let node = self
                .agents
                .find_mut(ghash, |n| n.key() == group && n.base.flag.is_group())
                .expect("group agent node was just ensured");
            node.hits += 1;
            if visit_started {
                node.visits += 1;
            }
            node.dirty = true;
        }
        Ok(())
    }

    fn update_user(&mut self, rec: &LogRecord, visit_started: bool) -> Result<()> {
        let Some(key) = rec.user.clone() else {
            return Ok(());
        };
        let hashval = UserNode::key_hash(&key);
        if self
            .users
            .find(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .is_none()
        {
            let stored = if self.users.is_swapped_out() {
                self.storage.find_by_value::<UserNode, _>(hashval, |n| {
                    n.key() == key && !n.base.flag.is_group()
                })?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = UserNode::new(key.clone());
                    node.base.id = self.storage.next_id(NodeKind::User)?;
                    self.totals.t_user += 1;
                    node
                }
            };
            self.users.put(hashval, node);
        }
        let node = self
            .users
            .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
            .expect("user node was just ensured");
        node.hits += 1;
        node.xfer += rec.xfer;
        if rec.file {
            node.files += 1;
        }
        if visit_started {
            node.visits += 1;
        }
        if rec.proctime > 0.0 {
            node.update_time(rec.proctime);
        }
        node.dirty = true;

        if let Some(group) = find_group(&self.config.group_users, &key).map(str::to_string) {
            let ghash = UserNode::key_hash(&group);
            if self
                .users
                .find(ghash, |n| n.key() == group && n.base.flag.is_group())
                .is_none()
            {
                let mut node = UserNode::group(group.clone());
                node.base.id = self.storage.next_id(NodeKind::User)?;
                self.totals.t_grp_users += 1;
                self.users.put(ghash, node);
            }
            let node = self
                .users
                .find_mut(ghash, |n| n.key() == group && n.base.flag.is_group())
                .expect("group user node was just ensured");
            node.hits += 1;
            node.dirty = true;
        }
        Ok(())
    }

    fn update_search(&mut self, rec: &LogRecord, visit_started: bool) -> Result<()> {
        if rec.search_terms.is_empty() {
            return Ok(());
        }
        let (key, termcnt) = SearchNode::pack_terms(
            rec.search_terms
                .iter()
                .map(|(t, s)| (t.as_str(), s.as_str())),
        );
        let hashval = SearchNode::key_hash(&key);
        if self.searches.find(hashval, |n| n.key() == key).is_none() {
            let stored = if self.searches.is_swapped_out() {
                self.storage
                    .find_by_value::<SearchNode, _>(hashval, |n| n.key() == key)?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = SearchNode::new(key.clone(), termcnt);
                    node.base.id = self.storage.next_id(NodeKind::Search)?;
                    self.totals.t_search += 1;
                    node
                }
            };
            self.searches.put(hashval, node);
        }
        let node = self
            .searches
            .find_mut(hashval, |n| n.key() == key)
            .expect("search node was just ensured");
        node.hits += 1;
        if visit_started {
            node.visits += 1;
        }
        node.dirty = true;
        self.totals.t_srchits += 1;
        Ok(())
    }

    fn update_error(&mut self, rec: &LogRecord) -> Result<()> {
        let hashval = ErrorNode::key_hash(&rec.method, &rec.url, rec.status);
        if self
            .errors
            .find(hashval, |n| n.matches(&rec.method, &rec.url, rec.status))
            .is_none()
        {
            let stored = if self.errors.is_swapped_out() {
                self.storage.find_by_value::<ErrorNode, _>(hashval, |n| {
                    n.matches(&rec.method, &rec.url, rec.status)
                })?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let mut node = ErrorNode::new(rec.method.clone(), rec.url.clone(), rec.status);
                    node.base.id = self.storage.next_id(NodeKind::Error)?;
                    node
                }
            };
            self.errors.put(hashval, node);
        }
        let node = self
            .errors
            .find_mut(hashval, |n| n.matches(&rec.method, &rec.url, rec.status))
            .expect("error node was just ensured");
        node.hits += 1;
        node.dirty = true;
        self.totals.t_err += 1;
        Ok(())
    }

    // ----------------------------------------------------------------
    // downloads
    // ----------------------------------------------------------------

    fn update_download(&mut self, rec: &LogRecord) -> Result<()> {
        let Some(name) = rec.download.clone() else {
            return Ok(());
        };
        let host_key = rec.host.clone();
        let hashval = DownloadNode::key_hash(&host_key, &name);
        let pred = |n: &DownloadNode| {
            n.name() == name && n.host_key == host_key && !n.base.flag.is_group()
        };

        if self.downloads.find(hashval, pred).is_none() {
            let stored = if self.downloads.is_swapped_out() {
                self.storage.find_download(&host_key, &name)?
            } else {
                None
            };
            let node = match stored {
                Some(node) => node,
                None => {
                    let host_id = self
                        .hosts
                        .find(HostNode::key_hash(&host_key), |n| {
                            n.key() == host_key && !n.base.flag.is_group()
                        })
                        .map(|n| n.base.id)
                        .ok_or_else(|| {
                            Error::MissingNode(format!(
                                "host {host_key} of a download must be aggregated first"
                            ))
                        })?;
                    let mut node = DownloadNode::new(host_key.clone(), name.clone());
                    node.base.id = self.storage.next_id(NodeKind::Download)?;
                    node.host_id = host_id;
                    self.totals.t_downloads += 1;
                    node
                }
            };
            self.downloads.put(hashval, node);
        }

        // a stale job finishes before this record opens a new one
        let stale = self
            .downloads
            .find(hashval, pred)
            .and_then(|n| n.job.as_ref())
            .map(|job| rec.tstamp.elapsed(&job.tstamp) >= self.config.download_timeout)
            .unwrap_or(false);
        if stale {
            self.end_download_job(&host_key, &name, Some(rec.tstamp))?;
        }

        let started = {
            let node = self
                .downloads
                .find_mut(hashval, pred)
                .expect("download node was just ensured");
            match node.job.as_mut() {
                Some(job) => {
                    let elapsed = rec.tstamp.elapsed(&job.tstamp).max(0);
                    job.hits += 1;
                    job.xfer += rec.xfer;
                    job.proctime += elapsed as f64 / 60.0;
                    job.tstamp = rec.tstamp;
                    job.dirty = true;
                    false
                }
                None => {
                    let mut job = ActiveDownloadNode::new(node.base.id);
                    job.hits = 1;
                    job.xfer = rec.xfer;
                    job.tstamp = rec.tstamp;
                    job.dirty = true;
                    node.job = Some(Box::new(job));
                    node.dirty = true;
                    true
                }
            }
        };

        if started {
            // the open job pins the owning host in memory
            if let Some(host) = self.hosts.find_mut(HostNode::key_hash(&host_key), |n| {
                n.key() == host_key && !n.base.flag.is_group()
            }) {
                host.dlref += 1;
            }
        }

        if let Some(group) = find_group(&self.config.group_downloads, &name).map(str::to_string) {
            let ghash = DownloadNode::key_hash("", &group);
            if self
                .downloads
                .find(ghash, |n| n.name() == group && n.base.flag.is_group())
                .is_none()
            {
                let mut node = DownloadNode::group(group.clone());
                node.base.id = self.storage.next_id(NodeKind::Download)?;
                self.downloads.put(ghash, node);
            }
            let node = self
                .downloads
                .find_mut(ghash, |n| n.name() == group && n.base.flag.is_group())
                .expect("group download node was just ensured");
            node.hits += 1;
            node.xfer += rec.xfer;
            node.dirty = true;
        }

        Ok(())
    }

    /// Finishes a download job, folding it into its download node. A
    /// finished configured download converts the host's open visit.
    fn end_download_job(
        &mut self,
        host_key: &str,
        name: &str,
        at: Option<Tstamp>,
    ) -> Result<()> {
        let hashval = DownloadNode::key_hash(host_key, name);
        let pred =
            |n: &DownloadNode| n.name() == name && n.host_key == host_key && !n.base.flag.is_group();

        let Some(mut job) = self
            .downloads
            .find_mut(hashval, pred)
            .and_then(|n| n.job.take())
        else {
            return Ok(());
        };
        if let Some(at) = at {
            job.proctime += (at.elapsed(&job.tstamp).max(0) as f64 / 60.0).min(
                self.config.download_timeout as f64 / 60.0,
            );
        }

        {
            let node = self
                .downloads
                .find_mut(hashval, pred)
                .expect("download owned the job just taken");
            node.finish_job(&job);
            node.dirty = true;
        }
        self.totals.t_dlcount += 1;
        self.dl_ended.push(job.id);

        // release the host pin and convert its visit
        let hhash = HostNode::key_hash(host_key);
        let converted_now = {
            match self.hosts.find_mut(hhash, |n| {
                n.key() == host_key && !n.base.flag.is_group()
            }) {
                Some(host) => {
                    host.dlref = host.dlref.saturating_sub(1);
                    match host.visit.as_mut() {
                        Some(visit) if !visit.converted => {
                            visit.converted = true;
                            host.visits_conv += 1;
                            host.dirty = true;
                            Some(host.visits_conv == 1)
                        }
                        _ => None,
                    }
                }
                None => None,
            }
        };
        if let Some(first) = converted_now {
            self.totals.t_visits_conv += 1;
            if first {
                self.totals.t_hosts_conv += 1;
            }
        }
        Ok(())
    }

    /// Finishes every open download job.
    pub fn end_all_downloads(&mut self) -> Result<()> {
        let jobs: Vec<(String, String)> = self
            .downloads
            .iter()
            .filter(|n| n.job.is_some())
            .map(|n| (n.host_key.clone(), n.name().to_string()))
            .collect();
        for (host_key, name) in jobs {
            self.end_download_job(&host_key, &name, None)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // helpers
    // ----------------------------------------------------------------

    fn flag_spammer(&mut self, host_key: &str) {
        if !self.spammers.contains(host_key) {
            self.spammers.insert(host_key);
        }
        let hashval = HostNode::key_hash(host_key);
        if let Some(node) = self
            .hosts
            .find_mut(hashval, |n| n.key() == host_key && !n.base.flag.is_group())
        {
            if !node.spammer {
                node.spammer = true;
                node.dirty = true;
            }
        }
    }

    fn find_url_mut(&mut self, key: &str) -> Option<&mut UrlNode> {
        let hashval = UrlNode::key_hash(key);
        self.urls
            .find_mut(hashval, |n| n.key() == key && !n.base.flag.is_group())
    }

    fn maybe_swap_out(&mut self) -> Result<()> {
        let over_hosts =
            self.config.max_hosts != 0 && self.hosts.len() > self.config.max_hosts;
        let over_urls = self.config.max_urls != 0 && self.urls.len() > self.config.max_urls;
        if over_hosts || over_urls {
            self.swap_out()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupPattern, RunConfig};
    use crate::node::sysnode::VERSION;
    use tempfile::TempDir;

    fn ts(day: u8, hour: u8, min: u8, sec: u8) -> Tstamp {
        Tstamp::new(2020, 6, day, hour, min, sec, 0)
    }

    fn open_state(dir: &TempDir) -> State {
        let config = RunConfig::new(dir.path()).incremental(true);
        let mut state = State::new(config);
        state.initialize().unwrap();
        state.restore_state().unwrap();
        state
    }

    fn record(day: u8, hour: u8, host: &str, url: &str, xfer: u64) -> LogRecord {
        let mut rec = LogRecord::new(ts(day, hour, 0, 0), host, url);
        rec.xfer = xfer;
        rec
    }

    #[test]
    fn test_cold_start_single_record() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);

        let rec = record(15, 10, "10.0.0.1", "/a.html", 1024);
        state.process_record(&rec).unwrap();

        assert_eq!(state.totals.t_hit, 1);
        assert_eq!(state.totals.t_file, 1);
        assert_eq!(state.totals.t_page, 1);
        assert_eq!(state.totals.t_xfer, 1024);
        assert_eq!(state.totals.t_hosts, 1);
        assert_eq!(state.totals.t_url, 1);
        assert_eq!(state.totals.t_visits, 1);
        assert_eq!(state.t_daily[14].tm_hits, 1);
        assert_eq!(state.t_hourly[10].th_hits, 1);

        state.save_state().unwrap();
        state.cleanup().unwrap();

        // restore into a fresh state
        let mut state = open_state(&dir);
        assert_eq!(state.totals.t_hit, 1);
        assert_eq!(state.totals.t_xfer, 1024);
        assert_eq!(state.t_daily[14].tm_hits, 1);
        assert_eq!(state.t_hourly[10].th_hits, 1);

        // exactly one host row with the observed transfer
        let hosts: Vec<_> = state
            .storage
            .scan_primary::<HostNode>()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].xfer, 1024);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_visit_closes_after_timeout() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);

        state
            .process_record(&record(15, 10, "10.0.0.1", "/a.html", 100))
            .unwrap();
        let mut rec = record(15, 10, "10.0.0.1", "/b.html", 100);
        rec.tstamp = ts(15, 10, 0, 2);
        state.process_record(&rec).unwrap();

        // third request 45 minutes later; default timeout is 30 minutes
        let mut rec = record(15, 10, "10.0.0.1", "/c.html", 100);
        rec.tstamp = ts(15, 10, 45, 2);
        state.process_record(&rec).unwrap();

        assert_eq!(state.totals.t_visits, 2);
        assert_eq!(state.v_ended.len(), 1);
        assert!(state.totals.t_visit_max >= 45 * 60);

        let host = state
            .hosts
            .find(
                HostNode::key_hash("10.0.0.1"),
                |n: &HostNode| n.key() == "10.0.0.1",
            )
            .unwrap();
        assert_eq!(host.visits, 2);
        assert!(host.visit.is_some());

        state.save_state().unwrap();
        assert!(state.v_ended.is_empty());
        state.cleanup().unwrap();
    }

    #[test]
    fn test_swap_out_pins_active_host() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new(dir.path())
            .incremental(true)
            .memory_mode(false);
        let mut state = State::new(config);
        state.initialize().unwrap();
        state.restore_state().unwrap();

        for i in 0..2_000 {
            let host = format!("10.0.{}.{}", i / 250, i % 250);
            let mut rec = record(15, 10, &host, "/a.html", 10);
            rec.tstamp = ts(15, 10, (i / 60 % 60) as u8, (i % 60) as u8);
            state.process_record(&rec).unwrap();
        }
        // every host but the newest has timed out; close their visits so
        // only one active visit pins its host
        let keys: Vec<String> = state
            .hosts
            .iter()
            .filter(|h| h.visit.is_some())
            .map(|h| h.key().to_string())
            .filter(|k| k != "10.0.7.249")
            .collect();
        for key in keys {
            state.end_visit(&key, None).unwrap();
        }

        assert_eq!(state.hosts.len(), 2_000);
        state.swap_out().unwrap();

        assert_eq!(state.hosts.len(), 1);
        assert!(state.hosts.is_swapped_out());
        let kept = state
            .hosts
            .iter()
            .next()
            .unwrap();
        assert_eq!(kept.key(), "10.0.7.249");
        assert!(kept.visit.is_some());
        assert_eq!(state.storage.count(NodeKind::Host).unwrap(), 1_999);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_swapped_out_lookup_falls_through_to_store() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new(dir.path())
            .incremental(true)
            .memory_mode(false);
        let mut state = State::new(config);
        state.initialize().unwrap();
        state.restore_state().unwrap();

        state
            .process_record(&record(15, 10, "10.0.0.1", "/a.html", 100))
            .unwrap();
        state.end_visit("10.0.0.1", None).unwrap();
        state.swap_out().unwrap();
        assert_eq!(state.hosts.len(), 0);

        // the same host comes back: it must resume the stored counters
        // instead of starting a second node
        let mut rec = record(15, 11, "10.0.0.1", "/a.html", 100);
        rec.tstamp = ts(15, 11, 0, 0);
        state.process_record(&rec).unwrap();

        assert_eq!(state.totals.t_hosts, 1);
        let host = state
            .hosts
            .find(
                HostNode::key_hash("10.0.0.1"),
                |n: &HostNode| n.key() == "10.0.0.1",
            )
            .unwrap();
        assert_eq!(host.hits, 2);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_rollover_on_month_change() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);

        state
            .process_record(&record(30, 23, "10.0.0.1", "/a.html", 512))
            .unwrap();

        let mut rec = record(1, 0, "10.0.0.2", "/b.html", 256);
        rec.tstamp = Tstamp::new(2020, 7, 1, 0, 0, 0, 0);
        state.process_record(&rec).unwrap();

        // June went to the archive
        assert!(dir.path().join("logtally_202006.db").exists());
        // the active month only carries July's record
        assert_eq!(state.totals.t_hit, 1);
        assert_eq!(state.totals.t_hosts, 1);
        assert_eq!(state.totals.f_day, 1);
        assert_eq!(state.sysnode.appver, 0);

        // history kept June's finalized roll-up
        let june = state.history.get(2020, 6).unwrap();
        assert_eq!(june.hits, 1);
        assert_eq!(june.first_day, 30);
        assert_eq!(june.last_day, 30);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_hourly_stats_running_average() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);

        // three hits at 10:00, one at 11:00, then a record at 12:00
        for i in 0..3 {
            let mut rec = record(15, 10, "10.0.0.1", "/a.html", 10);
            rec.tstamp = ts(15, 10, 0, i);
            state.process_record(&rec).unwrap();
        }
        let mut rec = record(15, 11, "10.0.0.1", "/a.html", 10);
        rec.tstamp = ts(15, 11, 0, 0);
        state.process_record(&rec).unwrap();
        let mut rec = record(15, 12, "10.0.0.1", "/a.html", 10);
        rec.tstamp = ts(15, 12, 0, 0);
        state.process_record(&rec).unwrap();

        let daily = &state.t_daily[14];
        assert_eq!(daily.td_hours, 2);
        assert_eq!(daily.h_hits_max, 3);
        // running mean over the two closed hours: (3 + 1) / 2
        assert_eq!(daily.h_hits_avg, 2.0);
        assert_eq!(state.totals.hm_hit, 3);
        // the current hour's accumulator holds the last record
        assert_eq!(state.totals.ht_hits, 1);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_group_nodes_accumulate() {
        let dir = TempDir::new().unwrap();
        let mut config = RunConfig::new(dir.path()).incremental(true);
        config.group_hosts = vec![GroupPattern::new("10.0.0.", "lab")];
        let mut state = State::new(config);
        state.initialize().unwrap();
        state.restore_state().unwrap();

        state
            .process_record(&record(15, 10, "10.0.0.1", "/a.html", 100))
            .unwrap();
        state
            .process_record(&record(15, 10, "10.0.0.2", "/a.html", 100))
            .unwrap();

        assert_eq!(state.totals.t_hosts, 2);
        assert_eq!(state.totals.t_grp_hosts, 1);
        let group = state
            .hosts
            .find(HostNode::key_hash("lab"), |n: &HostNode| {
                n.key() == "lab" && n.base.flag.is_group()
            })
            .unwrap();
        assert_eq!(group.hits, 2);
        assert_eq!(group.xfer, 200);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_download_job_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);

        let mut rec = record(15, 10, "10.0.0.1", "/files/tool.tar.gz", 4096);
        rec.download = Some("tool.tar.gz".to_string());
        state.process_record(&rec).unwrap();

        assert_eq!(state.totals.t_downloads, 1);
        assert_eq!(state.totals.t_dlcount, 0);
        let host = state
            .hosts
            .find(
                HostNode::key_hash("10.0.0.1"),
                |n: &HostNode| n.key() == "10.0.0.1",
            )
            .unwrap();
        assert_eq!(host.dlref, 1);
        assert!(!host.evictable());

        // the next record is past the download timeout: the job completes
        let mut rec = record(15, 10, "10.0.0.1", "/files/tool.tar.gz", 2048);
        rec.tstamp = ts(15, 10, 30, 0);
        rec.download = Some("tool.tar.gz".to_string());
        state.process_record(&rec).unwrap();

        assert_eq!(state.totals.t_dlcount, 1);
        assert_eq!(state.dl_ended.len(), 1);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_daily_totals_sum_to_monthly() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);

        for day in [3u8, 7, 7, 12, 28] {
            let mut rec = record(day, 9, "10.0.0.1", "/a.html", 50);
            rec.tstamp = ts(day, 9, 0, 0);
            state.process_record(&rec).unwrap();
        }

        let daily_sum: u64 = state.t_daily.iter().map(|d| d.tm_hits).sum();
        assert_eq!(state.totals.t_hit, daily_sum);
        let daily_xfer: u64 = state.t_daily.iter().map(|d| d.tm_xfer).sum();
        assert_eq!(state.totals.t_xfer, daily_xfer);
        // snapshotted days plus the still-open day cover every host
        let daily_hosts: u64 = state.t_daily.iter().map(|d| d.tm_hosts).sum();
        assert_eq!(state.totals.t_hosts, daily_hosts + state.totals.dt_hosts);
        assert_eq!(state.totals.f_day, 3);
        assert_eq!(state.totals.l_day, 28);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_incremental_refusal() {
        let dir = TempDir::new().unwrap();
        {
            let mut state = open_state(&dir);
            state
                .process_record(&record(15, 10, "10.0.0.1", "/a.html", 100))
                .unwrap();
            state.save_state().unwrap();
            state.cleanup().unwrap();
        }

        let config = RunConfig::new(dir.path()).incremental(false);
        let mut state = State::new(config);
        let err = state.initialize().unwrap_err();
        assert!(matches!(err, Error::Incompatible(_)), "got {err}");
    }

    #[test]
    fn test_spammer_set_repopulated_on_restore() {
        let dir = TempDir::new().unwrap();
        {
            let mut state = open_state(&dir);
            let mut rec = record(15, 10, "10.0.0.66", "/a.html", 10);
            rec.spammer = true;
            state.process_record(&rec).unwrap();
            assert!(state.spammers.contains("10.0.0.66"));
            state.save_state().unwrap();
            state.cleanup().unwrap();
        }

        let mut state = open_state(&dir);
        assert!(state.spammers.contains("10.0.0.66"));
        state.cleanup().unwrap();
    }

    #[test]
    fn test_active_visit_survives_incremental_runs() {
        let dir = TempDir::new().unwrap();
        {
            let mut state = open_state(&dir);
            state
                .process_record(&record(15, 10, "10.0.0.1", "/entry.html", 100))
                .unwrap();
            state.save_state().unwrap();
            state.cleanup().unwrap();
        }

        let mut state = open_state(&dir);
        let host = state
            .hosts
            .find(
                HostNode::key_hash("10.0.0.1"),
                |n: &HostNode| n.key() == "10.0.0.1",
            )
            .expect("host with active visit restored");
        let visit = host.visit.as_ref().expect("visit restored");
        assert_eq!(visit.hits, 1);
        assert_eq!(visit.last_url_key, "/entry.html");

        // a second request two minutes later continues the same visit
        let mut rec = record(15, 10, "10.0.0.1", "/next.html", 100);
        rec.tstamp = ts(15, 10, 2, 0);
        state.process_record(&rec).unwrap();
        assert_eq!(state.totals.t_visits, 1);
        state.cleanup().unwrap();
    }

    #[test]
    fn test_sysnode_written_on_save() {
        let dir = TempDir::new().unwrap();
        let mut state = open_state(&dir);
        state
            .process_record(&record(15, 10, "10.0.0.1", "/a.html", 100))
            .unwrap();
        state.save_state().unwrap();

        let sysnode: crate::node::sysnode::SysNode =
            state.storage.get_node(1).unwrap().unwrap();
        assert_eq!(sysnode.appver, VERSION);
        assert_eq!(sysnode.appver_last, VERSION);
        assert!(sysnode.incremental);
        state.cleanup().unwrap();
    }
}
