//! Month-wide running totals.
//!
//! A singleton record holding every counter the engine accumulates for the
//! current month, the current-timestamp cursor, and the hourly accumulators
//! the time machine folds into daily rows on hour transitions. The hourly
//! accumulators persist so that "the hour accumulators are zero iff the
//! current hour has seen no activity" survives a save/restore boundary.

use crate::encoding::{NodeData, Reader, Writer, TSTAMP_SIZE};
use crate::error::Result;
use crate::node::{NodeKind, StoreNode};
use crate::tstamp::Tstamp;

#[derive(Debug, Clone, Default)]
pub struct Totals {
    pub cur_tstamp: Tstamp,
    /// First and last day of the month with data; zero until a record lands
    pub f_day: u32,
    pub l_day: u32,

    pub t_hit: u64,
    pub t_file: u64,
    pub t_page: u64,
    pub t_xfer: u64,

    pub t_hosts: u64,
    pub t_hosts_conv: u64,
    pub t_url: u64,
    pub t_ref: u64,
    pub t_agent: u64,
    pub t_user: u64,
    pub t_err: u64,

    pub t_visits: u64,
    pub t_visits_conv: u64,
    pub t_entry: u64,
    pub t_exit: u64,

    /// Search-string records / total search hits
    pub t_search: u64,
    pub t_srchits: u64,
    /// Download records / completed download jobs
    pub t_downloads: u64,
    pub t_dlcount: u64,

    pub t_rhits: u64,
    pub t_rfiles: u64,
    pub t_rpages: u64,
    pub t_rxfer: u64,
    pub t_rvisits: u64,
    pub t_rhosts: u64,

    pub t_spmhits: u64,
    pub t_sphosts: u64,

    pub t_grp_hosts: u64,
    pub t_grp_urls: u64,
    pub t_grp_refs: u64,
    pub t_grp_agents: u64,
    pub t_grp_users: u64,

    /// Running average and maximum visit duration in seconds
    pub t_visit_avg: f64,
    pub t_visit_max: u64,
    /// Per-visit maxima across all hosts
    pub max_v_hits: u64,
    pub max_v_files: u64,
    pub max_v_pages: u64,
    pub max_v_xfer: u64,

    /// Current-hour accumulators, folded on the next hour transition
    pub ht_hits: u64,
    pub ht_files: u64,
    pub ht_pages: u64,
    pub ht_xfer: u64,
    pub ht_visits: u64,
    pub ht_hosts: u64,
    /// Largest hourly hit count seen this month
    pub hm_hit: u64,
    /// Hosts first seen today, snapshotted into the daily row on day change
    pub dt_hosts: u64,
}

impl Totals {
    pub fn init_counters(&mut self) {
        *self = Self::default();
    }
}

impl NodeData for Totals {
    const VERSION: u16 = 1;

    fn data_size(&self) -> usize {
        TSTAMP_SIZE + 4 * 2 + 8 * 45 + 8
    }

    fn pack_data(&self, w: &mut Writer) {
        w.put_tstamp(&self.cur_tstamp);
        w.put_u32(self.f_day);
        w.put_u32(self.l_day);

        w.put_u64(self.t_hit);
        w.put_u64(self.t_file);
        w.put_u64(self.t_page);
        w.put_u64(self.t_xfer);

        w.put_u64(self.t_hosts);
        w.put_u64(self.t_hosts_conv);
        w.put_u64(self.t_url);
        w.put_u64(self.t_ref);
        w.put_u64(self.t_agent);
        w.put_u64(self.t_user);
        w.put_u64(self.t_err);

        w.put_u64(self.t_visits);
        w.put_u64(self.t_visits_conv);
        w.put_u64(self.t_entry);
        w.put_u64(self.t_exit);

        w.put_u64(self.t_search);
        w.put_u64(self.t_srchits);
        w.put_u64(self.t_downloads);
        w.put_u64(self.t_dlcount);

        w.put_u64(self.t_rhits);
        w.put_u64(self.t_rfiles);
        w.put_u64(self.t_rpages);
        w.put_u64(self.t_rxfer);
        w.put_u64(self.t_rvisits);
        w.put_u64(self.t_rhosts);

        w.put_u64(self.t_spmhits);
        w.put_u64(self.t_sphosts);

        w.put_u64(self.t_grp_hosts);
        w.put_u64(self.t_grp_urls);
        w.put_u64(self.t_grp_refs);
        w.put_u64(self.t_grp_agents);
        w.put_u64(self.t_grp_users);

        w.put_f64(self.t_visit_avg);
        w.put_u64(self.t_visit_max);
        w.put_u64(self.max_v_hits);
        w.put_u64(self.max_v_files);
        w.put_u64(self.max_v_pages);
        w.put_u64(self.max_v_xfer);

        w.put_u64(self.ht_hits);
        w.put_u64(self.ht_files);
        w.put_u64(self.ht_pages);
        w.put_u64(self.ht_xfer);
        w.put_u64(self.ht_visits);
        w.put_u64(self.ht_hosts);
        w.put_u64(self.hm_hit);
        w.put_u64(self.dt_hosts);
    }

    fn unpack_data(r: &mut Reader, _version: u16) -> Result<Self> {
        let mut t = Self::default();
        t.cur_tstamp = r.get_tstamp()?;
        t.f_day = r.get_u32()?;
        t.l_day = r.get_u32()?;

        t.t_hit = r.get_u64()?;
        t.t_file = r.get_u64()?;
        t.t_page = r.get_u64()?;
        t.t_xfer = r.get_u64()?;

        t.t_hosts = r.get_u64()?;
        t.t_hosts_conv = r.get_u64()?;
        t.t_url = r.get_u64()?;
        t.t_ref = r.get_u64()?;
        t.t_agent = r.get_u64()?;
        t.t_user = r.get_u64()?;
        t.t_err = r.get_u64()?;

        t.t_visits = r.get_u64()?;
        t.t_visits_conv = r.get_u64()?;
        t.t_entry = r.get_u64()?;
        t.t_exit = r.get_u64()?;

        t.t_search = r.get_u64()?;
        t.t_srchits = r.get_u64()?;
        t.t_downloads = r.get_u64()?;
        t.t_dlcount = r.get_u64()?;

        t.t_rhits = r.get_u64()?;
        t.t_rfiles = r.get_u64()?;
        t.t_rpages = r.get_u64()?;
        t.t_rxfer = r.get_u64()?;
        t.t_rvisits = r.get_u64()?;
        t.t_rhosts = r.get_u64()?;

        t.t_spmhits = r.get_u64()?;
        t.t_sphosts = r.get_u64()?;

        t.t_grp_hosts = r.get_u64()?;
        t.t_grp_urls = r.get_u64()?;
        t.t_grp_refs = r.get_u64()?;
        t.t_grp_agents = r.get_u64()?;
        t.t_grp_users = r.get_u64()?;

        t.t_visit_avg = r.get_f64()?;
        t.t_visit_max = r.get_u64()?;
        t.max_v_hits = r.get_u64()?;
        t.max_v_files = r.get_u64()?;
        t.max_v_pages = r.get_u64()?;
        t.max_v_xfer = r.get_u64()?;

        t.ht_hits = r.get_u64()?;
        t.ht_files = r.get_u64()?;
        t.ht_pages = r.get_u64()?;
        t.ht_xfer = r.get_u64()?;
        t.ht_visits = r.get_u64()?;
        t.ht_hosts = r.get_u64()?;
        t.hm_hit = r.get_u64()?;
        t.dt_hosts = r.get_u64()?;
        Ok(t)
    }
}

impl StoreNode for Totals {
    const KIND: NodeKind = NodeKind::Totals;

    fn node_id(&self) -> u64 {
        1
    }

    fn set_node_id(&mut self, _id: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encoded_size, pack_record, unpack_record};

    #[test]
    fn test_round_trip() {
        let mut t = Totals::default();
        t.cur_tstamp = Tstamp::new(2020, 6, 15, 10, 0, 0, 0);
        t.f_day = 1;
        t.l_day = 15;
        t.t_hit = 1000;
        t.t_xfer = 123_456;
        t.t_visits = 80;
        t.t_grp_hosts = 3;
        t.t_visit_avg = 240.5;
        t.ht_hits = 7;
        t.hm_hit = 90;
        t.dt_hosts = 12;

        let buf = pack_record(&t);
        assert_eq!(encoded_size(&buf).unwrap(), buf.len());

        let back: Totals = unpack_record(&buf).unwrap();
        assert_eq!(back.cur_tstamp, t.cur_tstamp);
        assert_eq!(back.f_day, 1);
        assert_eq!(back.l_day, 15);
        assert_eq!(back.t_hit, 1000);
        assert_eq!(back.t_xfer, 123_456);
        assert_eq!(back.t_grp_hosts, 3);
        assert_eq!(back.t_visit_avg, 240.5);
        assert_eq!(back.ht_hits, 7);
        assert_eq!(back.hm_hit, 90);
        assert_eq!(back.dt_hosts, 12);
    }

    #[test]
    fn test_init_counters_clears_everything() {
        let mut t = Totals::default();
        t.t_hit = 5;
        t.ht_hits = 2;
        t.init_counters();
        assert_eq!(t.t_hit, 0);
        assert_eq!(t.ht_hits, 0);
        assert!(t.cur_tstamp.is_null());
    }
}
