use std::path::PathBuf;

/// Configuration for one analyzer run.
///
/// Mirrors what the outer CLI layer would have parsed; the engine only reads
/// these fields. Mode flags map onto sysnode fields or gate the initialize
/// flow.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Output directory holding the database, history and state files
    pub out_dir: PathBuf,

    /// Database file name inside the output directory (default: logtally.db)
    pub db_fname: String,

    /// History file name (default: logtally.hist)
    pub hist_fname: String,

    /// Legacy state-file name used as a previous-run sentinel
    pub state_fname: String,

    /// Incremental run: state is preserved between runs
    pub incremental: bool,

    /// Batch run: secondary indexes are not maintained during the run
    pub batch: bool,

    /// Keep every node in memory instead of swapping out to the database
    pub memory_mode: bool,

    /// Generate a report from existing state, no log processing
    pub prep_report: bool,

    /// Close out the current month
    pub end_month: bool,

    /// Compact the database and exit
    pub compact_db: bool,

    /// Print database information and exit
    pub db_info: bool,

    /// Dirty-page sync cadence in puts; zero disables trickling
    pub db_trickle_rate: u32,

    /// Visit inactivity timeout in seconds (default: 1800)
    pub visit_timeout: i64,

    /// Download-job inactivity timeout in seconds (default: 300)
    pub download_timeout: i64,

    /// Maximum number of months kept in the history file (default: 24)
    pub max_hist: usize,

    /// Log timestamps are UTC rather than local time
    pub utc_time: bool,

    /// Minutes to add to UTC timestamps when utc_time is set
    pub utc_offset: i16,

    /// Ignore the history file on startup
    pub ignore_hist: bool,

    /// Soft cap on in-memory host nodes before a swap-out pass; zero
    /// disables the trigger
    pub max_hosts: usize,

    /// Soft cap on in-memory URL nodes before a swap-out pass
    pub max_urls: usize,

    /// Localized HTTP status codes, ascending
    pub status_codes: Vec<u16>,

    /// Localized country codes and display names
    pub countries: Vec<(String, String)>,

    /// Grouping patterns per entity: anything containing the pattern also
    /// accumulates under the named group node
    pub group_hosts: Vec<GroupPattern>,
    pub group_urls: Vec<GroupPattern>,
    pub group_refs: Vec<GroupPattern>,
    pub group_agents: Vec<GroupPattern>,
    pub group_users: Vec<GroupPattern>,
    pub group_downloads: Vec<GroupPattern>,
}

/// One configured grouping rule: a substring pattern and the group's name.
#[derive(Debug, Clone)]
pub struct GroupPattern {
    pub pattern: String,
    pub name: String,
}

impl GroupPattern {
    pub fn new(pattern: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            name: name.into(),
        }
    }
}

/// First group whose pattern matches the value.
pub fn find_group<'a>(groups: &'a [GroupPattern], value: &str) -> Option<&'a str> {
    groups
        .iter()
        .find(|g| value.contains(&g.pattern))
        .map(|g| g.name.as_str())
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            db_fname: "logtally.db".to_string(),
            hist_fname: "logtally.hist".to_string(),
            state_fname: "logtally.current".to_string(),
            incremental: false,
            batch: false,
            memory_mode: true,
            prep_report: false,
            end_month: false,
            compact_db: false,
            db_info: false,
            db_trickle_rate: 0,
            visit_timeout: 1800,
            download_timeout: 300,
            max_hist: 24,
            utc_time: false,
            utc_offset: 0,
            ignore_hist: false,
            max_hosts: 0,
            max_urls: 0,
            status_codes: default_status_codes(),
            countries: Vec::new(),
            group_hosts: Vec::new(),
            group_urls: Vec::new(),
            group_refs: Vec::new(),
            group_agents: Vec::new(),
            group_users: Vec::new(),
            group_downloads: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Create a new config rooted at the given output directory
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            ..Default::default()
        }
    }

    /// Enable or disable incremental mode
    pub fn incremental(mut self, enabled: bool) -> Self {
        self.incremental = enabled;
        self
    }

    /// Enable or disable batch mode
    pub fn batch(mut self, enabled: bool) -> Self {
        self.batch = enabled;
        self
    }

    /// Keep all nodes in memory (no swap-out)
    pub fn memory_mode(mut self, enabled: bool) -> Self {
        self.memory_mode = enabled;
        self
    }

    /// Report-only run
    pub fn prep_report(mut self, enabled: bool) -> Self {
        self.prep_report = enabled;
        self
    }

    /// End-of-month run
    pub fn end_month(mut self, enabled: bool) -> Self {
        self.end_month = enabled;
        self
    }

    /// Print database info and exit
    pub fn db_info(mut self, enabled: bool) -> Self {
        self.db_info = enabled;
        self
    }

    /// Set the trickle rate (puts between dirty-page syncs)
    pub fn db_trickle_rate(mut self, rate: u32) -> Self {
        self.db_trickle_rate = rate;
        self
    }

    /// Set the visit inactivity timeout in seconds
    pub fn visit_timeout(mut self, seconds: i64) -> Self {
        self.visit_timeout = seconds;
        self
    }

    /// Set the download inactivity timeout in seconds
    pub fn download_timeout(mut self, seconds: i64) -> Self {
        self.download_timeout = seconds;
        self
    }

    /// Use UTC log time with the given offset in minutes
    pub fn utc(mut self, enabled: bool, offset_min: i16) -> Self {
        self.utc_time = enabled;
        self.utc_offset = offset_min;
        self
    }

    /// Full path of the database directory
    pub fn db_path(&self) -> PathBuf {
        self.out_dir.join(&self.db_fname)
    }

    /// Full path of the history file
    pub fn hist_path(&self) -> PathBuf {
        self.out_dir.join(&self.hist_fname)
    }

    /// Full path of the legacy state file
    pub fn state_path(&self) -> PathBuf {
        self.out_dir.join(&self.state_fname)
    }

    /// Maintenance runs operate on an existing database only
    pub fn is_maintenance(&self) -> bool {
        self.prep_report || self.end_month || self.compact_db || self.db_info
    }
}

/// Status codes the engine tracks when the caller supplies no localized list.
fn default_status_codes() -> Vec<u16> {
    vec![
        100, 101, 200, 201, 202, 203, 204, 205, 206, 300, 301, 302, 303, 304, 305, 307, 400, 401,
        402, 403, 404, 405, 406, 407, 408, 409, 410, 411, 412, 413, 414, 415, 416, 417, 500, 501,
        502, 503, 504, 505,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.out_dir, PathBuf::from("."));
        assert!(!config.incremental);
        assert!(config.memory_mode);
        assert_eq!(config.visit_timeout, 1800);
        assert_eq!(config.download_timeout, 300);
    }

    #[test]
    fn test_config_builder() {
        let config = RunConfig::new("/tmp/logs")
            .incremental(true)
            .batch(true)
            .memory_mode(false)
            .db_trickle_rate(50)
            .visit_timeout(600);

        assert_eq!(config.out_dir, PathBuf::from("/tmp/logs"));
        assert!(config.incremental);
        assert!(config.batch);
        assert!(!config.memory_mode);
        assert_eq!(config.db_trickle_rate, 50);
        assert_eq!(config.visit_timeout, 600);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/logs/logtally.db"));
    }

    #[test]
    fn test_maintenance_modes() {
        assert!(!RunConfig::default().is_maintenance());
        assert!(RunConfig::default().prep_report(true).is_maintenance());
        assert!(RunConfig::default().end_month(true).is_maintenance());
        assert!(RunConfig::default().db_info(true).is_maintenance());
    }
}
