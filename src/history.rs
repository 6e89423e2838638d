//! Year-over-year history.
//!
//! A flat text file with one row per (year, month) carrying the finalized
//! monthly roll-up. It lives next to the database and is rewritten at every
//! save; a missing or partially readable file is a soft failure, because
//! the current month can always be recovered from the database. Rows are
//! whitespace-separated:
//!
//! ```text
//! month year hits files hosts xfer_kib first_day last_day pages visits
//! ```
//!
//! Fields missing from short legacy rows default to zero.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use itertools::Itertools as _;

use crate::config::RunConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryMonth {
    pub year: u32,
    pub month: u32,
    pub hits: u64,
    pub files: u64,
    pub pages: u64,
    pub visits: u64,
    pub hosts: u64,
    /// Transfer in KiB
    pub xfer: u64,
    pub first_day: u32,
    pub last_day: u32,
}

#[derive(Debug)]
pub struct History {
    path: PathBuf,
    max_months: usize,
    months: Vec<HistoryMonth>,
}

impl History {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            path: config.hist_path(),
            max_months: config.max_hist,
            months: Vec::new(),
        }
    }

    pub fn months(&self) -> &[HistoryMonth] {
        &self.months
    }

    pub fn get(&self, year: u32, month: u32) -> Option<&HistoryMonth> {
        self.months
            .iter()
            .find(|m| m.year == year && m.month == month)
    }

    /// Reads the history file. Missing files and malformed rows are logged
    /// and skipped.
    pub fn get_history(&mut self) {
        self.months.clear();
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "no usable history file");
                return;
            }
        };
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "history file unreadable past this point");
                    break;
                }
            };
            match parse_row(&line) {
                Ok(Some(row)) => self.months.push(row),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "skipping malformed history row"),
            }
        }
        self.months.sort_by_key(|m| (m.year, m.month));
    }

    /// Inserts or replaces the row for one month.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        year: u32,
        month: u32,
        hits: u64,
        files: u64,
        pages: u64,
        visits: u64,
        hosts: u64,
        xfer_kib: u64,
        first_day: u32,
        last_day: u32,
    ) {
        let row = HistoryMonth {
            year,
            month,
            hits,
            files,
            pages,
            visits,
            hosts,
            xfer: xfer_kib,
            first_day,
            last_day,
        };
        match self
            .months
            .iter_mut()
            .find(|m| m.year == year && m.month == month)
        {
            Some(existing) => *existing = row,
            None => {
                self.months.push(row);
                self.months.sort_by_key(|m| (m.year, m.month));
            }
        }
        // keep only the newest months
        if self.months.len() > self.max_months {
            let drop = self.months.len() - self.max_months;
            self.months.drain(..drop);
        }
    }

    /// Writes the history file.
    pub fn put_history(&self) -> Result<()> {
        let file = File::create(&self.path)
            .map_err(|e| Error::IO(format!("cannot write history {:?}: {e}", self.path)))?;
        let mut w = BufWriter::new(file);
        for m in &self.months {
            writeln!(
                w,
                "{} {} {} {} {} {} {} {} {} {}",
                m.month, m.year, m.hits, m.files, m.hosts, m.xfer, m.first_day, m.last_day,
                m.pages, m.visits
            )?;
        }
        w.flush()?;
        Ok(())
    }
}

fn parse_row(line: &str) -> Result<Option<HistoryMonth>> {
    if line.trim().is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut fields = line.split_whitespace();
    let (month, year) = fields
        .next_tuple()
        .ok_or_else(|| Error::InvalidData(format!("history row too short: {line:?}")))?;
    let mut row = HistoryMonth {
        month: month.parse()?,
        year: year.parse()?,
        ..Default::default()
    };
    // trailing fields were added over time and default to zero
    let mut rest = fields.map(|f| f.parse::<u64>());
    let mut next = || -> Result<u64> { rest.next().transpose().map(|v| v.unwrap_or(0)).map_err(Error::from) };
    row.hits = next()?;
    row.files = next()?;
    row.hosts = next()?;
    row.xfer = next()?;
    row.first_day = next()? as u32;
    row.last_day = next()? as u32;
    row.pages = next()?;
    row.visits = next()?;
    if row.month < 1 || row.month > 12 {
        return Err(Error::InvalidData(format!(
            "history month {} out of range",
            row.month
        )));
    }
    Ok(Some(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn history_in(dir: &TempDir) -> History {
        let config = RunConfig::new(dir.path());
        History::new(&config)
    }

    #[test]
    fn test_missing_file_is_soft() {
        let dir = TempDir::new().unwrap();
        let mut history = history_in(&dir);
        history.get_history();
        assert!(history.months().is_empty());
    }

    #[test]
    fn test_update_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut history = history_in(&dir);
        history.update(2020, 5, 900, 700, 300, 80, 40, 2048, 1, 31);
        history.update(2020, 6, 1000, 800, 400, 90, 50, 4096, 1, 15);
        history.put_history().unwrap();

        let mut back = history_in(&dir);
        back.get_history();
        assert_eq!(back.months().len(), 2);
        let june = back.get(2020, 6).unwrap();
        assert_eq!(june.hits, 1000);
        assert_eq!(june.xfer, 4096);
        assert_eq!(june.first_day, 1);
        assert_eq!(june.last_day, 15);
        assert_eq!(june.visits, 90);
    }

    #[test]
    fn test_update_replaces_existing_month() {
        let dir = TempDir::new().unwrap();
        let mut history = history_in(&dir);
        history.update(2020, 6, 10, 5, 2, 1, 1, 1, 1, 3);
        history.update(2020, 6, 20, 10, 4, 2, 2, 2, 1, 20);
        assert_eq!(history.months().len(), 1);
        assert_eq!(history.get(2020, 6).unwrap().hits, 20);
    }

    #[test]
    fn test_short_legacy_rows_default_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logtally.hist");
        std::fs::write(&path, "6 2020 100 80 10 512 1 30\n").unwrap();

        let mut history = history_in(&dir);
        history.get_history();
        let row = history.get(2020, 6).unwrap();
        assert_eq!(row.hits, 100);
        assert_eq!(row.pages, 0);
        assert_eq!(row.visits, 0);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logtally.hist");
        std::fs::write(&path, "not a row\n6 2020 1 1 1 1 1 1 1 1\n13 2020 1\n").unwrap();

        let mut history = history_in(&dir);
        history.get_history();
        assert_eq!(history.months().len(), 1);
        assert_eq!(history.months()[0].month, 6);
    }

    #[test]
    fn test_caps_at_max_months() {
        let dir = TempDir::new().unwrap();
        let mut config = RunConfig::new(dir.path());
        config.max_hist = 3;
        let mut history = History::new(&config);
        for month in 1..=6 {
            history.update(2020, month, month as u64, 0, 0, 0, 0, 0, 1, 28);
        }
        assert_eq!(history.months().len(), 3);
        assert_eq!(history.months()[0].month, 4);
    }
}
