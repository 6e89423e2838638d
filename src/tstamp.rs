use chrono::{Datelike, NaiveDate, Timelike};

/// A calendar timestamp with a minute-precision UTC offset.
///
/// Log sources report either local time or UTC plus an offset; the engine
/// carries both pieces so monthly boundaries follow the reporting zone while
/// elapsed-time math stays in UTC. A null timestamp marks fields that were
/// never observed (e.g. the last-hit time of a host restored from a legacy
/// database).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tstamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    /// Minutes east of UTC for the wall-clock fields
    pub offset_min: i16,
    pub null: bool,
}

impl Default for Tstamp {
    fn default() -> Self {
        Self::null()
    }
}

impl Tstamp {
    /// A timestamp that has never been set.
    pub fn null() -> Self {
        Self {
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            min: 0,
            sec: 0,
            offset_min: 0,
            null: true,
        }
    }

    pub fn new(year: u16, month: u8, day: u8, hour: u8, min: u8, sec: u8, offset_min: i16) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            min,
            sec,
            offset_min,
            null: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn reset(&mut self) {
        *self = Self::null();
    }

    /// Seconds since the Unix epoch, honoring the UTC offset. Zero for a
    /// null timestamp, matching how legacy records stored "never".
    pub fn mktime(&self) -> i64 {
        if self.null {
            return 0;
        }
        let date = match NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)
        {
            Some(d) => d,
            None => return 0,
        };
        let time = match date.and_hms_opt(self.hour as u32, self.min as u32, self.sec as u32) {
            Some(t) => t,
            None => return 0,
        };
        time.and_utc().timestamp() - self.offset_min as i64 * 60
    }

    /// Rebuilds the wall-clock fields from epoch seconds and an offset.
    pub fn from_epoch(secs: i64, offset_min: i16) -> Self {
        let local = secs + offset_min as i64 * 60;
        let dt = match chrono::DateTime::from_timestamp(local, 0) {
            Some(dt) => dt,
            None => return Self::null(),
        };
        Self {
            year: dt.year() as u16,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            min: dt.minute() as u8,
            sec: dt.second() as u8,
            offset_min,
            null: false,
        }
    }

    /// Seconds elapsed from `earlier` to this timestamp.
    pub fn elapsed(&self, earlier: &Tstamp) -> i64 {
        self.mktime() - earlier.mktime()
    }

    /// True if this timestamp falls in a different year or month.
    pub fn new_month(&self, other: &Tstamp) -> bool {
        self.year != other.year || self.month != other.month
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_tstamp() {
        let ts = Tstamp::null();
        assert!(ts.is_null());
        assert_eq!(ts.mktime(), 0);
    }

    #[test]
    fn test_mktime_known_value() {
        // 2020-06-15T10:00:00Z
        let ts = Tstamp::new(2020, 6, 15, 10, 0, 0, 0);
        assert_eq!(ts.mktime(), 1592215200);
    }

    #[test]
    fn test_mktime_with_offset() {
        // 10:00 at UTC+60min is 09:00 UTC
        let utc = Tstamp::new(2020, 6, 15, 10, 0, 0, 0);
        let offset = Tstamp::new(2020, 6, 15, 10, 0, 0, 60);
        assert_eq!(offset.mktime(), utc.mktime() - 3600);
    }

    #[test]
    fn test_from_epoch_round_trip() {
        let ts = Tstamp::new(2020, 6, 30, 23, 59, 58, 0);
        let back = Tstamp::from_epoch(ts.mktime(), 0);
        assert_eq!(back, ts);
    }

    #[test]
    fn test_elapsed_and_month_change() {
        let a = Tstamp::new(2020, 6, 30, 23, 59, 0, 0);
        let b = Tstamp::new(2020, 7, 1, 0, 1, 0, 0);
        assert_eq!(b.elapsed(&a), 120);
        assert!(b.new_month(&a));
        assert!(!a.new_month(&a));
    }
}
