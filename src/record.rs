//! The pre-parsed log record the engine aggregates.
//!
//! Parsing, field extraction, DNS and GeoIP resolution, and robot/spammer
//! classification all happen upstream; the engine consumes their results.
//! Hit/file/page classification follows the upstream flags: every record is
//! a hit, successful requests for content are files, and files classified
//! as content pages are pages.

use crate::tstamp::Tstamp;

#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    pub tstamp: Tstamp,
    /// Client address or resolved host name
    pub host: String,
    pub url: String,
    pub method: String,
    pub status: u16,
    /// Response bytes
    pub xfer: u64,
    /// Processing time in milliseconds
    pub proctime: f64,
    /// Request used TLS
    pub secure: bool,

    pub referrer: Option<String>,
    pub agent: Option<String>,
    pub user: Option<String>,
    /// (term type, term) pairs extracted from a search referrer
    pub search_terms: Vec<(String, String)>,

    /// Lowercase two-letter country code, resolved upstream
    pub country: Option<String>,
    pub geoname_id: u32,
    pub city: Option<String>,

    pub robot: bool,
    pub spammer: bool,
    /// The URL is a configured conversion target
    pub target: bool,
    /// Successful request for content
    pub file: bool,
    /// Content page
    pub page: bool,
    /// Download name when the request matched a configured download
    pub download: Option<String>,
}

impl LogRecord {
    pub fn new(tstamp: Tstamp, host: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tstamp,
            host: host.into(),
            url: url.into(),
            method: "GET".to_string(),
            status: 200,
            file: true,
            page: true,
            ..Default::default()
        }
    }
}
