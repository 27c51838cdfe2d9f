//! ISO-8601 timestamps for manifest mtimes and handshake clocks.
//!
//! The wire and the database both use the extended format with a trailing
//! `Z` and second precision, e.g. `2024-03-01T10:00:00Z`.

use std::time::SystemTime;

use chrono::{DateTime, Utc};

const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format a timestamp as ISO-8601 with zero offset.
pub fn isotime(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(FORMAT).to_string()
}

/// Current time as ISO-8601 with zero offset.
pub fn now_isotime() -> String {
    isotime(SystemTime::now())
}
