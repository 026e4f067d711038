use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serializer;

/// Format used for timestamps embedded in file names
const FILE_TIMESTAMP: &str = "%Y%m%d_%H%M%S";

pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format(FILE_TIMESTAMP).to_string()
}

/// Parse the `YYYYmmdd_HHMMSS` part of a file name back into a timestamp
pub fn parse_file_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, FILE_TIMESTAMP)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Serialize a [`Duration`] as fractional seconds
pub fn as_secs_f64<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
