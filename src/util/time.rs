//! Timestamp helpers for snapshot manifests

use chrono::{DateTime, FixedOffset, Local};

use crate::error::Error;

/// File name layout of a manifest timestamp: `YYYYMMDDhhmmss±hhmm`
pub const MANIFEST_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%z";

/// Wall clock at the local offset, as recorded in manifests
pub fn now_local() -> DateTime<FixedOffset> {
	Local::now().fixed_offset()
}

/// Render a timestamp as a manifest file name stem
pub fn timestamp_str(ts: &DateTime<FixedOffset>) -> String {
	ts.format(MANIFEST_TIMESTAMP_FORMAT).to_string()
}

/// Parse a manifest file name stem back into a timestamp
pub fn parse_timestamp_str(s: &str) -> Result<DateTime<FixedOffset>, Error> {
	DateTime::parse_from_str(s, MANIFEST_TIMESTAMP_FORMAT)
		.map_err(|e| Error::Message(format!("Invalid manifest timestamp '{}': {}", s, e)))
}
