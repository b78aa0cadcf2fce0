//! Version and snapshot records, as persisted in manifests

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use bmb_store::VersionEntry;

/// Identity of one historical object revision. Immutable once produced
/// by the store; equality and set membership are by version id alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
	pub key: String,
	pub last_modified: DateTime<Utc>,
	pub size: i64,
	pub version_id: String,
}

impl PartialEq for Version {
	fn eq(&self, other: &Self) -> bool {
		self.version_id == other.version_id
	}
}

impl Eq for Version {}

impl std::hash::Hash for Version {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.version_id.hash(state);
	}
}

impl From<VersionEntry> for Version {
	fn from(e: VersionEntry) -> Self {
		Self {
			key: e.key,
			last_modified: e.last_modified,
			size: e.size,
			version_id: e.version_id,
		}
	}
}

/// The set of versions that were latest of their key at one instant.
/// Manifests are append-only on disk: written once, later only deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
	/// Path of the manifest, derived from the file name on load and
	/// filled in on persistence; not part of the wire format.
	#[serde(skip)]
	pub file: PathBuf,
	pub timestamp: DateTime<FixedOffset>,
	pub contents: Vec<Version>,
}

impl Snapshot {
	pub fn new(timestamp: DateTime<FixedOffset>, contents: Vec<Version>) -> Self {
		Self {
			file: PathBuf::new(),
			timestamp,
			contents,
		}
	}

	/// Sum of the sizes of all recorded versions, in bytes
	pub fn total_size(&self) -> i64 {
		self.contents.iter().map(|v| v.size).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	fn version(key: &str, id: &str) -> Version {
		Version {
			key: key.to_string(),
			last_modified: Utc::now(),
			size: 1,
			version_id: id.to_string(),
		}
	}

	#[test]
	fn equality_is_by_version_id() {
		let a = version("some/key", "V1");
		let b = version("other/key", "V1");
		assert_eq!(a, b);

		let mut set = HashSet::new();
		set.insert(a);
		assert!(set.contains(&b));
		assert!(!set.contains(&version("some/key", "V2")));
	}

	#[test]
	fn manifest_wire_format() {
		let ts = DateTime::parse_from_rfc3339("2015-08-12T15:04:05-05:00").unwrap();
		let snapshot = Snapshot::new(ts, vec![version("a/x", "V1")]);
		let json = serde_json::to_value(&snapshot).unwrap();
		assert_eq!(json["Timestamp"], "2015-08-12T15:04:05-05:00");
		assert_eq!(json["Contents"][0]["Key"], "a/x");
		assert_eq!(json["Contents"][0]["VersionId"], "V1");
		assert_eq!(json["Contents"][0]["Size"], 1);
		assert!(json["Contents"][0]["LastModified"].is_string());
		assert!(json.get("File").is_none());
	}
}
