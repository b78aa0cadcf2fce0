//! Versioned object store capability for backup-my-bucket
//!
//! The pipelines in `bmb_backup` only ever touch a bucket through the
//! [`ObjectStore`] trait: paginated version listing, fetching one specific
//! version, creating a new current version, and batched deletion of
//! versions. `s3::S3Store` binds the trait to a real bucket,
//! `mem::MemStore` is the double the test suites run against.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod mem;
pub mod retry;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use crate::error::StoreError;

/// One entry of a version listing page
#[derive(Debug, Clone)]
pub struct VersionEntry {
	pub key: String,
	pub version_id: String,
	pub last_modified: DateTime<Utc>,
	pub size: i64,
	/// Whether the store flags this version as the current one for its key
	pub is_latest: bool,
}

/// Cursor for resuming a truncated version listing
#[derive(Debug, Clone, Default)]
pub struct PageMarker {
	pub key_marker: Option<String>,
	pub version_id_marker: Option<String>,
}

/// One page of a version listing
#[derive(Debug, Clone, Default)]
pub struct VersionListing {
	/// Sub-prefixes surfaced by the delimiter, to be explored separately
	pub common_prefixes: Vec<String>,
	pub versions: Vec<VersionEntry>,
	/// `Some` iff the listing was truncated and must be resumed
	pub next_marker: Option<PageMarker>,
}

/// Identity of one object version, as used in batched deletes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdent {
	pub key: String,
	pub version_id: String,
}

/// Per-item failure reported by a batched delete
#[derive(Debug, Clone)]
pub struct DeleteItemError {
	pub key: String,
	pub version_id: String,
	pub code: String,
	pub message: String,
}

impl DeleteItemError {
	pub fn is_no_such_version(&self) -> bool {
		self.code == "NoSuchVersion"
	}
}

/// The four operations the backup pipelines require of a versioned bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// List object versions beneath `prefix`. With `delimiter = "/"`,
	/// deeper key segments are surfaced as common prefixes instead of
	/// being listed. Pass the marker of the previous page to resume a
	/// truncated listing; page size is up to the implementation.
	async fn list_object_versions(
		&self,
		bucket: &str,
		prefix: &str,
		delimiter: &str,
		marker: Option<PageMarker>,
	) -> Result<VersionListing, StoreError>;

	/// Fetch the bytes of one specific historical version
	async fn get_object(
		&self,
		bucket: &str,
		key: &str,
		version_id: &str,
	) -> Result<Bytes, StoreError>;

	/// Create a new current version of `key`, returning its version id
	async fn put_object(&self, bucket: &str, key: &str, body: Bytes)
		-> Result<String, StoreError>;

	/// Delete specific versions in one batch (quiet mode: only failures
	/// are reported). A transport-level failure is a `StoreError`;
	/// per-item failures come back in the result vector.
	async fn delete_objects(
		&self,
		bucket: &str,
		objects: &[ObjectIdent],
	) -> Result<Vec<DeleteItemError>, StoreError>;
}
