//! In-memory versioned store, the double used by the pipeline test suites
//!
//! Keys are held in a BTreeMap so listings come back in lexicographic
//! order like S3; each key owns a stack of versions whose top is the
//! latest. Fault counters let tests make the next N calls of an
//! operation fail with a transient error.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::{DeleteItemError, ObjectIdent, ObjectStore, PageMarker, VersionEntry, VersionListing};

#[derive(Debug, Clone)]
struct StoredVersion {
	version_id: String,
	last_modified: DateTime<Utc>,
	body: Bytes,
}

#[derive(Default)]
struct MemBucket {
	/// Per-key version stacks, oldest first
	objects: BTreeMap<String, Vec<StoredVersion>>,
}

#[derive(Default)]
struct Faults {
	list: u32,
	put: u32,
	get: HashMap<String, u32>,
}

#[derive(Default)]
struct MemInner {
	buckets: HashMap<String, MemBucket>,
	faults: Faults,
	version_counter: u64,
}

pub struct MemStore {
	inner: Mutex<MemInner>,
	page_size: usize,
}

impl MemStore {
	pub fn new() -> Self {
		Self::with_page_size(1000)
	}

	/// A small page size makes tests exercise pagination
	pub fn with_page_size(page_size: usize) -> Self {
		Self {
			inner: Mutex::new(MemInner::default()),
			page_size,
		}
	}

	pub async fn create_bucket(&self, bucket: &str) {
		let mut inner = self.inner.lock().await;
		inner.buckets.entry(bucket.to_string()).or_default();
	}

	/// Make the next `times` list calls fail with a transient error
	pub async fn fail_list(&self, times: u32) {
		self.inner.lock().await.faults.list = times;
	}

	/// Make the next `times` get calls for `key` fail with a transient error
	pub async fn fail_get(&self, key: &str, times: u32) {
		self.inner.lock().await.faults.get.insert(key.to_string(), times);
	}

	/// Make the next `times` put calls fail with a transient error
	pub async fn fail_put(&self, times: u32) {
		self.inner.lock().await.faults.put = times;
	}

	/// Current bytes of `key`, if any version remains
	pub async fn latest_body(&self, bucket: &str, key: &str) -> Option<Bytes> {
		let inner = self.inner.lock().await;
		inner
			.buckets
			.get(bucket)?
			.objects
			.get(key)?
			.last()
			.map(|v| v.body.clone())
	}

	/// Every version id present in the bucket
	pub async fn version_ids(&self, bucket: &str) -> BTreeSet<String> {
		let inner = self.inner.lock().await;
		let mut ids = BTreeSet::new();
		if let Some(b) = inner.buckets.get(bucket) {
			for versions in b.objects.values() {
				for v in versions {
					ids.insert(v.version_id.clone());
				}
			}
		}
		ids
	}

	fn take_fault(counter: &mut u32) -> bool {
		if *counter > 0 {
			*counter -= 1;
			true
		} else {
			false
		}
	}
}

impl Default for MemStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ObjectStore for MemStore {
	async fn list_object_versions(
		&self,
		bucket: &str,
		prefix: &str,
		delimiter: &str,
		marker: Option<PageMarker>,
	) -> Result<VersionListing, StoreError> {
		let mut inner = self.inner.lock().await;
		if Self::take_fault(&mut inner.faults.list) {
			return Err(StoreError::Transient("injected list failure".into()));
		}
		let b = inner
			.buckets
			.get(bucket)
			.ok_or_else(|| StoreError::Fatal(format!("no such bucket: {}", bucket)))?;

		let mut common_prefixes = BTreeSet::new();
		let mut entries = Vec::new();
		for (key, versions) in b.objects.range(prefix.to_string()..) {
			if !key.starts_with(prefix) {
				break;
			}
			let rest = &key[prefix.len()..];
			if !delimiter.is_empty() {
				if let Some(idx) = rest.find(delimiter) {
					common_prefixes
						.insert(format!("{}{}", prefix, &rest[..idx + delimiter.len()]));
					continue;
				}
			}
			let newest = versions.len() - 1;
			for (i, v) in versions.iter().enumerate().rev() {
				entries.push(VersionEntry {
					key: key.clone(),
					version_id: v.version_id.clone(),
					last_modified: v.last_modified,
					size: v.body.len() as i64,
					is_latest: i == newest,
				});
			}
		}

		// Resume after the marker entry; S3 never repeats a common
		// prefix across pages, so they are only sent with page one.
		let start = match &marker {
			None => 0,
			Some(m) => entries
				.iter()
				.position(|e| {
					Some(&e.key) == m.key_marker.as_ref()
						&& Some(&e.version_id) == m.version_id_marker.as_ref()
				})
				.map(|idx| idx + 1)
				.unwrap_or(0),
		};
		let page: Vec<VersionEntry> =
			entries[start..entries.len().min(start + self.page_size)].to_vec();

		let next_marker = if start + page.len() < entries.len() {
			page.last().map(|last| PageMarker {
				key_marker: Some(last.key.clone()),
				version_id_marker: Some(last.version_id.clone()),
			})
		} else {
			None
		};

		Ok(VersionListing {
			common_prefixes: if marker.is_none() {
				common_prefixes.into_iter().collect()
			} else {
				Vec::new()
			},
			versions: page,
			next_marker,
		})
	}

	async fn get_object(
		&self,
		bucket: &str,
		key: &str,
		version_id: &str,
	) -> Result<Bytes, StoreError> {
		let mut inner = self.inner.lock().await;
		if let Some(counter) = inner.faults.get.get_mut(key) {
			if Self::take_fault(counter) {
				return Err(StoreError::Transient("injected get failure".into()));
			}
		}
		inner
			.buckets
			.get(bucket)
			.and_then(|b| b.objects.get(key))
			.and_then(|versions| versions.iter().find(|v| v.version_id == version_id))
			.map(|v| v.body.clone())
			.ok_or_else(|| {
				StoreError::Fatal(format!("no such object: {}@{}", key, version_id))
			})
	}

	async fn put_object(
		&self,
		bucket: &str,
		key: &str,
		body: Bytes,
	) -> Result<String, StoreError> {
		let mut inner = self.inner.lock().await;
		if Self::take_fault(&mut inner.faults.put) {
			return Err(StoreError::Transient("injected put failure".into()));
		}
		inner.version_counter += 1;
		let version_id = format!("mem-{:08}", inner.version_counter);
		let version = StoredVersion {
			version_id: version_id.clone(),
			last_modified: Utc::now(),
			body,
		};
		inner
			.buckets
			.get_mut(bucket)
			.ok_or_else(|| StoreError::Fatal(format!("no such bucket: {}", bucket)))?
			.objects
			.entry(key.to_string())
			.or_default()
			.push(version);
		Ok(version_id)
	}

	async fn delete_objects(
		&self,
		bucket: &str,
		objects: &[ObjectIdent],
	) -> Result<Vec<DeleteItemError>, StoreError> {
		let mut inner = self.inner.lock().await;
		let b = inner
			.buckets
			.get_mut(bucket)
			.ok_or_else(|| StoreError::Fatal(format!("no such bucket: {}", bucket)))?;

		let mut item_errors = Vec::new();
		for obj in objects {
			let removed = match b.objects.get_mut(&obj.key) {
				Some(versions) => {
					let before = versions.len();
					versions.retain(|v| v.version_id != obj.version_id);
					let removed = versions.len() < before;
					if versions.is_empty() {
						b.objects.remove(&obj.key);
					}
					removed
				}
				None => false,
			};
			if !removed {
				item_errors.push(DeleteItemError {
					key: obj.key.clone(),
					version_id: obj.version_id.clone(),
					code: "NoSuchVersion".to_string(),
					message: "The specified version does not exist.".to_string(),
				});
			}
		}
		Ok(item_errors)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn seeded_store() -> MemStore {
		let store = MemStore::new();
		store.create_bucket("slave").await;
		for (key, body) in [
			("a/x", "ax-old"),
			("a/x", "ax-new"),
			("a/y", "ay"),
			("b/z", "bz"),
			("top", "top"),
		] {
			store
				.put_object("slave", key, Bytes::from_static(body.as_bytes()))
				.await
				.unwrap();
		}
		store
	}

	#[tokio::test]
	async fn delimiter_listing_surfaces_prefixes() {
		let store = seeded_store().await;
		let listing = store
			.list_object_versions("slave", "", "/", None)
			.await
			.unwrap();
		assert_eq!(listing.common_prefixes, vec!["a/", "b/"]);
		assert_eq!(listing.versions.len(), 1);
		assert_eq!(listing.versions[0].key, "top");
		assert!(listing.next_marker.is_none());
	}

	#[tokio::test]
	async fn latest_flag_marks_newest_version_only() {
		let store = seeded_store().await;
		let listing = store
			.list_object_versions("slave", "a/", "/", None)
			.await
			.unwrap();
		let x_versions: Vec<_> = listing
			.versions
			.iter()
			.filter(|v| v.key == "a/x")
			.collect();
		assert_eq!(x_versions.len(), 2);
		assert!(x_versions[0].is_latest);
		assert!(!x_versions[1].is_latest);
		let latest = store.latest_body("slave", "a/x").await.unwrap();
		assert_eq!(&latest[..], b"ax-new");
	}

	#[tokio::test]
	async fn pagination_walks_all_versions() {
		let store = MemStore::with_page_size(2);
		store.create_bucket("slave").await;
		for i in 0..5 {
			store
				.put_object("slave", &format!("k{}", i), Bytes::from("v"))
				.await
				.unwrap();
		}
		let mut marker = None;
		let mut seen = Vec::new();
		loop {
			let listing = store
				.list_object_versions("slave", "", "/", marker)
				.await
				.unwrap();
			assert!(listing.versions.len() <= 2);
			seen.extend(listing.versions.iter().map(|v| v.key.clone()));
			match listing.next_marker {
				Some(m) => marker = Some(m),
				None => break,
			}
		}
		assert_eq!(seen, vec!["k0", "k1", "k2", "k3", "k4"]);
	}

	#[tokio::test]
	async fn delete_is_idempotent_per_item() {
		let store = seeded_store().await;
		let ids = store.version_ids("slave").await;
		let victim = ids.iter().next().unwrap().clone();
		let objs = vec![
			ObjectIdent {
				key: "a/x".into(),
				version_id: victim.clone(),
			},
			ObjectIdent {
				key: "a/x".into(),
				version_id: "mem-nope".into(),
			},
		];
		let errors = store.delete_objects("slave", &objs).await.unwrap();
		assert_eq!(errors.len(), 1);
		assert!(errors[0].is_no_such_version());
		assert!(!store.version_ids("slave").await.contains(&victim));
	}

	#[tokio::test]
	async fn injected_get_faults_expire() {
		let store = seeded_store().await;
		store.fail_get("top", 2).await;
		let ids = store.version_ids("slave").await;
		let top_id = {
			let listing = store
				.list_object_versions("slave", "top", "", None)
				.await
				.unwrap();
			listing.versions[0].version_id.clone()
		};
		assert!(ids.contains(&top_id));
		assert!(store.get_object("slave", "top", &top_id).await.is_err());
		assert!(store.get_object("slave", "top", &top_id).await.is_err());
		assert!(store.get_object("slave", "top", &top_id).await.is_ok());
	}
}
