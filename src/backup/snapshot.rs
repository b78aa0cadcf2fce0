//! Snapshot crawler: fan-out traversal of the slave bucket
//!
//! Work units are key prefixes. A dispatcher hands prefixes to a
//! bounded pool of logical workers; each worker pages through
//! `list_object_versions` for its prefix, reports sub-prefixes
//! surfaced by the delimiter back to the dispatcher, buffers the
//! versions flagged latest, and ships the buffer through the versions
//! funnel when its prefix is exhausted. The crawl ends when no prefix
//! is in flight and none is pending.
//!
//! A worker sends all of its discoveries and then its done signal on
//! the same channel, so the dispatcher can never observe a done before
//! the work requests that preceded it.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use bmb_store::retry::RetryPolicy;
use bmb_store::{ObjectStore, PageMarker};
use bmb_util::error::Error;
use bmb_util::time;

use crate::version::{Snapshot, Version};

/// Upper bound on concurrently explored prefixes
pub const SNAPSHOT_WORKER_COUNT: usize = 128;

/// Listing delimiter: key segments become explorable directories
const DELIMITER: &str = "/";

#[derive(Clone)]
pub struct SnapshotOpts {
	pub worker_count: usize,
	pub retry: RetryPolicy,
}

impl Default for SnapshotOpts {
	fn default() -> Self {
		Self {
			worker_count: SNAPSHOT_WORKER_COUNT,
			retry: RetryPolicy::default(),
		}
	}
}

enum WorkerEvent {
	/// A sub-prefix to explore, discovered while paging
	Discovered(String),
	/// The worker finished its prefix cleanly
	Done(usize),
	/// The worker aborted; the whole crawl fails with this error
	Failed(usize, Error),
}

struct Crawler {
	store: Arc<dyn ObjectStore>,
	bucket: String,
	retry: RetryPolicy,
	event_tx: mpsc::Sender<WorkerEvent>,
	funnel_tx: mpsc::Sender<Vec<Version>>,
	exit_rx: watch::Receiver<bool>,
}

/// Crawl the bucket and return the snapshot of every key's current
/// version. The timestamp is taken at crawl start; persistence is up
/// to the caller.
pub async fn take_snapshot(
	store: Arc<dyn ObjectStore>,
	bucket: &str,
	opts: SnapshotOpts,
) -> Result<Snapshot, Error> {
	let timestamp = time::now_local();
	info!(
		"Taking snapshot {} of bucket {}",
		time::timestamp_str(&timestamp),
		bucket
	);

	let worker_count = opts.worker_count.max(1);
	let (event_tx, event_rx) = mpsc::channel(worker_count);
	let (funnel_tx, mut funnel_rx) = mpsc::channel(worker_count);
	let (exit_tx, exit_rx) = watch::channel(false);

	let crawler = Arc::new(Crawler {
		store,
		bucket: bucket.to_string(),
		retry: opts.retry,
		event_tx,
		funnel_tx,
		exit_rx,
	});
	let dispatcher = tokio::spawn(dispatch_workers(crawler, worker_count, event_rx, exit_tx));

	let mut versions = Vec::new();
	while let Some(mut batch) = funnel_rx.recv().await {
		versions.append(&mut batch);
	}
	dispatcher.await??;

	info!(
		"Snapshot of bucket {} is done, {} versions recorded",
		bucket,
		versions.len()
	);
	Ok(Snapshot::new(timestamp, versions))
}

/// Owns the ready-worker list, the pending-prefix queue and the
/// in-flight count. Terminates once nothing is in flight: pending can
/// only be non-empty while a worker is, since prefixes are discovered
/// by workers.
async fn dispatch_workers(
	crawler: Arc<Crawler>,
	worker_count: usize,
	mut event_rx: mpsc::Receiver<WorkerEvent>,
	exit_tx: watch::Sender<bool>,
) -> Result<(), Error> {
	let mut ready: Vec<usize> = (0..worker_count).collect();
	let mut pending: VecDeque<String> = VecDeque::new();
	let mut in_flight = 0usize;
	let mut failure: Option<Error> = None;

	if let Some(wid) = ready.pop() {
		spawn_worker(crawler.clone(), wid, String::new());
		in_flight += 1;
	}

	while in_flight > 0 {
		match event_rx.recv().await {
			Some(WorkerEvent::Discovered(prefix)) => {
				if failure.is_some() {
					continue;
				}
				match ready.pop() {
					Some(wid) => {
						spawn_worker(crawler.clone(), wid, prefix);
						in_flight += 1;
					}
					None => pending.push_back(prefix),
				}
			}
			Some(WorkerEvent::Done(wid)) => {
				in_flight -= 1;
				match pending.pop_front() {
					Some(prefix) => {
						spawn_worker(crawler.clone(), wid, prefix);
						in_flight += 1;
					}
					None => ready.push(wid),
				}
			}
			Some(WorkerEvent::Failed(wid, e)) => {
				error!("Snapshot worker [{}] failed: {}", wid, e);
				in_flight -= 1;
				ready.push(wid);
				if failure.is_none() {
					let _ = exit_tx.send(true);
					pending.clear();
					failure = Some(e);
				}
			}
			// All workers hold an event sender while running
			None => break,
		}
	}
	debug!("All snapshot workers finished");

	match failure {
		Some(e) => Err(e),
		None => Ok(()),
	}
}

fn spawn_worker(crawler: Arc<Crawler>, wid: usize, prefix: String) {
	tokio::spawn(async move {
		match crawler.explore_prefix(wid, &prefix).await {
			Ok(versions) => {
				let _ = crawler.funnel_tx.send(versions).await;
				let _ = crawler.event_tx.send(WorkerEvent::Done(wid)).await;
			}
			Err(e) => {
				let _ = crawler.event_tx.send(WorkerEvent::Failed(wid, e)).await;
			}
		}
	});
}

impl Crawler {
	/// Page through one prefix, reporting discovered sub-prefixes as
	/// they appear and buffering the versions flagged latest.
	async fn explore_prefix(&self, wid: usize, prefix: &str) -> Result<Vec<Version>, Error> {
		info!("[{}] Explore prefix '{}'", wid, prefix);

		let mut versions = Vec::new();
		let mut marker: Option<PageMarker> = None;
		let mut page = 0u64;
		loop {
			if *self.exit_rx.borrow() {
				// Another worker failed; partial results are discarded
				return Ok(Vec::new());
			}
			page += 1;
			debug!("[{}] Request page {} for prefix '{}'", wid, page, prefix);
			let listing = self
				.retry
				.run("ListObjectVersions", || {
					self.store.list_object_versions(
						&self.bucket,
						prefix,
						DELIMITER,
						marker.clone(),
					)
				})
				.await?;

			for discovered in listing.common_prefixes {
				info!("[{}] Discover prefix '{}'", wid, discovered);
				self.event_tx
					.send(WorkerEvent::Discovered(discovered))
					.await?;
			}

			for entry in listing.versions {
				if !entry.is_latest {
					debug!("[{}] Skip noncurrent version of key '{}'", wid, entry.key);
					continue;
				}
				if entry.key.is_empty() || entry.version_id.is_empty() {
					return Err(Error::Message(format!(
						"Listing under prefix '{}' returned a latest version with an empty key or version id",
						prefix
					)));
				}
				versions.push(Version::from(entry));
			}

			match listing.next_marker {
				Some(m) => marker = Some(m),
				None => break,
			}
		}

		info!(
			"[{}] Done exploring prefix '{}', {} latest versions",
			wid,
			prefix,
			versions.len()
		);
		Ok(versions)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bmb_store::mem::MemStore;
	use bytes::Bytes;
	use std::collections::BTreeSet;
	use std::time::Duration;

	fn fast_opts() -> SnapshotOpts {
		SnapshotOpts {
			worker_count: 8,
			retry: RetryPolicy::new(5, Duration::ZERO),
		}
	}

	async fn slave_with_tree() -> (Arc<MemStore>, BTreeSet<String>) {
		let store = Arc::new(MemStore::with_page_size(1));
		store.create_bucket("slave").await;
		// a/x has a noncurrent version that must not be recorded
		store
			.put_object("slave", "a/x", Bytes::from_static(b"old"))
			.await
			.unwrap();
		let mut latest = BTreeSet::new();
		for (key, body) in [
			("a/x", "new"),
			("a/y", "ay"),
			("a/deep/w", "w"),
			("b/z", "bz"),
			("top", "top"),
		] {
			let id = store
				.put_object("slave", key, Bytes::from_static(body.as_bytes()))
				.await
				.unwrap();
			latest.insert(id);
		}
		(store, latest)
	}

	#[tokio::test]
	async fn empty_bucket_yields_empty_snapshot() {
		let store = Arc::new(MemStore::new());
		store.create_bucket("slave").await;
		let before = time::now_local();
		let snapshot = take_snapshot(store, "slave", fast_opts()).await.unwrap();
		assert!(snapshot.contents.is_empty());
		let elapsed = snapshot.timestamp.signed_duration_since(before);
		assert!(elapsed.num_seconds().abs() < 1);
	}

	#[tokio::test]
	async fn nested_prefixes_record_latest_versions_only() {
		let (store, latest) = slave_with_tree().await;
		let snapshot = take_snapshot(store, "slave", fast_opts()).await.unwrap();

		let recorded: BTreeSet<String> = snapshot
			.contents
			.iter()
			.map(|v| v.version_id.clone())
			.collect();
		assert_eq!(recorded, latest);
		// Each key appears at most once
		let keys: BTreeSet<&str> = snapshot.contents.iter().map(|v| v.key.as_str()).collect();
		assert_eq!(keys.len(), snapshot.contents.len());
	}

	#[tokio::test]
	async fn transient_list_errors_are_retried() {
		let (store, latest) = slave_with_tree().await;
		store.fail_list(3).await;
		let snapshot = take_snapshot(store, "slave", fast_opts()).await.unwrap();
		let recorded: BTreeSet<String> = snapshot
			.contents
			.iter()
			.map(|v| v.version_id.clone())
			.collect();
		assert_eq!(recorded, latest);
	}

	#[tokio::test]
	async fn persistent_list_errors_abort_the_crawl() {
		let (store, _) = slave_with_tree().await;
		store.fail_list(1000).await;
		assert!(take_snapshot(store, "slave", fast_opts()).await.is_err());
	}

	#[tokio::test]
	async fn missing_bucket_is_fatal() {
		let store = Arc::new(MemStore::new());
		assert!(take_snapshot(store, "slave", fast_opts()).await.is_err());
	}
}
