//! Restore pipeline: two-stage download/upload of a manifest's versions
//!
//! A fixed pool of logical slots bounds both the in-flight work and the
//! bytes held in memory. The `ready` channel plays two roles: taking a
//! slot id out of it admits one more version into the pipeline, and the
//! main routine knows the restore is complete once it has received
//! every slot id back. Download and upload workers pull from shared
//! bounded queues; a failed item is requeued at the tail after a
//! backoff, and exhausting the retry budget aborts the whole restore.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use bmb_store::retry::RetryPolicy;
use bmb_store::ObjectStore;
use bmb_util::error::Error;

use crate::version::{Snapshot, Version};

/// Number of restore slots: at most this many objects are in flight,
/// and at most this many bodies are held in memory at once
pub const RESTORE_WORKER_COUNT: usize = 1024;

#[derive(Clone)]
pub struct RestoreOpts {
	pub worker_count: usize,
	pub retry: RetryPolicy,
}

impl Default for RestoreOpts {
	fn default() -> Self {
		Self {
			worker_count: RESTORE_WORKER_COUNT,
			retry: RetryPolicy::default(),
		}
	}
}

struct DownloadWork {
	slot: usize,
	version: Version,
	retry: u32,
}

struct UploadWork {
	slot: usize,
	version: Version,
	body: Bytes,
	retry: u32,
}

struct RestoreCtx {
	slave_store: Arc<dyn ObjectStore>,
	master_store: Arc<dyn ObjectStore>,
	slave_bucket: String,
	master_bucket: String,
	retry: RetryPolicy,
	downloads_tx: async_channel::Sender<DownloadWork>,
	uploads_tx: async_channel::Sender<UploadWork>,
	ready_tx: mpsc::Sender<usize>,
	fatal_tx: mpsc::Sender<Error>,
	exit_rx: watch::Receiver<bool>,
}

/// Copy every version of the snapshot from the slave bucket into the
/// master bucket. Separate store handles let master and slave live in
/// different regions. On success each version has been put into the
/// master exactly once; on failure the master may have been partially
/// written and the restore must be re-run.
pub async fn restore_snapshot(
	slave_store: Arc<dyn ObjectStore>,
	master_store: Arc<dyn ObjectStore>,
	slave_bucket: &str,
	master_bucket: &str,
	snapshot: &Snapshot,
	opts: RestoreOpts,
) -> Result<(), Error> {
	info!(
		"Restoring bucket {} to snapshot of {} ({} versions)",
		master_bucket,
		snapshot.timestamp,
		snapshot.contents.len()
	);

	let worker_count = opts.worker_count.max(1);
	let (ready_tx, mut ready_rx) = mpsc::channel(worker_count);
	let (downloads_tx, downloads_rx) = async_channel::bounded(worker_count);
	let (uploads_tx, uploads_rx) = async_channel::bounded(worker_count);
	let (fatal_tx, mut fatal_rx) = mpsc::channel(worker_count);
	let (exit_tx, exit_rx) = watch::channel(false);

	let ctx = Arc::new(RestoreCtx {
		slave_store,
		master_store,
		slave_bucket: slave_bucket.to_string(),
		master_bucket: master_bucket.to_string(),
		retry: opts.retry,
		downloads_tx: downloads_tx.clone(),
		uploads_tx,
		ready_tx,
		fatal_tx,
		exit_rx,
	});

	for slot in 0..worker_count {
		ctx.ready_tx.send(slot).await?;
		tokio::spawn(download_worker(ctx.clone(), downloads_rx.clone()));
		tokio::spawn(upload_worker(ctx.clone(), uploads_rx.clone()));
	}
	drop(downloads_rx);
	drop(uploads_rx);

	// Feed one download per version, taking a slot each time
	for version in snapshot.contents.iter() {
		let slot = tokio::select! {
			biased;
			Some(e) = fatal_rx.recv() => {
				shutdown(&exit_tx, &ctx);
				return Err(e);
			}
			Some(slot) = ready_rx.recv() => slot,
		};
		let work = DownloadWork {
			slot,
			version: version.clone(),
			retry: 0,
		};
		if downloads_tx.send(work).await.is_err() {
			shutdown(&exit_tx, &ctx);
			return Err(Error::Message("Restore pipeline closed unexpectedly".into()));
		}
	}

	// Completion barrier: every slot id must come back
	for remaining in (1..=worker_count).rev() {
		debug!("Wait for {} restore slots to finish", remaining);
		tokio::select! {
			biased;
			Some(e) = fatal_rx.recv() => {
				shutdown(&exit_tx, &ctx);
				return Err(e);
			}
			Some(_slot) = ready_rx.recv() => {}
		}
	}
	shutdown(&exit_tx, &ctx);

	info!(
		"Restored bucket {} to snapshot of {}",
		master_bucket, snapshot.timestamp
	);
	Ok(())
}

/// Close the work queues and raise the exit flag so every worker
/// unblocks and terminates, whether the restore succeeded or not.
fn shutdown(exit_tx: &watch::Sender<bool>, ctx: &RestoreCtx) {
	let _ = exit_tx.send(true);
	ctx.downloads_tx.close();
	ctx.uploads_tx.close();
}

async fn download_worker(ctx: Arc<RestoreCtx>, rx: async_channel::Receiver<DownloadWork>) {
	while let Ok(mut work) = rx.recv().await {
		if *ctx.exit_rx.borrow() {
			continue;
		}
		debug!(
			"[{}] Download version, retry {}: {}@{}",
			work.slot, work.retry, work.version.key, work.version.version_id
		);
		match ctx
			.slave_store
			.get_object(&ctx.slave_bucket, &work.version.key, &work.version.version_id)
			.await
		{
			Ok(body) => {
				let upload = UploadWork {
					slot: work.slot,
					version: work.version,
					body,
					retry: 0,
				};
				if ctx.uploads_tx.send(upload).await.is_err() {
					break;
				}
			}
			Err(e) => {
				work.retry += 1;
				if !e.is_transient() || work.retry >= ctx.retry.max_retries {
					error!(
						"[{}] Error downloading version {}@{}, retry {}: {}",
						work.slot, work.version.key, work.version.version_id, work.retry, e
					);
					let _ = ctx
						.fatal_tx
						.send(Error::Message(format!(
							"Could not download version {}@{}: {}",
							work.version.key, work.version.version_id, e
						)))
						.await;
					continue;
				}
				warn!(
					"[{}] Error downloading version {}@{}, retry {}: {}",
					work.slot, work.version.key, work.version.version_id, work.retry, e
				);
				tokio::time::sleep(ctx.retry.delay(work.retry)).await;
				if ctx.downloads_tx.send(work).await.is_err() {
					break;
				}
			}
		}
	}
}

async fn upload_worker(ctx: Arc<RestoreCtx>, rx: async_channel::Receiver<UploadWork>) {
	while let Ok(mut work) = rx.recv().await {
		if *ctx.exit_rx.borrow() {
			continue;
		}
		debug!(
			"[{}] Upload version, retry {}: {}@{}",
			work.slot, work.retry, work.version.key, work.version.version_id
		);
		match ctx
			.master_store
			.put_object(&ctx.master_bucket, &work.version.key, work.body.clone())
			.await
		{
			Ok(_new_version_id) => {
				info!(
					"[{}] Restored version: {}@{}",
					work.slot, work.version.key, work.version.version_id
				);
				if ctx.ready_tx.send(work.slot).await.is_err() {
					break;
				}
			}
			Err(e) => {
				work.retry += 1;
				if !e.is_transient() || work.retry >= ctx.retry.max_retries {
					error!(
						"[{}] Error uploading version {}@{}, retry {}: {}",
						work.slot, work.version.key, work.version.version_id, work.retry, e
					);
					let _ = ctx
						.fatal_tx
						.send(Error::Message(format!(
							"Could not upload version {}@{}: {}",
							work.version.key, work.version.version_id, e
						)))
						.await;
					continue;
				}
				warn!(
					"[{}] Error uploading version {}@{}, retry {}: {}",
					work.slot, work.version.key, work.version.version_id, work.retry, e
				);
				tokio::time::sleep(ctx.retry.delay(work.retry)).await;
				if ctx.uploads_tx.send(work).await.is_err() {
					break;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bmb_store::mem::MemStore;
	use bmb_util::time;
	use chrono::Utc;
	use std::time::Duration;

	fn fast_opts() -> RestoreOpts {
		RestoreOpts {
			worker_count: 4,
			retry: RetryPolicy::new(10, Duration::ZERO),
		}
	}

	fn as_version(key: &str, version_id: String, size: i64) -> Version {
		Version {
			key: key.to_string(),
			last_modified: Utc::now(),
			size,
			version_id,
		}
	}

	async fn seeded_stores() -> (Arc<MemStore>, Snapshot) {
		let store = Arc::new(MemStore::new());
		store.create_bucket("slave").await;
		store.create_bucket("master").await;

		let hello = store
			.put_object("slave", "greetings/first", Bytes::from_static(b"hello"))
			.await
			.unwrap();
		let world = store
			.put_object("slave", "greetings/second", Bytes::from_static(b"world"))
			.await
			.unwrap();
		// A newer slave version that the snapshot does not reference
		store
			.put_object("slave", "greetings/first", Bytes::from_static(b"newer"))
			.await
			.unwrap();

		let snapshot = Snapshot::new(
			time::now_local(),
			vec![
				as_version("greetings/first", hello, 5),
				as_version("greetings/second", world, 5),
			],
		);
		(store, snapshot)
	}

	async fn run_restore(
		store: &Arc<MemStore>,
		snapshot: &Snapshot,
		opts: RestoreOpts,
	) -> Result<(), Error> {
		restore_snapshot(
			store.clone(),
			store.clone(),
			"slave",
			"master",
			snapshot,
			opts,
		)
		.await
	}

	#[tokio::test]
	async fn round_trip_restores_recorded_bytes() {
		let (store, snapshot) = seeded_stores().await;
		run_restore(&store, &snapshot, fast_opts()).await.unwrap();

		// The recorded version's bytes, not the newer slave version
		let first = store.latest_body("master", "greetings/first").await.unwrap();
		assert_eq!(&first[..], b"hello");
		let second = store
			.latest_body("master", "greetings/second")
			.await
			.unwrap();
		assert_eq!(&second[..], b"world");
	}

	#[tokio::test]
	async fn empty_snapshot_restores_nothing() {
		let (store, _) = seeded_stores().await;
		let empty = Snapshot::new(time::now_local(), Vec::new());
		run_restore(&store, &empty, fast_opts()).await.unwrap();
		assert!(store.latest_body("master", "greetings/first").await.is_none());
	}

	#[tokio::test]
	async fn transient_download_failures_are_retried() {
		let (store, snapshot) = seeded_stores().await;
		store.fail_get("greetings/first", 3).await;
		run_restore(&store, &snapshot, fast_opts()).await.unwrap();
		let first = store.latest_body("master", "greetings/first").await.unwrap();
		assert_eq!(&first[..], b"hello");
	}

	#[tokio::test]
	async fn transient_upload_failures_are_retried() {
		let (store, snapshot) = seeded_stores().await;
		store.fail_put(2).await;
		run_restore(&store, &snapshot, fast_opts()).await.unwrap();
		let second = store
			.latest_body("master", "greetings/second")
			.await
			.unwrap();
		assert_eq!(&second[..], b"world");
	}

	#[tokio::test]
	async fn retry_exhaustion_aborts_the_restore() {
		let (store, snapshot) = seeded_stores().await;
		store.fail_get("greetings/first", 1000).await;
		assert!(run_restore(&store, &snapshot, fast_opts()).await.is_err());
	}

	#[tokio::test]
	async fn missing_version_is_fatal_without_retries() {
		let (store, mut snapshot) = seeded_stores().await;
		snapshot.contents[0].version_id = "mem-nope".to_string();
		assert!(run_restore(&store, &snapshot, fast_opts()).await.is_err());
	}
}
