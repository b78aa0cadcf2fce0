//! Garbage collection of old snapshots and the versions only they hold
//!
//! Snapshots older than the retention period are removed together with
//! every slave-side version that no surviving snapshot references.
//! Version deletion happens strictly before manifest removal, so an
//! aborted run never leaves a manifest pointing at deleted versions,
//! and deletes are idempotent so a re-run converges.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, FixedOffset};

use bmb_store::{ObjectIdent, ObjectStore};
use bmb_util::error::Error;

use crate::manifest;
use crate::version::Snapshot;

/// Versions deleted per DeleteObjects call, the S3 per-request maximum
pub const GC_BATCH_SIZE: usize = 1000;

/// Remove snapshots older than `retention_days` and delete the
/// versions that only they reference. Refuses to run when doing so
/// could drop the total snapshot count to `minimum_redundancy` or
/// below; the floor is about absolute count, not age.
pub async fn collect_garbage(
	store: &dyn ObjectStore,
	bucket: &str,
	snapshots_dir: &Path,
	minimum_redundancy: usize,
	retention_days: i64,
	now: DateTime<FixedOffset>,
) -> Result<(), Error> {
	info!("Garbage collecting obsolete snapshots");

	let snapshots = manifest::load_all(snapshots_dir)?;
	if snapshots.len() <= minimum_redundancy {
		return Err(Error::Message(format!(
			"Minimum redundancy is not met. Current snapshot count is {}.",
			snapshots.len()
		)));
	}

	let (old, recent) = partition_snapshots(snapshots, now, retention_days);
	let to_remove = obsolete_versions(&old, &recent);
	info!(
		"{} old snapshots, {} recent; {} versions to delete",
		old.len(),
		recent.len(),
		to_remove.len()
	);

	delete_versions(store, bucket, &to_remove).await?;
	remove_snapshots(&old);
	Ok(())
}

/// Split snapshots into old (beyond the retention period) and recent
fn partition_snapshots(
	snapshots: Vec<Snapshot>,
	now: DateTime<FixedOffset>,
	retention_days: i64,
) -> (Vec<Snapshot>, Vec<Snapshot>) {
	let cutoff = now - Duration::days(retention_days);
	info!("Retention period is from {} up until now", cutoff);

	let mut old = Vec::new();
	let mut recent = Vec::new();
	for snapshot in snapshots {
		if snapshot.timestamp < cutoff {
			info!(
				"Snapshot '{}' on {} is old",
				snapshot.file.display(),
				snapshot.timestamp
			);
			old.push(snapshot);
		} else {
			info!(
				"Snapshot '{}' on {} is recent",
				snapshot.file.display(),
				snapshot.timestamp
			);
			recent.push(snapshot);
		}
	}
	(old, recent)
}

/// Versions referenced by old snapshots but by no recent one,
/// deduplicated, in discovery order
fn obsolete_versions(old: &[Snapshot], recent: &[Snapshot]) -> Vec<ObjectIdent> {
	let mut seen: HashSet<&str> = recent
		.iter()
		.flat_map(|s| s.contents.iter())
		.map(|v| v.version_id.as_str())
		.collect();

	let mut to_remove = Vec::new();
	for snapshot in old {
		debug!(
			"Discriminating versions of old snapshot '{}'",
			snapshot.file.display()
		);
		for version in &snapshot.contents {
			if seen.insert(version.version_id.as_str()) {
				debug!("Will remove version {}@{}", version.key, version.version_id);
				to_remove.push(ObjectIdent {
					key: version.key.clone(),
					version_id: version.version_id.clone(),
				});
			}
		}
	}
	to_remove
}

/// Delete versions in sequential batches. A version that is already
/// gone is logged and tolerated; any other failure aborts before the
/// remaining batches, leaving all manifests in place.
async fn delete_versions(
	store: &dyn ObjectStore,
	bucket: &str,
	versions: &[ObjectIdent],
) -> Result<(), Error> {
	for (batch_no, batch) in versions.chunks(GC_BATCH_SIZE).enumerate() {
		debug!("Delete batch {} ({} versions)", batch_no, batch.len());
		let item_errors = store
			.delete_objects(bucket, batch)
			.await
			.map_err(Error::from)?;
		for item in item_errors {
			if item.is_no_such_version() {
				info!(
					"Version {}@{} was already deleted",
					item.key, item.version_id
				);
			} else {
				return Err(Error::Message(format!(
					"Could not delete version {}@{}: {} ({})",
					item.key, item.version_id, item.code, item.message
				)));
			}
		}
	}
	Ok(())
}

/// Unlink old manifests; one failed unlink does not stop the others
fn remove_snapshots(snapshots: &[Snapshot]) {
	for snapshot in snapshots {
		if let Err(e) = manifest::remove(&snapshot.file) {
			error!("{}", e);
		}
	}
}
