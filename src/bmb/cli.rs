use std::sync::Arc;

use format_table::format_table;
use structopt::StructOpt;

use bmb_backup::version::Snapshot;
use bmb_backup::{gc, manifest, restore, snapshot};
use bmb_store::s3::S3Store;
use bmb_store::ObjectStore;
use bmb_util::config::{manifest_path, Config};
use bmb_util::error::Error;
use bmb_util::time;

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Create a restoration point
	#[structopt(name = "snapshot")]
	Snapshot,

	/// List available restoration points
	#[structopt(name = "list-snapshots")]
	ListSnapshots,

	/// Restore master bucket at the given restoration point
	#[structopt(name = "restore")]
	Restore(RestoreOpt),

	/// Garbage collect obsolete restoration points
	#[structopt(name = "gc")]
	Gc,
}

#[derive(StructOpt, Debug)]
pub struct RestoreOpt {
	/// Manifest file name, as printed by list-snapshots
	pub snapshot_name: String,
}

fn slave_store(config: &Config) -> S3Store {
	let set = &config.backup_set;
	S3Store::new(&set.slave_region, &set.access_key, &set.secret_key)
}

pub async fn cmd_snapshot(config: &Config) -> Result<(), Error> {
	let set = &config.backup_set;
	let store = Arc::new(slave_store(config));
	let mut snap =
		snapshot::take_snapshot(store, &set.slave_bucket, snapshot::SnapshotOpts::default())
			.await?;
	manifest::write(&mut snap, &set.snapshots_dir, set.compress_snapshots)?;
	Ok(())
}

pub fn cmd_list_snapshots(config: &Config) -> Result<(), Error> {
	let snapshots = manifest::load_all(&config.backup_set.snapshots_dir)?;
	let mut table = vec!["Snapshot\tTimestamp\tKeys\tTotal size".to_string()];
	for snapshot in snapshots.iter() {
		table.push(format!(
			"{}\t{}\t{}\t{}",
			manifest_file_name(snapshot),
			snapshot.timestamp.format("%Y-%m-%d %H:%M:%S %z"),
			snapshot.contents.len(),
			bytesize::ByteSize::b(snapshot.total_size().max(0) as u64),
		));
	}
	format_table(table);
	Ok(())
}

pub async fn cmd_restore(config: &Config, opt: RestoreOpt) -> Result<(), Error> {
	let set = &config.backup_set;
	let snap = manifest::load_one(&manifest_path(set, &opt.snapshot_name))?;

	let slave = Arc::new(slave_store(config));
	// Master and slave buckets may live in different regions
	let master: Arc<dyn ObjectStore> = if set.master_region == set.slave_region {
		slave.clone()
	} else {
		Arc::new(S3Store::new(
			&set.master_region,
			&set.access_key,
			&set.secret_key,
		))
	};

	restore::restore_snapshot(
		slave,
		master,
		&set.slave_bucket,
		&set.master_bucket,
		&snap,
		restore::RestoreOpts::default(),
	)
	.await
}

pub async fn cmd_gc(config: &Config) -> Result<(), Error> {
	let set = &config.backup_set;
	let store = slave_store(config);
	gc::collect_garbage(
		&store,
		&set.slave_bucket,
		&set.snapshots_dir,
		set.minimum_redundancy,
		set.retention_policy,
		time::now_local(),
	)
	.await
}

fn manifest_file_name(snapshot: &Snapshot) -> String {
	snapshot
		.file
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default()
}
