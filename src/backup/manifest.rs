//! Reading and writing snapshot manifests on local disk
//!
//! A manifest is an indented JSON rendering of a [`Snapshot`], named
//! after its timestamp and transparently gzip-compressed when the file
//! name carries the `.Z` suffix. Manifests are never rewritten in
//! place: the crawler writes them once and the garbage collector
//! removes them.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use bmb_util::error::{Error, ErrorContext};
use bmb_util::time;

use crate::version::Snapshot;

/// Suffix of compressed manifests
pub const COMPRESSED_SUFFIX: &str = "Z";

/// Load every manifest in the snapshots directory, oldest first.
/// Any unreadable or unparsable manifest is a fatal error: a corrupt
/// snapshots directory needs an operator, not a silent skip.
pub fn load_all(dir: &Path) -> Result<Vec<Snapshot>, Error> {
	info!("Loading snapshots from {}", dir.display());
	let mut snapshots = Vec::new();
	for entry in std::fs::read_dir(dir)
		.err_context(format!("Could not list snapshots directory {}", dir.display()))?
	{
		let entry = entry?;
		if !entry.file_type()?.is_file() {
			continue;
		}
		snapshots.push(load_one(&entry.path())?);
	}
	snapshots.sort_by_key(|s| s.timestamp);
	Ok(snapshots)
}

/// Load one manifest, decompressing iff the name ends in `.Z`,
/// and record the path it came from.
pub fn load_one(path: &Path) -> Result<Snapshot, Error> {
	info!("Loading snapshot file {}", path.display());
	let compressed = path.extension() == Some(std::ffi::OsStr::new(COMPRESSED_SUFFIX));
	let file = OpenOptions::new()
		.read(true)
		.open(path)
		.err_context(format!("Could not open snapshot file {}", path.display()))?;

	let mut bytes = Vec::new();
	if compressed {
		GzDecoder::new(file)
			.read_to_end(&mut bytes)
			.err_context(format!(
				"Could not read compressed snapshot file {}",
				path.display()
			))?;
	} else {
		let mut file = file;
		file.read_to_end(&mut bytes)
			.err_context(format!("Could not read snapshot file {}", path.display()))?;
	}

	let mut snapshot: Snapshot = serde_json::from_slice(&bytes)
		.err_context(format!("Could not parse snapshot file {}", path.display()))?;
	snapshot.file = path.to_path_buf();
	Ok(snapshot)
}

/// Persist a snapshot into the snapshots directory, filling in its
/// `file` field, and return the path written.
pub fn write(snapshot: &mut Snapshot, dir: &Path, compress: bool) -> Result<PathBuf, Error> {
	let mut name = time::timestamp_str(&snapshot.timestamp);
	if compress {
		name.push('.');
		name.push_str(COMPRESSED_SUFFIX);
	}
	let path = dir.join(name);
	info!("Dumping snapshot to {}", path.display());

	let bytes = serde_json::to_vec_pretty(&snapshot)?;
	let file = OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(0o644)
		.open(&path)
		.err_context(format!("Could not open snapshot file {}", path.display()))?;

	if compress {
		let mut encoder = GzEncoder::new(file, Compression::default());
		encoder
			.write_all(&bytes)
			.and_then(|_| encoder.finish().map(|_| ()))
			.err_context(format!(
				"Could not write compressed snapshot file {}",
				path.display()
			))?;
	} else {
		let mut file = file;
		file.write_all(&bytes)
			.err_context(format!("Could not write snapshot file {}", path.display()))?;
	}

	snapshot.file = path.clone();
	Ok(path)
}

/// Unlink one manifest
pub fn remove(path: &Path) -> Result<(), Error> {
	std::fs::remove_file(path)
		.err_context(format!("Error removing snapshot {}", path.display()))
}
