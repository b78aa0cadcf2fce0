//! Contains type and functions related to the backup-my-bucket configuration file

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Contents of the configuration file, `./backup-my-bucket.conf` by default.
/// Member names are spelled in PascalCase on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
	/// Application log level: 0 = quiet, 1 = info, 2 = debug
	#[serde(default)]
	pub log_level: u32,
	/// AWS SDK log level, 0 (off) to 5 (most verbose)
	#[serde(default)]
	pub aws_log_level: u32,
	/// Request syslog output instead of stderr
	#[serde(default)]
	pub syslog: bool,
	/// The backup set operated on by every subcommand
	pub backup_set: BackupSet,
}

/// One backup set: a master bucket replicated into a versioned slave bucket,
/// with snapshot manifests kept in a local directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupSet {
	/// Directory where snapshot manifests are written
	pub snapshots_dir: PathBuf,
	/// Gzip manifests on write (`.Z` suffix)
	#[serde(default)]
	pub compress_snapshots: bool,
	/// Lower bound on the number of snapshots GC must leave behind
	pub minimum_redundancy: usize,
	/// Snapshots older than this many days are eligible for GC
	pub retention_policy: i64,
	/// Live bucket that restores write into
	pub master_bucket: String,
	pub master_region: String,
	/// Versioned bucket that snapshots enumerate
	pub slave_bucket: String,
	pub slave_region: String,
	pub access_key: String,
	pub secret_key: String,
}

/// Read and parse the configuration file, checking the invariants
/// the subcommands rely on.
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	debug!("Reading configuration file {}", config_file.display());
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	let config: Config = serde_json::from_str(&config)?;
	check_config(&config)?;

	Ok(config)
}

fn check_config(config: &Config) -> Result<(), Error> {
	let set = &config.backup_set;
	if set.minimum_redundancy < 1 {
		return Err(Error::Message(
			"MinimumRedundancy must be at least 1".into(),
		));
	}
	if set.retention_policy < 0 {
		return Err(Error::Message("RetentionPolicy must not be negative".into()));
	}
	if set.master_bucket.is_empty() || set.slave_bucket.is_empty() {
		return Err(Error::Message(
			"MasterBucket and SlaveBucket must not be empty".into(),
		));
	}
	if !set.snapshots_dir.is_dir() {
		return Err(Error::Message(format!(
			"SnapshotsDir {} is not a directory",
			set.snapshots_dir.display()
		)));
	}
	Ok(())
}

/// Path of a manifest inside the snapshots directory
pub fn manifest_path(set: &BackupSet, file_name: &str) -> PathBuf {
	set.snapshots_dir.join(file_name)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_config(dir: &Path) -> String {
		format!(
			r#"{{
				"LogLevel": 1,
				"AwsLogLevel": 0,
				"Syslog": false,
				"BackupSet": {{
					"SnapshotsDir": "{}",
					"CompressSnapshots": true,
					"MinimumRedundancy": 2,
					"RetentionPolicy": 30,
					"MasterBucket": "master",
					"MasterRegion": "us-east-1",
					"SlaveBucket": "slave",
					"SlaveRegion": "us-west-2",
					"AccessKey": "AK",
					"SecretKey": "SK"
				}}
			}}"#,
			dir.display()
		)
	}

	#[test]
	fn parse_and_validate() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let path = dir.as_path().join("backup-my-bucket.conf");
		std::fs::write(&path, sample_config(dir.as_path())).unwrap();

		let config = read_config(path).unwrap();
		assert_eq!(config.log_level, 1);
		assert!(config.backup_set.compress_snapshots);
		assert_eq!(config.backup_set.minimum_redundancy, 2);
		assert_eq!(config.backup_set.retention_policy, 30);
		assert_eq!(config.backup_set.slave_bucket, "slave");
	}

	#[test]
	fn reject_zero_redundancy() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let text = sample_config(dir.as_path()).replace(
			"\"MinimumRedundancy\": 2",
			"\"MinimumRedundancy\": 0",
		);
		let path = dir.as_path().join("backup-my-bucket.conf");
		std::fs::write(&path, text).unwrap();

		assert!(read_config(path).is_err());
	}

	#[test]
	fn reject_missing_snapshots_dir() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let missing = dir.as_path().join("nope");
		let text = sample_config(&missing);
		let path = dir.as_path().join("backup-my-bucket.conf");
		std::fs::write(&path, text).unwrap();

		assert!(read_config(path).is_err());
	}
}
