//! backup-my-bucket CLI: snapshot, list, restore and garbage-collect
//! restoration points of a versioned S3 bucket

#[macro_use]
extern crate tracing;

mod cli;

use std::path::PathBuf;

use structopt::StructOpt;

use bmb_util::config::{read_config, Config};

use cli::*;

#[derive(StructOpt, Debug)]
#[structopt(
	name = "backup-my-bucket",
	about = "Point-in-time backup and restore for a versioned S3 bucket"
)]
struct Opt {
	/// Path to configuration file
	#[structopt(
		short = "c",
		long = "config",
		env = "BMB_CONFIG_FILE",
		default_value = "./backup-my-bucket.conf"
	)]
	pub config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Command,
}

#[tokio::main]
async fn main() {
	let opt = Opt::from_args();

	// Configuration is needed before logging can be set up, so its
	// own errors go straight to stderr
	let config = match read_config(opt.config_file.clone()) {
		Ok(config) => config,
		Err(e) => {
			eprintln!(
				"Error in configuration file {}: {}",
				opt.config_file.display(),
				e
			);
			std::process::exit(1);
		}
	};

	init_logging(&config);

	let res = match opt.cmd {
		Command::Snapshot => cmd_snapshot(&config).await,
		Command::ListSnapshots => cmd_list_snapshots(&config),
		Command::Restore(restore_opt) => cmd_restore(&config, restore_opt).await,
		Command::Gc => cmd_gc(&config).await,
	};

	if let Err(e) = res {
		error!("{}", e);
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

/// Initialize stderr logging. `RUST_LOG` wins when set; otherwise the
/// filter is derived from the configuration's log levels.
fn init_logging(config: &Config) {
	if std::env::var("RUST_LOG").is_err() {
		let app = match config.log_level {
			0 => "error",
			1 => "info",
			_ => "debug",
		};
		let aws = match config.aws_log_level {
			0 => "error",
			1 => "warn",
			2 => "info",
			3 => "debug",
			_ => "trace",
		};
		std::env::set_var(
			"RUST_LOG",
			format!(
				"backup_my_bucket={app},bmb_backup={app},bmb_store={app},bmb_util={app},aws_config={aws},aws_sdk_s3={aws},aws_smithy_runtime={aws}",
				app = app,
				aws = aws
			),
		);
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	if config.syslog {
		warn!("Syslog output is not supported, logging to stderr instead");
	}
}
