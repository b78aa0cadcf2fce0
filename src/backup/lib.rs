//! Core pipelines of backup-my-bucket
//!
//! Three pipelines run against the versioned object store:
//! - the snapshot crawler enumerates the latest version of every key in
//!   the slave bucket and records them in a manifest,
//! - the restore pipeline copies a manifest's versions back into the
//!   master bucket,
//! - the garbage collector prunes old manifests together with the
//!   slave-side versions only they reference.

#[macro_use]
extern crate tracing;

pub mod gc;
pub mod manifest;
pub mod restore;
pub mod snapshot;
pub mod version;
