//! Utility crate for backup-my-bucket: error type, configuration, timestamps

#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod time;
