//! Error type and helpers used in all crates of backup-my-bucket

use std::borrow::Borrow;
use std::fmt;
use std::io;

use err_derive::Error;

/// Errors of this crate
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(from)] io::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(from)] serde_json::Error),

	#[error(display = "{}", _0)]
	Message(String),
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.to_string())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Error {
		Error::Message("MPSC send error".to_string())
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(e: tokio::task::JoinError) -> Error {
		Error::Message(format!("Task join error: {}", e))
	}
}

/// Trait to map any error type to Error: message with context
pub trait ErrorContext<T, E> {
	fn err_context<C: Borrow<str>>(self, ctx: C) -> Result<T, Error>;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
	E: fmt::Display,
{
	#[inline]
	fn err_context<C: Borrow<str>>(self, ctx: C) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", ctx.borrow(), e)))
	}
}

/// Trait to map Option<T> to Err(Error::Message(_))
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::Message(message.into())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn err_context_prepends_message() {
		let res: Result<(), io::Error> =
			Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
		let err = res.err_context("reading manifest").unwrap_err();
		assert_eq!(err.to_string(), "reading manifest: no such file");
	}

	#[test]
	fn ok_or_message_on_none() {
		let v: Option<u32> = None;
		assert!(matches!(
			v.ok_or_message("missing value"),
			Err(Error::Message(m)) if m == "missing value"
		));
	}
}
