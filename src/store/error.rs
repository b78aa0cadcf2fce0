//! Store error classification

use err_derive::Error;

/// Errors returned by [`ObjectStore`](crate::ObjectStore) operations,
/// classified the way the pipelines need them: transient errors are
/// eligible for retry, a missing version is tolerated by idempotent
/// deletes, everything else surfaces immediately.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Network failures, timeouts, throttling, 5xx responses
	#[error(display = "transient store error: {}", _0)]
	Transient(String),

	/// The requested version does not exist (delete path only; a missing
	/// version on get is fatal and reported as such by implementations)
	#[error(display = "no such version: {}", _0)]
	NoSuchVersion(String),

	/// Authentication failures, malformed requests, missing objects
	#[error(display = "store error: {}", _0)]
	Fatal(String),
}

impl StoreError {
	pub fn is_transient(&self) -> bool {
		matches!(self, StoreError::Transient(_))
	}

	pub fn is_no_such_version(&self) -> bool {
		matches!(self, StoreError::NoSuchVersion(_))
	}
}

impl From<StoreError> for bmb_util::error::Error {
	fn from(e: StoreError) -> bmb_util::error::Error {
		bmb_util::error::Error::Message(e.to_string())
	}
}
