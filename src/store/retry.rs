//! Bounded retry with exponential backoff and jitter
//!
//! The same policy drives the snapshot crawler (which retries list calls
//! in place) and the restore pipeline (which requeues failed work items
//! but sleeps the same backoff curve between attempts).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::StoreError;

/// Attempt ceiling shared by every retrying pipeline
pub const MAX_RETRIES: u32 = 10;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// How often and how patiently to retry transient store errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_retries: u32,
	pub base_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: MAX_RETRIES,
			base_delay: DEFAULT_BASE_DELAY,
		}
	}
}

impl RetryPolicy {
	pub fn new(max_retries: u32, base_delay: Duration) -> Self {
		Self {
			max_retries,
			base_delay,
		}
	}

	/// Backoff before attempt number `attempt` (1-based): the base delay
	/// doubled per previous failure, capped, with uniform jitter so
	/// stalled workers do not thunder back in lockstep.
	pub fn delay(&self, attempt: u32) -> Duration {
		let exp = (self.base_delay.as_millis() as u64) << attempt.saturating_sub(1).min(10);
		let capped = exp.min(MAX_DELAY.as_millis() as u64);
		if capped == 0 {
			return Duration::ZERO;
		}
		let jitter = rand::thread_rng().gen_range(0..=capped / 2);
		Duration::from_millis(capped / 2 + jitter)
	}

	/// Run `op` until it succeeds, fails with a non-transient error, or
	/// exhausts the attempt budget.
	pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StoreError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, StoreError>>,
	{
		let mut attempt = 0;
		loop {
			match op().await {
				Ok(v) => return Ok(v),
				Err(e) if e.is_transient() => {
					attempt += 1;
					if attempt >= self.max_retries {
						return Err(StoreError::Fatal(format!(
							"{}: giving up after {} attempts: {}",
							label, attempt, e
						)));
					}
					warn!("{}: retry {}: {}", label, attempt, e);
					tokio::time::sleep(self.delay(attempt)).await;
				}
				Err(e) => return Err(e),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn fast_policy() -> RetryPolicy {
		RetryPolicy::new(MAX_RETRIES, Duration::ZERO)
	}

	#[tokio::test]
	async fn transient_errors_are_retried() {
		let calls = AtomicU32::new(0);
		let res = fast_policy()
			.run("test", || {
				let n = calls.fetch_add(1, Ordering::SeqCst);
				async move {
					if n < 3 {
						Err(StoreError::Transient("flaky".into()))
					} else {
						Ok(n)
					}
				}
			})
			.await;
		assert_eq!(res.unwrap(), 3);
		assert_eq!(calls.load(Ordering::SeqCst), 4);
	}

	#[tokio::test]
	async fn fatal_errors_surface_immediately() {
		let calls = AtomicU32::new(0);
		let res: Result<(), _> = fast_policy()
			.run("test", || {
				calls.fetch_add(1, Ordering::SeqCst);
				async { Err(StoreError::Fatal("denied".into())) }
			})
			.await;
		assert!(res.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn attempt_budget_is_bounded() {
		let calls = AtomicU32::new(0);
		let res: Result<(), _> = fast_policy()
			.run("test", || {
				calls.fetch_add(1, Ordering::SeqCst);
				async { Err(StoreError::Transient("still down".into())) }
			})
			.await;
		assert!(matches!(res, Err(StoreError::Fatal(_))));
		assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
	}

	#[test]
	fn delay_is_capped() {
		let policy = RetryPolicy::default();
		for attempt in 1..=20 {
			assert!(policy.delay(attempt) <= MAX_DELAY);
		}
	}

	#[test]
	fn zero_base_delay_stays_zero() {
		let policy = fast_policy();
		assert_eq!(policy.delay(5), Duration::ZERO);
	}
}
