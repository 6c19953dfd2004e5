// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Polls a check on a fixed interval until it succeeds or a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedRetry {
	pub interval: Duration,
	pub timeout: Duration,
}

impl TimedRetry {
	pub fn new(interval: Duration, timeout: Duration) -> Self {
		Self { interval, timeout }
	}

	pub fn every_second(timeout: Duration) -> Self {
		Self::new(Duration::from_secs(1), timeout)
	}

	/// Run `check` until it yields `Some`, an error, or the timeout elapses.
	///
	/// `check` always runs at least once, and once more at the deadline. No
	/// lock is held while sleeping.
	pub async fn poll<T, E, F, Fut>(&self, mut check: F) -> Result<Option<T>, E>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<Option<T>, E>>,
	{
		let deadline = Instant::now() + self.timeout;
		loop {
			if let Some(found) = check().await? {
				return Ok(Some(found));
			}

			let now = Instant::now();
			if now >= deadline {
				return Ok(None);
			}
			tokio::time::sleep(self.interval.min(deadline - now)).await;
		}
	}

	/// Run `predicate` until it returns `true` or the timeout elapses.
	pub async fn until<F, Fut>(&self, mut predicate: F) -> bool
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = bool>,
	{
		let result: Result<Option<()>, std::convert::Infallible> = self
			.poll(|| {
				let attempt = predicate();
				async move { Ok(attempt.await.then_some(())) }
			})
			.await;
		matches!(result, Ok(Some(())))
	}
}

/// Poll `predicate` once a second for up to `timeout_secs` seconds.
pub async fn retry_every_second_until<F, Fut>(timeout_secs: u64, predicate: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	TimedRetry::every_second(Duration::from_secs(timeout_secs))
		.until(predicate)
		.await
}
