use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::export::{BulkSink, ExportError, ExportOutcome};
use crate::observability::{LogHandle, MetricsRegistry};
use crate::persist::Batch;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Cooperative stop signal, checked between files and between batches.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	/// Sleep for `total`, waking early once cancelled.
	pub async fn sleep(&self, total: Duration) {
		let step = Duration::from_millis(200);
		let deadline = Instant::now() + total;
		while !self.is_cancelled() {
			let now = Instant::now();
			if now >= deadline {
				break;
			}
			tokio::time::sleep(step.min(deadline - now)).await;
		}
	}
}

/// How batches of one file are handed to the sink. Both variants drive the
/// same delivery path; they only differ in how many requests are in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
	/// One request at a time, in batch order.
	Sequential,
	/// Up to `workers` requests in flight.
	Concurrent { workers: usize },
}

impl Scheduler {
	pub fn from_workers(workers: usize) -> Self {
		if workers <= 1 {
			Scheduler::Sequential
		} else {
			Scheduler::Concurrent { workers }
		}
	}

	pub fn in_flight(&self) -> usize {
		match self {
			Scheduler::Sequential => 1,
			Scheduler::Concurrent { workers } => (*workers).max(1),
		}
	}
}

/// Session-level retry of whole batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub max_retries: u32,
	pub initial_backoff: Duration,
}

impl RetryPolicy {
	pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
		Self {
			max_retries,
			initial_backoff: Duration::from_millis(initial_backoff_ms),
		}
	}

	/// Wait before retry number `retry` (1-based): doubling, capped at 10s.
	pub fn delay(&self, retry: u32) -> Duration {
		let factor = 2u32.saturating_pow(retry.saturating_sub(1));
		self.initial_backoff.saturating_mul(factor).min(MAX_BACKOFF)
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::new(3, 500)
	}
}

/// Final result of handing one batch to the sink.
#[derive(Debug)]
pub struct Delivery {
	pub size: usize,
	pub attempts: u32,
	pub result: Result<ExportOutcome, ExportError>,
}

/// Send one batch, retrying transient failures per `retry`. Once `cancel`
/// is set no further attempt is made and the last failure is returned.
pub async fn deliver(
	sink: &dyn BulkSink,
	batch: Batch,
	retry: RetryPolicy,
	cancel: &Cancellation,
	log: &LogHandle,
	metrics: &MetricsRegistry,
) -> Delivery {
	let mut attempts = 0;
	loop {
		attempts += 1;
		metrics.bulk_requests_total.inc();
		let started = Instant::now();
		let result = sink.export(&batch).await;
		metrics
			.bulk_latency_ms
			.observe(started.elapsed().as_secs_f64() * 1000.0);

		match result {
			Err(e) if e.is_retryable() && attempts <= retry.max_retries && !cancel.is_cancelled() => {
				let wait = retry.delay(attempts);
				log.warn(format_args!(
					"bulk request of {} documents failed (attempt {attempts}/{}): {e}; retrying in {wait:?}",
					batch.len(),
					retry.max_retries + 1
				));
				cancel.sleep(wait).await;
				if cancel.is_cancelled() {
					return Delivery {
						size: batch.len(),
						attempts,
						result: Err(e),
					};
				}
			}
			result => {
				return Delivery {
					size: batch.len(),
					attempts,
					result,
				};
			}
		}
	}
}
