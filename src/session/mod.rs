//! One export run: connect, discover, then extract, batch and deliver every
//! source in turn while accounting into [`ExportStats`].
//!
//! ```text
//! Init -> Connecting -> Connected | ConnectFailed (terminal)
//!      -> Discovering -> { ExtractingFile -> Batching -> Exporting -> AccountingUpdate }*
//!      -> Reporting -> Done
//! ```
//!
//! A dry run skips `Connecting` and `Exporting`; extraction and batching
//! still run so the counts are what a real run would have sent.

pub mod delivery;
pub mod stats;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{Local, Utc};
use futures_util::{StreamExt, future, stream};
use regex::Regex;
use thiserror::Error;

use crate::config::{Settings, SettingsError};
use crate::export::{BulkSink, ConnectionError, ConnectionStatus, index_name};
use crate::ingest::document::{FIELD_SOURCE_TABLE, now_iso8601};
use crate::ingest::{self, Document, InputFormat, SourceContext, SourceDescriptor, SourceKind};
use crate::observability::{LogHandle, MetricsRegistry};
use crate::persist::{Batch, batch};

pub use delivery::{Cancellation, Delivery, RetryPolicy, Scheduler, deliver};
pub use stats::{ExportStats, SessionReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Init,
	Connecting,
	Connected,
	ConnectFailed,
	Discovering,
	ExtractingFile,
	Batching,
	Exporting,
	AccountingUpdate,
	Reporting,
	Done,
}

/// Conditions that end a session without a report.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("destination unavailable: {0}")]
	Connection(#[from] ConnectionError),

	#[error("no input sources found in {dirs}")]
	NothingDiscovered { dirs: String },
}

impl SessionError {
	pub fn exit_code(&self) -> u8 {
		match self {
			SessionError::Connection(_) => 1,
			SessionError::NothingDiscovered { .. } => 2,
		}
	}
}

/// Knobs of one session, derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
	pub source_dirs: Vec<PathBuf>,
	pub format: InputFormat,
	pub include: Option<Regex>,
	pub index_prefix: String,
	pub batch_size: usize,
	pub table_row_limit: Option<u64>,
	pub dry_run: bool,
	pub write_check: bool,
	pub allow_empty: bool,
	pub scheduler: Scheduler,
	pub retry: RetryPolicy,
	pub metrics_file: Option<PathBuf>,
}

impl SessionOptions {
	pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
		Ok(Self {
			source_dirs: settings.source_dirs.clone(),
			format: settings.format,
			include: settings.include_regex()?,
			index_prefix: settings.index_prefix.clone(),
			batch_size: settings.batch_size,
			table_row_limit: settings.table_row_limit,
			dry_run: settings.dry_run,
			write_check: settings.write_check,
			allow_empty: settings.allow_empty,
			scheduler: Scheduler::from_workers(settings.workers),
			retry: RetryPolicy::new(settings.max_retries, settings.retry_backoff_ms),
			metrics_file: settings.metrics_file.clone(),
		})
	}
}

impl Default for SessionOptions {
	fn default() -> Self {
		Self {
			source_dirs: vec![PathBuf::from(".")],
			format: InputFormat::Auto,
			include: None,
			index_prefix: "kismet".to_string(),
			batch_size: 500,
			table_row_limit: None,
			dry_run: false,
			write_check: false,
			allow_empty: false,
			scheduler: Scheduler::Sequential,
			retry: RetryPolicy::default(),
			metrics_file: None,
		}
	}
}

/// Per-file accounting, folded into [`ExportStats`] once the file is done.
#[derive(Debug, Default)]
struct FileTally {
	batches: u64,
	uploaded: u64,
	failed_documents: u64,
	errors: u64,
	abandoned: bool,
}

impl FileTally {
	fn apply(&mut self, delivery: Delivery, source: &str, log: &LogHandle, metrics: &MetricsRegistry) {
		self.batches += 1;
		match delivery.result {
			Ok(outcome) => {
				let failed = outcome.failed_items.len() as u64;
				self.uploaded += outcome.success_count as u64;
				self.failed_documents += failed;
				self.errors += failed;
				metrics.documents_indexed_total.inc_by(outcome.success_count as u64);
				metrics.document_failures_total.inc_by(failed);

				for item in outcome.failed_items.iter().take(3) {
					log.warn(format_args!(
						"{source}: document {} rejected with {}: {} {}",
						item.position,
						item.status,
						item.error_type.as_deref().unwrap_or("-"),
						item.reason.as_deref().unwrap_or("")
					));
				}
				if failed > 3 {
					log.warn(format_args!("{source}: {} more rejected documents", failed - 3));
				}

				let missing = delivery.size.saturating_sub(outcome.reported()) as u64;
				if missing > 0 {
					log.warn(format_args!(
						"{source}: bulk response omitted {missing} of {} documents",
						delivery.size
					));
					self.failed_documents += missing;
					self.errors += missing;
				}
			}
			Err(e) => {
				log.warn(format_args!(
					"{source}: batch of {} documents lost after {} attempt(s): {e}",
					delivery.size, delivery.attempts
				));
				metrics.batch_failures_total.inc();
				self.failed_documents += delivery.size as u64;
				self.errors += 1;
				self.abandoned = true;
			}
		}
	}
}

fn breakdown_key(kind: SourceKind, doc: &Document) -> String {
	match doc.get(FIELD_SOURCE_TABLE).and_then(|v| v.as_str()) {
		Some(table) if kind.is_database() => format!("{}_{table}", kind.data_type()),
		_ => kind.data_type().to_string(),
	}
}

/// Drives one run. Build with [`ExportSession::new`], attach a sink unless
/// running dry, then [`run`](ExportSession::run).
pub struct ExportSession {
	options: SessionOptions,
	ctx: SourceContext,
	sink: Option<Arc<dyn BulkSink>>,
	metrics: Arc<MetricsRegistry>,
	cancel: Cancellation,
	log: LogHandle,
	state: SessionState,
	history: Vec<SessionState>,
	stats: ExportStats,
}

impl ExportSession {
	pub fn new(options: SessionOptions, ctx: SourceContext, log: LogHandle) -> Self {
		Self {
			options,
			ctx,
			sink: None,
			metrics: Arc::new(MetricsRegistry::new()),
			cancel: Cancellation::new(),
			log: log.for_component("bifrost::session"),
			state: SessionState::Init,
			history: vec![SessionState::Init],
			stats: ExportStats::default(),
		}
	}

	pub fn with_sink(mut self, sink: Arc<dyn BulkSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = metrics;
		self
	}

	pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
		self.cancel = cancel;
		self
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	/// Every state entered so far, in order.
	pub fn history(&self) -> &[SessionState] {
		&self.history
	}

	pub fn stats(&self) -> &ExportStats {
		&self.stats
	}

	fn transition(&mut self, next: SessionState) {
		if self.state != next {
			self.log
				.debug(format_args!("session {:?} -> {:?}", self.state, next));
			self.state = next;
			self.history.push(next);
		}
	}

	pub async fn run(&mut self) -> Result<SessionReport, SessionError> {
		let started = Instant::now();
		let started_at = Utc::now();

		let (sink, connection) = if self.options.dry_run {
			self.log
				.info(format_args!("dry run: documents are extracted and batched but not sent"));
			(None, None)
		} else {
			self.transition(SessionState::Connecting);
			let sink = match self.sink.clone() {
				Some(sink) => sink,
				None => {
					self.transition(SessionState::ConnectFailed);
					return Err(ConnectionError::NoHosts.into());
				}
			};
			match self.connect(sink.as_ref()).await {
				Ok(status) => {
					self.transition(SessionState::Connected);
					(Some(sink), Some(status))
				}
				Err(e) => {
					self.log.error(format_args!("{e}"));
					self.transition(SessionState::ConnectFailed);
					return Err(e.into());
				}
			}
		};

		self.transition(SessionState::Discovering);
		let sources = ingest::discover(
			&self.options.source_dirs,
			self.options.format,
			self.options.include.as_ref(),
			&self.log.for_component("bifrost::discovery"),
		);
		let dirs = self
			.options
			.source_dirs
			.iter()
			.map(|d| d.display().to_string())
			.collect::<Vec<_>>()
			.join(", ");
		if sources.is_empty() {
			if !self.options.allow_empty {
				self.log.error(format_args!("no input sources found in {dirs}"));
				self.transition(SessionState::Done);
				return Err(SessionError::NothingDiscovered { dirs });
			}
			self.log.warn(format_args!("no input sources found in {dirs}"));
		} else {
			self.log
				.info(format_args!("{} source(s) found in {dirs}", sources.len()));
		}

		let mut cancelled = false;
		for source in &sources {
			if self.cancel.is_cancelled() {
				cancelled = true;
				break;
			}
			self.process_source(source, sink.as_deref()).await;
		}
		cancelled |= self.cancel.is_cancelled();
		if cancelled {
			self.log.warn(format_args!("cancelled; remaining sources skipped"));
		}

		self.transition(SessionState::Reporting);
		let report = SessionReport {
			started_at,
			elapsed: started.elapsed(),
			dry_run: self.options.dry_run,
			cancelled,
			connection,
			stats: self.stats.clone(),
		};
		for line in report.to_string().lines() {
			self.log.info(format_args!("{line}"));
		}
		if let Some(path) = &self.options.metrics_file {
			if let Err(e) = self.metrics.write_to(path) {
				self.log
					.warn(format_args!("cannot write metrics to {}: {e}", path.display()));
			}
		}
		self.log.flush();
		self.transition(SessionState::Done);
		Ok(report)
	}

	async fn connect(&self, sink: &dyn BulkSink) -> Result<ConnectionStatus, ConnectionError> {
		let status = sink.check_connection().await?;
		if self.options.write_check {
			let index = format!("{}-connection-test", self.options.index_prefix);
			let mut marker = Document::new();
			marker.insert("@timestamp", now_iso8601());
			marker.insert("message", "bifrost connection test");
			marker.insert("device_name", self.ctx.device_name.as_str());
			let ack = sink
				.index_document(&index, &marker)
				.await
				.map_err(|source| ConnectionError::WriteCheck {
					index: index.clone(),
					source,
				})?;
			self.log
				.info(format_args!("write check ok: {} {} in {}", ack.result, ack.id, ack.index));
		}
		Ok(status)
	}

	async fn process_source(&mut self, source: &SourceDescriptor, sink: Option<&dyn BulkSink>) {
		self.transition(SessionState::ExtractingFile);
		let name = source.path.display().to_string();
		self.log
			.info(format_args!("processing {name} ({})", source.kind.data_type()));
		self.stats.files_processed += 1;
		self.metrics.files_processed_total.inc();

		let mut extractor = match ingest::open_extractor(
			source,
			self.ctx.clone(),
			self.options.table_row_limit,
			self.log.for_component("bifrost::ingest"),
		) {
			Ok(extractor) => extractor,
			Err(e) => {
				self.log.warn(format_args!("{e}"));
				self.stats.errors += 1;
				self.stats.files_failed += 1;
				return;
			}
		};

		let index = index_name(
			&self.options.index_prefix,
			source.kind.data_type(),
			Local::now().date_naive(),
		);
		let kind = source.kind;
		let mut extracted = 0u64;
		let mut breakdown: BTreeMap<String, u64> = BTreeMap::new();

		self.transition(SessionState::Batching);
		let tally = {
			let documents = extractor.by_ref().inspect(|doc| {
				extracted += 1;
				*breakdown.entry(breakdown_key(kind, doc)).or_default() += 1;
			});
			let batches = batch(documents, &index, self.options.batch_size);
			match sink {
				Some(sink) => {
					self.transition(SessionState::Exporting);
					self.export_batches(sink, batches, &name).await
				}
				None => self.count_batches(batches),
			}
		};

		self.transition(SessionState::AccountingUpdate);
		let failures = extractor.take_failures();
		let failed_units = failures.len() as u64;
		for failure in &failures {
			self.log.warn(format_args!("{failure}"));
		}

		let stats = &mut self.stats;
		stats.documents_extracted += extracted;
		stats.documents_uploaded += tally.uploaded;
		stats.documents_failed += tally.failed_documents;
		stats.batches_sent += if sink.is_some() { tally.batches } else { 0 };
		stats.errors += tally.errors + failed_units;
		if tally.abandoned {
			stats.files_failed += 1;
		}
		stats.merge_breakdown(breakdown);

		self.log.info(format_args!(
			"{name}: {extracted} documents read, {} uploaded, {} failed{}",
			tally.uploaded,
			tally.failed_documents,
			if tally.abandoned { " (rest of file skipped)" } else { "" }
		));
	}

	/// Pull batches through the configured scheduler. Results come back to
	/// this single loop, which owns the tally. After a batch is lost for
	/// good no further batches of the file are started.
	async fn export_batches<I>(&self, sink: &dyn BulkSink, batches: I, source: &str) -> FileTally
	where
		I: Iterator<Item = Batch>,
	{
		let stop = self.cancel.clone();
		let cancel = &self.cancel;
		let abandon = AtomicBool::new(false);
		let retry = self.options.retry;
		let log = &self.log;
		let metrics = self.metrics.as_ref();
		let abandon_ref = &abandon;

		let mut deliveries = stream::iter(batches)
			.take_while(move |_| {
				future::ready(!stop.is_cancelled() && !abandon_ref.load(Ordering::SeqCst))
			})
			.map(|b| deliver(sink, b, retry, cancel, log, metrics))
			.buffer_unordered(self.options.scheduler.in_flight());

		let mut tally = FileTally::default();
		while let Some(delivery) = deliveries.next().await {
			tally.apply(delivery, source, log, metrics);
			if tally.abandoned {
				abandon.store(true, Ordering::SeqCst);
			}
		}
		tally
	}

	fn count_batches<I>(&self, batches: I) -> FileTally
	where
		I: Iterator<Item = Batch>,
	{
		let mut tally = FileTally::default();
		for b in batches {
			if self.cancel.is_cancelled() {
				break;
			}
			tally.batches += 1;
			self.log
				.debug(format_args!("dry run: batch {} of {} documents", tally.batches, b.len()));
		}
		tally
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::sync::Mutex;

	use async_trait::async_trait;

	use super::*;
	use crate::export::{ExportError, ExportOutcome, FailedItem, IndexedDocument};

	/// In-memory sink; rejects the second document of every batch when
	/// `reject_second` is set.
	#[derive(Default)]
	struct MemorySink {
		status: Option<u16>,
		reject_second: bool,
		fail_batches: bool,
		/// Set as soon as the first batch arrives.
		cancel_on_export: Option<Cancellation>,
		received: Mutex<Vec<usize>>,
	}

	#[async_trait]
	impl BulkSink for MemorySink {
		async fn check_connection(&self) -> Result<ConnectionStatus, ConnectionError> {
			match self.status {
				Some(401) => Err(ConnectionError::Unauthorized {
					host: "mem".into(),
				}),
				Some(403) => Ok(ConnectionStatus::WriteOnly),
				_ => Ok(ConnectionStatus::Connected { version: None }),
			}
		}

		async fn export(&self, batch: &Batch) -> Result<ExportOutcome, ExportError> {
			self.received.lock().unwrap().push(batch.len());
			if let Some(cancel) = &self.cancel_on_export {
				cancel.cancel();
			}
			if self.fail_batches {
				return Err(ExportError::Rejected {
					status: 400,
					reason: "bad".into(),
				});
			}
			let mut outcome = ExportOutcome::default();
			for (i, _) in batch.iter().enumerate() {
				if self.reject_second && i == 1 {
					outcome.failed_items.push(FailedItem {
						position: i,
						index: None,
						status: 400,
						error_type: Some("mapper_parsing_exception".into()),
						reason: None,
					});
				} else {
					outcome.success_count += 1;
				}
			}
			Ok(outcome)
		}

		async fn index_document(
			&self,
			index: &str,
			_doc: &Document,
		) -> Result<IndexedDocument, ExportError> {
			Ok(IndexedDocument {
				index: index.to_string(),
				id: "1".into(),
				result: "created".into(),
			})
		}
	}

	fn log_dir(lines: &[&str]) -> tempfile::TempDir {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.log"), lines.join("\n")).unwrap();
		dir
	}

	fn options(dir: &tempfile::TempDir) -> SessionOptions {
		SessionOptions {
			source_dirs: vec![dir.path().to_path_buf()],
			batch_size: 2,
			retry: RetryPolicy::new(0, 0),
			..SessionOptions::default()
		}
	}

	fn session(opts: SessionOptions, sink: Arc<MemorySink>) -> ExportSession {
		ExportSession::new(opts, SourceContext::new("sensor", "kismet"), LogHandle::discard())
			.with_sink(sink)
	}

	#[tokio::test]
	async fn uploads_and_counts() {
		let dir = log_dir(&["one", "", "{\"a\":1}", "three"]);
		let sink = Arc::new(MemorySink::default());
		let mut s = session(options(&dir), Arc::clone(&sink));
		let report = s.run().await.unwrap();

		assert_eq!(report.stats.files_processed, 1);
		assert_eq!(report.stats.documents_extracted, 3);
		assert_eq!(report.stats.documents_uploaded, 3);
		assert_eq!(report.stats.batches_sent, 2);
		assert_eq!(report.stats.errors, 0);
		assert_eq!(report.stats.by_type["log"], 3);
		assert_eq!(report.exit_code(), 0);
		assert_eq!(*sink.received.lock().unwrap(), vec![2, 1]);
		assert_eq!(s.state(), SessionState::Done);
	}

	#[tokio::test]
	async fn partial_success_counts_item_errors() {
		let dir = log_dir(&["a", "b", "c"]);
		let sink = Arc::new(MemorySink {
			reject_second: true,
			..MemorySink::default()
		});
		let report = session(options(&dir), sink).run().await.unwrap();
		assert_eq!(report.stats.documents_uploaded, 2);
		assert_eq!(report.stats.documents_failed, 1);
		assert_eq!(report.stats.errors, 1);
		assert_eq!(report.exit_code(), 1);
	}

	#[tokio::test]
	async fn lost_batch_abandons_rest_of_file() {
		let dir = log_dir(&["a", "b", "c", "d", "e"]);
		let sink = Arc::new(MemorySink {
			fail_batches: true,
			..MemorySink::default()
		});
		let report = session(options(&dir), Arc::clone(&sink)).run().await.unwrap();
		assert_eq!(sink.received.lock().unwrap().len(), 1);
		assert_eq!(report.stats.documents_failed, 2);
		assert_eq!(report.stats.errors, 1);
		assert_eq!(report.stats.files_failed, 1);
	}

	#[tokio::test]
	async fn write_only_credential_proceeds() {
		let dir = log_dir(&["a"]);
		let sink = Arc::new(MemorySink {
			status: Some(403),
			..MemorySink::default()
		});
		let mut s = session(options(&dir), sink);
		let report = s.run().await.unwrap();
		assert_eq!(report.connection, Some(ConnectionStatus::WriteOnly));
		assert!(s.history().contains(&SessionState::ExtractingFile));
	}

	#[tokio::test]
	async fn unauthorized_halts_before_discovery() {
		let dir = log_dir(&["a"]);
		let sink = Arc::new(MemorySink {
			status: Some(401),
			..MemorySink::default()
		});
		let mut s = session(options(&dir), Arc::clone(&sink));
		let err = s.run().await.unwrap_err();
		assert_eq!(err.exit_code(), 1);
		assert_eq!(s.state(), SessionState::ConnectFailed);
		assert!(!s.history().contains(&SessionState::Discovering));
		assert!(sink.received.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn dry_run_never_exports() {
		let dir = log_dir(&["a", "b", "c"]);
		let sink = Arc::new(MemorySink {
			status: Some(401),
			..MemorySink::default()
		});
		let mut opts = options(&dir);
		opts.dry_run = true;
		let mut s = session(opts, Arc::clone(&sink));
		let report = s.run().await.unwrap();
		assert_eq!(report.stats.documents_extracted, 3);
		assert_eq!(report.stats.batches_sent, 0);
		assert!(sink.received.lock().unwrap().is_empty());
		assert!(!s.history().contains(&SessionState::Exporting));
	}

	#[tokio::test]
	async fn empty_discovery() {
		let dir = tempfile::tempdir().unwrap();
		let sink = Arc::new(MemorySink::default());
		let mut opts = SessionOptions {
			source_dirs: vec![dir.path().to_path_buf()],
			..SessionOptions::default()
		};
		let err = session(opts.clone(), Arc::clone(&sink)).run().await.unwrap_err();
		assert_eq!(err.exit_code(), 2);

		opts.allow_empty = true;
		let report = session(opts, sink).run().await.unwrap();
		assert_eq!(report.exit_code(), 0);
	}

	#[tokio::test]
	async fn bad_file_does_not_abort_session() {
		let dir = log_dir(&["a", "b", "c"]);
		std::fs::write(
			dir.path().join("broken.kismet"),
			"this is not a database, only text that happens to be long enough",
		)
		.unwrap();
		let sink = Arc::new(MemorySink::default());
		let mut s = session(options(&dir), Arc::clone(&sink));
		let report = s.run().await.unwrap();

		assert_eq!(report.stats.files_processed, 2);
		assert_eq!(report.stats.files_failed, 1);
		assert_eq!(report.stats.errors, 1);
		assert_eq!(report.stats.documents_extracted, 3);
		assert_eq!(report.stats.documents_uploaded, 3);
		assert_eq!(report.exit_code(), 1);
		assert_eq!(sink.received.lock().unwrap().iter().sum::<usize>(), 3);
		assert_eq!(s.state(), SessionState::Done);
	}

	#[tokio::test]
	async fn cancelled_between_batches() {
		let dir = log_dir(&["a", "b", "c", "d", "e"]);
		let cancel = Cancellation::new();
		let sink = Arc::new(MemorySink {
			cancel_on_export: Some(cancel.clone()),
			..MemorySink::default()
		});
		let report = session(options(&dir), Arc::clone(&sink))
			.with_cancellation(cancel)
			.run()
			.await
			.unwrap();

		assert!(report.cancelled);
		assert_eq!(*sink.received.lock().unwrap(), vec![2]);
		assert_eq!(report.stats.documents_uploaded, 2);
		assert_eq!(report.stats.batches_sent, 1);
		assert_eq!(report.stats.files_processed, 1);
		assert_eq!(report.exit_code(), 1);
	}

	#[tokio::test]
	async fn cancelled_before_start_skips_sources() {
		let dir = log_dir(&["a"]);
		let cancel = Cancellation::new();
		cancel.cancel();
		let sink = Arc::new(MemorySink::default());
		let report = session(options(&dir), Arc::clone(&sink))
			.with_cancellation(cancel)
			.run()
			.await
			.unwrap();
		assert!(report.cancelled);
		assert_eq!(report.stats.files_processed, 0);
		assert_eq!(report.exit_code(), 1);
	}

	#[tokio::test]
	async fn concurrent_scheduler_delivers_everything() {
		let lines: Vec<String> = (0..25).map(|i| format!("line {i}")).collect();
		let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
		let dir = log_dir(&refs);
		let sink = Arc::new(MemorySink::default());
		let mut opts = options(&dir);
		opts.scheduler = Scheduler::Concurrent { workers: 4 };
		opts.batch_size = 3;
		let report = session(opts, Arc::clone(&sink)).run().await.unwrap();
		assert_eq!(report.stats.documents_uploaded, 25);
		assert_eq!(report.stats.batches_sent, 9);
		assert_eq!(sink.received.lock().unwrap().iter().sum::<usize>(), 25);
	}

	#[test]
	fn breakdown_keys() {
		let mut doc = Document::new();
		doc.insert(FIELD_SOURCE_TABLE, "devices");
		assert_eq!(breakdown_key(SourceKind::KismetDb, &doc), "kismetdb_devices");
		assert_eq!(breakdown_key(SourceKind::LineLog, &Document::new()), "log");
	}
}
