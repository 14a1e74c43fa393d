use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::export::ConnectionStatus;

/// Running counters of one session. Only the session loop mutates them;
/// concurrent deliveries report back to it instead of touching these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
	pub files_processed: u64,
	pub files_failed: u64,
	pub documents_extracted: u64,
	pub documents_uploaded: u64,
	pub documents_failed: u64,
	pub batches_sent: u64,
	pub errors: u64,
	/// Extracted documents per `<data_type>` or `<data_type>_<table>`.
	pub by_type: BTreeMap<String, u64>,
}

impl ExportStats {
	pub fn merge_breakdown(&mut self, breakdown: BTreeMap<String, u64>) {
		for (key, n) in breakdown {
			*self.by_type.entry(key).or_default() += n;
		}
	}
}

/// Read-only summary produced when the session reaches `Reporting`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
	pub started_at: DateTime<Utc>,
	pub elapsed: Duration,
	pub dry_run: bool,
	pub cancelled: bool,
	#[serde(skip)]
	pub connection: Option<ConnectionStatus>,
	pub stats: ExportStats,
}

impl SessionReport {
	/// 0 only when every source went through cleanly.
	pub fn exit_code(&self) -> u8 {
		if self.stats.errors > 0 || self.cancelled {
			1
		} else {
			0
		}
	}
}

impl fmt::Display for SessionReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = &self.stats;
		let uploaded = if self.dry_run {
			"documents (dry run, not sent)"
		} else {
			"documents uploaded"
		};
		writeln!(f, "files processed:  {} ({} failed)", s.files_processed, s.files_failed)?;
		writeln!(f, "documents read:   {}", s.documents_extracted)?;
		writeln!(
			f,
			"{uploaded}: {}",
			if self.dry_run {
				s.documents_extracted
			} else {
				s.documents_uploaded
			}
		)?;
		writeln!(f, "documents failed: {}", s.documents_failed)?;
		writeln!(f, "errors:           {}", s.errors)?;
		write!(f, "elapsed:          {:.2}s", self.elapsed.as_secs_f64())?;
		for (key, n) in &s.by_type {
			write!(f, "\n  {key}: {n}")?;
		}
		if self.cancelled {
			write!(f, "\n(cancelled before completion)")?;
		}
		Ok(())
	}
}
