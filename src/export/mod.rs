//! Delivery of document batches to the search datastore.
//!
//! [`BulkSink`] is the seam the session drives. [`BulkClient`] implements it
//! over HTTP; tests substitute their own sinks.

pub mod bulk_client;
pub mod destination;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

use crate::ingest::Document;
use crate::persist::Batch;

pub use bulk_client::{BulkClient, encode_bulk_body, parse_bulk_response};
pub use destination::{Credentials, Destination};

/// One document the destination refused inside an otherwise accepted bulk
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
	/// Position of the document inside its batch.
	pub position: usize,
	pub index: Option<String>,
	pub status: u16,
	pub error_type: Option<String>,
	pub reason: Option<String>,
}

/// Item-level accounting of one bulk request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOutcome {
	pub success_count: usize,
	pub failed_items: Vec<FailedItem>,
}

impl ExportOutcome {
	/// Items the destination reported on.
	pub fn reported(&self) -> usize {
		self.success_count + self.failed_items.len()
	}
}

/// How the destination answered the reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
	/// Full access; cluster version when the root endpoint disclosed it.
	Connected { version: Option<String> },
	/// 403 on the root endpoint: the credential may write but not read
	/// cluster info.
	WriteOnly,
}

/// Acknowledgement of a single-document write.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedDocument {
	#[serde(rename = "_index")]
	pub index: String,
	#[serde(rename = "_id")]
	pub id: String,
	pub result: String,
}

/// Destination unusable for the whole session.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no destination hosts configured")]
	NoHosts,

	#[error("invalid destination URL {url}: {reason}")]
	InvalidUrl { url: String, reason: String },

	#[error("cannot build HTTP client: {0}")]
	Client(String),

	#[error("cannot reach {host}: {reason}")]
	Unreachable { host: String, reason: String },

	#[error("{host} rejected the credentials (HTTP 401)")]
	Unauthorized { host: String },

	#[error("{host} answered HTTP {status}")]
	UnexpectedStatus { host: String, status: u16 },

	#[error("write check against {index} failed: {source}")]
	WriteCheck {
		index: String,
		#[source]
		source: ExportError,
	},
}

/// A whole batch (or single write) that did not go through.
#[derive(Debug, Error)]
pub enum ExportError {
	#[error("transport failure: {0}")]
	Transport(String),

	#[error("request timed out")]
	Timeout,

	#[error("destination rejected the request with HTTP {status}: {reason}")]
	Rejected { status: u16, reason: String },

	#[error("malformed response: {0}")]
	MalformedResponse(String),

	#[error("cannot serialize document: {0}")]
	Serialize(#[from] serde_json::Error),
}

impl ExportError {
	/// Transport trouble, throttling and server-side errors may clear up on
	/// their own; everything else will fail the same way again.
	pub fn is_retryable(&self) -> bool {
		match self {
			ExportError::Transport(_) | ExportError::Timeout => true,
			ExportError::Rejected { status, .. } => *status == 429 || (500..600).contains(status),
			ExportError::MalformedResponse(_) | ExportError::Serialize(_) => false,
		}
	}
}

/// Bulk-capable destination.
#[async_trait]
pub trait BulkSink: Send + Sync {
	/// Check reachability and credentials.
	async fn check_connection(&self) -> Result<ConnectionStatus, ConnectionError>;

	/// Send one batch. No retries happen here.
	async fn export(&self, batch: &Batch) -> Result<ExportOutcome, ExportError>;

	/// Write a single document.
	async fn index_document(
		&self,
		index: &str,
		doc: &Document,
	) -> Result<IndexedDocument, ExportError>;
}

/// `<prefix>-<data_type>-<YYYY.MM.DD>`
pub fn index_name(prefix: &str, data_type: &str, date: NaiveDate) -> String {
	format!("{prefix}-{data_type}-{}", date.format("%Y.%m.%d"))
}
