use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Value, json};
use url::Url;

use super::destination::{Credentials, Destination};
use super::{
	BulkSink, ConnectionError, ConnectionStatus, ExportError, ExportOutcome, FailedItem,
	IndexedDocument,
};
use crate::ingest::Document;
use crate::observability::LogHandle;
use crate::persist::Batch;
use crate::tls_utils;

const NDJSON: &str = "application/x-ndjson";
const REASON_LIMIT: usize = 300;

/// One configured HTTP client shared by every batch of a session.
///
/// Holds a single connection pool. After [`check_connection`] the first
/// host that answered becomes the active host for all later requests.
///
/// [`check_connection`]: BulkSink::check_connection
pub struct BulkClient {
	http: reqwest::Client,
	hosts: Vec<Url>,
	active: AtomicUsize,
	credentials: Credentials,
	connect_timeout: Duration,
	request_timeout: Duration,
	log: LogHandle,
}

impl BulkClient {
	pub fn new(destination: &Destination, log: LogHandle) -> Result<Self, ConnectionError> {
		if destination.hosts.is_empty() {
			return Err(ConnectionError::NoHosts);
		}
		let hosts = destination
			.hosts
			.iter()
			.map(|h| {
				Url::parse(h).map_err(|e| ConnectionError::InvalidUrl {
					url: h.clone(),
					reason: e.to_string(),
				})
			})
			.collect::<Result<Vec<_>, _>>()?;

		let mut builder = reqwest::Client::builder()
			.user_agent(concat!("bifrost/", env!("CARGO_PKG_VERSION")))
			.connect_timeout(destination.connect_timeout())
			.danger_accept_invalid_certs(!destination.verify_certs);

		if let Some(path) = &destination.ca_cert {
			let certs = tls_utils::load_ca_certificates(path)
				.map_err(|e| ConnectionError::Client(format!("{e:#}")))?;
			for cert in certs {
				builder = builder.add_root_certificate(cert);
			}
		}

		let http = builder
			.build()
			.map_err(|e| ConnectionError::Client(e.to_string()))?;

		if !destination.verify_certs {
			log.debug(format_args!("TLS certificate verification disabled"));
		}

		Ok(Self {
			http,
			hosts,
			active: AtomicUsize::new(0),
			credentials: destination.credentials.clone(),
			connect_timeout: destination.connect_timeout(),
			request_timeout: destination.request_timeout(),
			log,
		})
	}

	/// The host requests currently go to.
	pub fn active_host(&self) -> &Url {
		let i = self.active.load(Ordering::Relaxed);
		&self.hosts[i.min(self.hosts.len() - 1)]
	}

	fn endpoint(&self, path: &str) -> String {
		format!(
			"{}/{}",
			self.active_host().as_str().trim_end_matches('/'),
			path.trim_start_matches('/')
		)
	}

	fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
		match &self.credentials {
			Credentials::None => req,
			Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
		}
	}

	async fn check_host(&self, host: &Url) -> Result<ConnectionStatus, ConnectionError> {
		let name = host.as_str().trim_end_matches('/').to_owned();
		let resp = self
			.authorize(self.http.get(host.clone()))
			.timeout(self.connect_timeout)
			.send()
			.await
			.map_err(|e| ConnectionError::Unreachable {
				host: name.clone(),
				reason: transport_reason(&e),
			})?;

		match resp.status() {
			s if s.is_success() => {
				let version = resp.json::<Value>().await.ok().and_then(|v| {
					v.pointer("/version/number")
						.and_then(Value::as_str)
						.map(str::to_owned)
				});
				Ok(ConnectionStatus::Connected { version })
			}
			StatusCode::FORBIDDEN => Ok(ConnectionStatus::WriteOnly),
			StatusCode::UNAUTHORIZED => Err(ConnectionError::Unauthorized { host: name }),
			other => Err(ConnectionError::UnexpectedStatus {
				host: name,
				status: other.as_u16(),
			}),
		}
	}
}

#[async_trait]
impl BulkSink for BulkClient {
	async fn check_connection(&self) -> Result<ConnectionStatus, ConnectionError> {
		let mut last_err = ConnectionError::NoHosts;
		for (i, host) in self.hosts.iter().enumerate() {
			match self.check_host(host).await {
				Ok(status) => {
					self.active.store(i, Ordering::Relaxed);
					match &status {
						ConnectionStatus::Connected { version } => self.log.info(format_args!(
							"connected to {host} (version {})",
							version.as_deref().unwrap_or("unknown")
						)),
						ConnectionStatus::WriteOnly => self.log.info(format_args!(
							"connected to {host} with a write-only credential"
						)),
					}
					return Ok(status);
				}
				Err(e) => {
					self.log.warn(format_args!("{e}"));
					last_err = e;
				}
			}
		}
		Err(last_err)
	}

	async fn export(&self, batch: &Batch) -> Result<ExportOutcome, ExportError> {
		if batch.is_empty() {
			return Ok(ExportOutcome::default());
		}
		let body = encode_bulk_body(batch)?;

		let resp = self
			.authorize(self.http.post(self.endpoint("_bulk")))
			.header(CONTENT_TYPE, NDJSON)
			.timeout(self.request_timeout)
			.body(body)
			.send()
			.await
			.map_err(classify)?;

		let status = resp.status();
		let bytes = resp.bytes().await.map_err(classify)?;
		if !status.is_success() {
			return Err(ExportError::Rejected {
				status: status.as_u16(),
				reason: error_reason(&bytes),
			});
		}
		parse_bulk_response(&bytes)
	}

	async fn index_document(
		&self,
		index: &str,
		doc: &Document,
	) -> Result<IndexedDocument, ExportError> {
		let resp = self
			.authorize(self.http.post(self.endpoint(&format!("{index}/_doc"))))
			.timeout(self.request_timeout)
			.json(doc)
			.send()
			.await
			.map_err(classify)?;

		let status = resp.status();
		let bytes = resp.bytes().await.map_err(classify)?;
		if !status.is_success() {
			return Err(ExportError::Rejected {
				status: status.as_u16(),
				reason: error_reason(&bytes),
			});
		}
		serde_json::from_slice(&bytes).map_err(|e| ExportError::MalformedResponse(e.to_string()))
	}
}

/// Serialize a batch as alternating action and source lines, each line
/// newline-terminated.
pub fn encode_bulk_body(batch: &Batch) -> Result<String, serde_json::Error> {
	let mut body = String::new();
	for (index, doc) in batch.iter() {
		body.push_str(&serde_json::to_string(&json!({ "index": { "_index": index } }))?);
		body.push('\n');
		body.push_str(&serde_json::to_string(doc)?);
		body.push('\n');
	}
	Ok(body)
}

/// Reconcile the `items` array of a bulk response. An item counts as
/// indexed only with status 200 or 201.
pub fn parse_bulk_response(body: &[u8]) -> Result<ExportOutcome, ExportError> {
	let value: Value =
		serde_json::from_slice(body).map_err(|e| ExportError::MalformedResponse(e.to_string()))?;
	let items = value
		.get("items")
		.and_then(Value::as_array)
		.ok_or_else(|| ExportError::MalformedResponse("missing items array".into()))?;

	let mut outcome = ExportOutcome::default();
	for (position, item) in items.iter().enumerate() {
		// {"index": {...}}, {"create": {...}}: the action name is irrelevant
		let result = item.as_object().and_then(|o| o.values().next());
		let status = result
			.and_then(|r| r.get("status"))
			.and_then(Value::as_u64)
			.unwrap_or(0);

		if matches!(status, 200 | 201) {
			outcome.success_count += 1;
			continue;
		}

		let error = result.and_then(|r| r.get("error"));
		let (error_type, reason) = match error {
			Some(Value::Object(e)) => (
				e.get("type").and_then(Value::as_str).map(str::to_owned),
				e.get("reason").and_then(Value::as_str).map(str::to_owned),
			),
			Some(Value::String(s)) => (None, Some(s.clone())),
			_ => (None, None),
		};
		outcome.failed_items.push(FailedItem {
			position,
			index: result
				.and_then(|r| r.get("_index"))
				.and_then(Value::as_str)
				.map(str::to_owned),
			status: u16::try_from(status).unwrap_or(0),
			error_type,
			reason,
		});
	}
	Ok(outcome)
}

fn classify(e: reqwest::Error) -> ExportError {
	if e.is_timeout() {
		ExportError::Timeout
	} else {
		ExportError::Transport(transport_reason(&e))
	}
}

/// reqwest hides the interesting part (refused, DNS, TLS) in the source
/// chain.
fn transport_reason(e: &reqwest::Error) -> String {
	let mut reason = e.to_string();
	let mut source = e.source();
	while let Some(inner) = source {
		reason.push_str(": ");
		reason.push_str(&inner.to_string());
		source = inner.source();
	}
	reason
}

/// Best description of a top-level rejection body.
fn error_reason(body: &[u8]) -> String {
	if let Ok(v) = serde_json::from_slice::<Value>(body) {
		let found = v
			.pointer("/error/reason")
			.or_else(|| v.pointer("/error/type"))
			.or_else(|| v.get("error"))
			.or_else(|| v.get("message"));
		match found {
			Some(Value::String(s)) => return s.clone(),
			Some(other) => return other.to_string(),
			None => {}
		}
	}
	String::from_utf8_lossy(body).chars().take(REASON_LIMIT).collect()
}
