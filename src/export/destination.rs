use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How requests to the destination authenticate.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
	#[default]
	None,
	/// HTTP Basic
	Basic { username: String, password: String },
}

impl Credentials {
	/// An empty username means no authentication.
	pub fn from_parts(username: &str, password: &str) -> Self {
		if username.is_empty() {
			Self::None
		} else {
			Self::Basic {
				username: username.to_owned(),
				password: password.to_owned(),
			}
		}
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::None => f.write_str("None"),
			Self::Basic { username, .. } => f
				.debug_struct("Basic")
				.field("username", username)
				.field("password", &"<redacted>")
				.finish(),
		}
	}
}

/// Where and how to deliver documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
	/// Tried in order; the first that answers the reachability check is used.
	pub hosts: Vec<String>,

	#[serde(default)]
	pub credentials: Credentials,

	#[serde(default = "default_connect_timeout_secs")]
	pub connect_timeout_secs: u64,

	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,

	/// Off by default: sensors commonly front the datastore with
	/// self-signed certificates.
	#[serde(default)]
	pub verify_certs: bool,

	/// Extra PEM or DER root certificate to trust.
	#[serde(default)]
	pub ca_cert: Option<PathBuf>,
}

impl Default for Destination {
	fn default() -> Self {
		Self {
			hosts: vec!["https://localhost:9200".to_string()],
			credentials: Credentials::None,
			connect_timeout_secs: default_connect_timeout_secs(),
			request_timeout_secs: default_request_timeout_secs(),
			verify_certs: false,
			ca_cert: None,
		}
	}
}

impl Destination {
	/// Timeout for the reachability check.
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.connect_timeout_secs)
	}

	/// Timeout for bulk and single-document writes.
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

fn default_connect_timeout_secs() -> u64 {
	10
}

fn default_request_timeout_secs() -> u64 {
	60
}
