use std::path::{Path, PathBuf};

use log::Level;
use regex::Regex;
use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use url::Url;

use crate::export::{Credentials, Destination};
use crate::ingest::{InputFormat, SourceContext};

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): `/etc/vanopticon/bifrost.json`, the
/// same file under the user config folders (all optional), an explicit
/// `--config` file, and environment variables prefixed with `BFR_`
/// (e.g. `BFR_BATCH_SIZE`, `BFR_MONITOR__POLL_INTERVAL_SECS`,
/// `BFR_HOSTS=https://a:9200,https://b:9200`). Command-line flags are
/// applied on top by the binary.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	pub hosts: Vec<String>,
	pub username: String,
	pub password: String,
	pub index_prefix: String,
	pub device_name: String,
	pub app_name: String,
	pub format: InputFormat,
	pub batch_size: usize,
	/// Row cap per table; none reads whole tables.
	pub table_row_limit: Option<u64>,
	pub dry_run: bool,
	pub workers: usize,
	pub source_dirs: Vec<PathBuf>,
	/// Regex matched against file names during discovery.
	pub include_pattern: Option<String>,
	pub connect_timeout_secs: u64,
	pub request_timeout_secs: u64,
	pub max_retries: u32,
	pub retry_backoff_ms: u64,
	pub verify_certs: bool,
	pub ca_cert: Option<PathBuf>,
	/// Index a test document before extraction starts.
	pub write_check: bool,
	/// Treat "nothing discovered" as success.
	pub allow_empty: bool,
	#[serde(deserialize_with = "level_from_str")]
	pub log_level: Level,
	pub log_file: Option<PathBuf>,
	pub metrics_file: Option<PathBuf>,
	pub monitor: MonitorSettings,
}

/// Settings of the poll-and-append device logger.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct MonitorSettings {
	pub kismet_url: String,
	pub kismet_username: String,
	pub kismet_password: String,
	pub poll_interval_secs: u64,
	/// Only devices of this PHY are logged.
	pub phy_filter: String,
	pub output_dir: PathBuf,
}

impl Default for MonitorSettings {
	fn default() -> Self {
		Self {
			kismet_url: "http://localhost:2501".to_string(),
			kismet_username: String::new(),
			kismet_password: String::new(),
			poll_interval_secs: 30,
			phy_filter: "Bluetooth".to_string(),
			output_dir: PathBuf::from("/opt/kismet/logs"),
		}
	}
}

impl Default for Settings {
	fn default() -> Self {
		let device_name = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.filter(|s| !s.is_empty())
			.unwrap_or_else(|| "unknown-device".to_string());

		Self {
			hosts: vec!["https://localhost:9200".to_string()],
			username: String::new(),
			password: String::new(),
			index_prefix: "kismet".to_string(),
			device_name,
			app_name: "kismet".to_string(),
			format: InputFormat::Auto,
			batch_size: 500,
			table_row_limit: None,
			dry_run: false,
			workers: 1,
			source_dirs: vec![PathBuf::from(".")],
			include_pattern: None,
			connect_timeout_secs: 10,
			request_timeout_secs: 60,
			max_retries: 3,
			retry_backoff_ms: 500,
			verify_certs: false,
			ca_cert: None,
			write_check: false,
			allow_empty: false,
			log_level: Level::Info,
			log_file: None,
			metrics_file: None,
			monitor: MonitorSettings::default(),
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),

	#[error("invalid setting `{key}`: {reason}")]
	Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> SettingsError {
	SettingsError::Invalid {
		key,
		reason: reason.into(),
	}
}

impl Settings {
	/// Reject settings no run could succeed with. Called once before any
	/// work starts.
	pub fn validate(&self) -> Result<(), SettingsError> {
		if self.hosts.is_empty() && !self.dry_run {
			return Err(invalid("hosts", "at least one destination host is required"));
		}
		for host in &self.hosts {
			let url = Url::parse(host).map_err(|e| invalid("hosts", format!("{host}: {e}")))?;
			if !matches!(url.scheme(), "http" | "https") {
				return Err(invalid("hosts", format!("{host}: scheme must be http or https")));
			}
		}
		if self.batch_size == 0 {
			return Err(invalid("batch_size", "must be at least 1"));
		}
		if self.workers == 0 {
			return Err(invalid("workers", "must be at least 1"));
		}
		if self.device_name.trim().is_empty() {
			return Err(invalid("device_name", "must not be empty"));
		}
		if self.app_name.trim().is_empty() {
			return Err(invalid("app_name", "must not be empty"));
		}
		validate_index_prefix(&self.index_prefix)?;
		self.include_regex()?;
		if self.monitor.poll_interval_secs == 0 {
			return Err(invalid("monitor.poll_interval_secs", "must be at least 1"));
		}
		Ok(())
	}

	pub fn include_regex(&self) -> Result<Option<Regex>, SettingsError> {
		self.include_pattern
			.as_deref()
			.map(|p| Regex::new(p).map_err(|e| invalid("include_pattern", e.to_string())))
			.transpose()
	}

	pub fn destination(&self) -> Destination {
		Destination {
			hosts: self.hosts.clone(),
			credentials: Credentials::from_parts(&self.username, &self.password),
			connect_timeout_secs: self.connect_timeout_secs,
			request_timeout_secs: self.request_timeout_secs,
			verify_certs: self.verify_certs,
			ca_cert: self.ca_cert.clone(),
		}
	}

	pub fn source_context(&self) -> SourceContext {
		SourceContext::new(self.device_name.clone(), self.app_name.clone())
	}
}

/// `log::Level`'s own serde impl wants the exact variant name; accept any
/// case the way `Level::from_str` does.
fn level_from_str<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
	let s = String::deserialize(d)?;
	s.parse()
		.map_err(|_| de::Error::custom(format!("unknown log level {s:?}")))
}

/// Index names must be lowercase and free of the characters the datastore
/// reserves.
fn validate_index_prefix(prefix: &str) -> Result<(), SettingsError> {
	if prefix.is_empty() {
		return Err(invalid("index_prefix", "must not be empty"));
	}
	if prefix.starts_with(['-', '_', '+']) {
		return Err(invalid("index_prefix", "must not start with '-', '_' or '+'"));
	}
	if let Some(c) = prefix
		.chars()
		.find(|c| c.is_uppercase() || c.is_whitespace() || "\\/*?\"<>|,#:".contains(*c))
	{
		return Err(invalid("index_prefix", format!("character {c:?} is not allowed")));
	}
	Ok(())
}

pub fn load() -> Result<Settings, SettingsError> {
	load_with(None)
}

/// Like [`load`], with `extra` (when given) layered over the standard
/// files. Unlike those, `extra` must exist.
pub fn load_with(extra: Option<&Path>) -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/bifrost.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}
	if let Some(path) = extra {
		builder = builder.add_source(config::File::from(path).required(true));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("BFR")
			.prefix_separator("_")
			.separator("__")
			.try_parsing(true)
			.list_separator(",")
			.with_list_parse_key("hosts")
			.with_list_parse_key("source_dirs"),
	);

	let cfg = builder.build()?;
	Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::env;
	use std::sync::Mutex;

	use log::Level;

	use super::*;

	/// Serializes tests that set `BFR_*` or read keys those tests set.
	static ENV_LOCK: Mutex<()> = Mutex::new(());

	const VARS: [&str; 6] = [
		"BFR_HOSTS",
		"BFR_BATCH_SIZE",
		"BFR_DRY_RUN",
		"BFR_LOG_LEVEL",
		"BFR_FORMAT",
		"BFR_MONITOR__POLL_INTERVAL_SECS",
	];

	#[test]
	fn test_load_defaults_and_env_overlay() {
		let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let originals: Vec<_> = VARS.iter().map(|v| env::var_os(v)).collect();
		for v in VARS {
			unsafe { env::remove_var(v) };
		}

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.hosts, d.hosts);
		assert_eq!(s.batch_size, d.batch_size);
		assert_eq!(s.log_level, d.log_level);

		unsafe { env::set_var("BFR_HOSTS", "https://es1:9200,https://es2:9200") };
		unsafe { env::set_var("BFR_BATCH_SIZE", "250") };
		unsafe { env::set_var("BFR_DRY_RUN", "true") };
		unsafe { env::set_var("BFR_LOG_LEVEL", "debug") };
		unsafe { env::set_var("BFR_FORMAT", "csv") };
		unsafe { env::set_var("BFR_MONITOR__POLL_INTERVAL_SECS", "5") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.hosts, vec!["https://es1:9200", "https://es2:9200"]);
		assert_eq!(s2.batch_size, 250);
		assert!(s2.dry_run);
		assert_eq!(s2.log_level, Level::Debug);
		assert_eq!(s2.format, InputFormat::Csv);
		assert_eq!(s2.monitor.poll_interval_secs, 5);

		for (v, orig) in VARS.iter().zip(originals) {
			match orig {
				Some(val) => unsafe { env::set_var(v, val) },
				None => unsafe { env::remove_var(v) },
			}
		}
	}

	#[test]
	fn explicit_file_layer() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("bifrost.json");
		std::fs::write(
			&path,
			r#"{"index_prefix":"sensors","workers":4,"monitor":{"phy_filter":"IEEE802.11"}}"#,
		)
		.unwrap();
		let s = load_with(Some(&path)).unwrap();
		assert_eq!(s.index_prefix, "sensors");
		assert_eq!(s.workers, 4);
		assert_eq!(s.monitor.phy_filter, "IEEE802.11");
		assert_eq!(s.monitor.output_dir, PathBuf::from("/opt/kismet/logs"));
	}

	#[test]
	fn log_level_ignores_case() {
		let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("bifrost.json");
		for (text, want) in [
			("debug", Level::Debug),
			("Warn", Level::Warn),
			("ERROR", Level::Error),
			("trace", Level::Trace),
		] {
			std::fs::write(&path, format!(r#"{{"log_level":"{text}"}}"#)).unwrap();
			assert_eq!(load_with(Some(&path)).unwrap().log_level, want, "{text}");
		}
		std::fs::write(&path, r#"{"log_level":"loud"}"#).unwrap();
		assert!(matches!(load_with(Some(&path)), Err(SettingsError::Config(_))));
	}

	#[test]
	fn missing_explicit_file_is_an_error() {
		assert!(load_with(Some(Path::new("/no/such/bifrost.json"))).is_err());
	}

	#[test]
	fn defaults_validate() {
		Settings::default().validate().unwrap();
		assert!(!Settings::default().device_name.is_empty());
	}

	#[test]
	fn validation_failures() {
		let bad = |f: fn(&mut Settings)| {
			let mut s = Settings::default();
			f(&mut s);
			s.validate().unwrap_err()
		};
		assert!(matches!(bad(|s| s.batch_size = 0), SettingsError::Invalid { key: "batch_size", .. }));
		assert!(matches!(bad(|s| s.workers = 0), SettingsError::Invalid { key: "workers", .. }));
		assert!(matches!(bad(|s| s.hosts.clear()), SettingsError::Invalid { key: "hosts", .. }));
		assert!(matches!(
			bad(|s| s.hosts = vec!["ftp://x".into()]),
			SettingsError::Invalid { key: "hosts", .. }
		));
		assert!(matches!(
			bad(|s| s.index_prefix = "Kismet".into()),
			SettingsError::Invalid { key: "index_prefix", .. }
		));
		assert!(matches!(
			bad(|s| s.include_pattern = Some("(".into())),
			SettingsError::Invalid { key: "include_pattern", .. }
		));
		assert!(matches!(
			bad(|s| s.device_name = " ".into()),
			SettingsError::Invalid { key: "device_name", .. }
		));
	}

	#[test]
	fn dry_run_needs_no_hosts() {
		let mut s = Settings::default();
		s.hosts.clear();
		s.dry_run = true;
		s.validate().unwrap();
	}

	#[test]
	fn destination_credentials() {
		let mut s = Settings::default();
		assert_eq!(s.destination().credentials, Credentials::None);
		s.username = "elastic".into();
		s.password = "pw".into();
		assert!(matches!(s.destination().credentials, Credentials::Basic { .. }));
	}
}
