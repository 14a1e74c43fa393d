//! Poll-and-append device logger.
//!
//! Every cycle fetches the scanner's device view, keeps the devices of one
//! PHY, and appends them as device records to a session file that stays
//! open for the whole run.

pub mod device;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::MonitorSettings;
use crate::observability::LogHandle;
use crate::persist::NdjsonWriter;
use crate::session::Cancellation;

pub use device::{DeviceRecord, normalize_numeric_arrays};

const DEVICES_VIEW: &str = "/devices/views/all/devices.json";
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Problems that stop the monitor before or between cycles.
#[derive(Debug, Error)]
pub enum MonitorError {
	#[error("invalid scanner URL {url}: {reason}")]
	InvalidUrl { url: String, reason: String },

	#[error("cannot build HTTP client: {0}")]
	Client(String),

	#[error("cannot write {path}: {source}")]
	Output {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// A single failed poll. Logged; the loop carries on.
#[derive(Debug, Error)]
pub enum PollError {
	#[error("scanner request failed: {0}")]
	Transport(String),

	#[error("scanner answered HTTP {0}")]
	Status(u16),

	#[error("unexpected device list: {0}")]
	Decode(String),
}

/// Client of the scanner's REST device view.
pub struct KismetPoller {
	http: reqwest::Client,
	devices_url: Url,
	username: String,
	password: String,
}

impl KismetPoller {
	pub fn new(settings: &MonitorSettings) -> Result<Self, MonitorError> {
		let invalid = |reason: String| MonitorError::InvalidUrl {
			url: settings.kismet_url.clone(),
			reason,
		};
		let base = Url::parse(&settings.kismet_url).map_err(|e| invalid(e.to_string()))?;
		let devices_url = base.join(DEVICES_VIEW).map_err(|e| invalid(e.to_string()))?;
		let http = reqwest::Client::builder()
			.timeout(POLL_TIMEOUT)
			.build()
			.map_err(|e| MonitorError::Client(e.to_string()))?;

		Ok(Self {
			http,
			devices_url,
			username: settings.kismet_username.clone(),
			password: settings.kismet_password.clone(),
		})
	}

	/// Fetch every device the scanner currently tracks.
	pub async fn fetch_devices(&self) -> Result<Vec<Value>, PollError> {
		let mut req = self.http.get(self.devices_url.clone());
		if !self.username.is_empty() {
			req = req.basic_auth(&self.username, Some(&self.password));
		}
		let resp = req
			.send()
			.await
			.map_err(|e| PollError::Transport(e.to_string()))?;
		let status = resp.status();
		if !status.is_success() {
			return Err(PollError::Status(status.as_u16()));
		}
		let body = resp
			.bytes()
			.await
			.map_err(|e| PollError::Transport(e.to_string()))?;
		serde_json::from_slice(&body).map_err(|e| PollError::Decode(e.to_string()))
	}

	/// Records for the devices of `phy`.
	pub async fn poll(&self, phy: &str) -> Result<Vec<DeviceRecord>, PollError> {
		Ok(self
			.fetch_devices()
			.await?
			.iter()
			.filter_map(Value::as_object)
			.filter(|d| d.get(device::PHYNAME).and_then(Value::as_str) == Some(phy))
			.map(DeviceRecord::from_device)
			.collect())
	}
}

/// `<output_dir>/Kismet-<YYYY.MM.DD-HHMMSS>-1/<phy>.devices.json`
pub fn session_file(output_dir: &Path, started: NaiveDateTime, phy: &str) -> PathBuf {
	let phy = phy.to_lowercase().replace(char::is_whitespace, "_");
	output_dir
		.join(format!("Kismet-{}-1", started.format("%Y.%m.%d-%H%M%S")))
		.join(format!("{phy}.devices.json"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
	pub cycles: u64,
	pub failed_polls: u64,
	pub records_written: u64,
	pub output: PathBuf,
}

pub struct Monitor {
	poller: KismetPoller,
	phy: String,
	interval: Duration,
	output: PathBuf,
	max_cycles: Option<u64>,
	log: LogHandle,
}

impl Monitor {
	pub fn new(settings: &MonitorSettings, log: LogHandle) -> Result<Self, MonitorError> {
		Ok(Self {
			poller: KismetPoller::new(settings)?,
			phy: settings.phy_filter.clone(),
			interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
			output: session_file(
				&settings.output_dir,
				Local::now().naive_local(),
				&settings.phy_filter,
			),
			max_cycles: None,
			log: log.for_component("bifrost::monitor"),
		})
	}

	/// Stop after `n` cycles instead of running until cancelled.
	pub fn with_max_cycles(mut self, n: u64) -> Self {
		self.max_cycles = Some(n);
		self
	}

	pub fn output(&self) -> &Path {
		&self.output
	}

	pub async fn run(&self, cancel: &Cancellation) -> Result<MonitorReport, MonitorError> {
		let out_err = |source| MonitorError::Output {
			path: self.output.clone(),
			source,
		};
		let mut writer = NdjsonWriter::append(&self.output).map_err(out_err)?;
		self.log.info(format_args!(
			"logging {} devices from {} every {}s to {}",
			self.phy,
			self.poller.devices_url,
			self.interval.as_secs(),
			self.output.display()
		));

		let mut report = MonitorReport {
			output: self.output.clone(),
			..MonitorReport::default()
		};
		while !cancel.is_cancelled() {
			report.cycles += 1;
			match self.poller.poll(&self.phy).await {
				Ok(records) if records.is_empty() => {
					self.log.debug(format_args!("no {} devices", self.phy));
				}
				Ok(records) => {
					for record in &records {
						writer.write(record).map_err(out_err)?;
					}
					writer.flush().map_err(out_err)?;
					report.records_written += records.len() as u64;
					self.log.info(format_args!(
						"wrote {} {} devices to {}",
						records.len(),
						self.phy,
						self.output.display()
					));
				}
				Err(e) => {
					report.failed_polls += 1;
					self.log.error(format_args!("{e}"));
				}
			}

			if self.max_cycles.is_some_and(|max| report.cycles >= max) {
				break;
			}
			cancel.sleep(self.interval).await;
		}

		writer.flush().map_err(out_err)?;
		self.log.info(format_args!(
			"monitor stopped after {} cycles, {} records",
			report.cycles, report.records_written
		));
		Ok(report)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use chrono::NaiveDate;

	use super::*;

	#[test]
	fn session_file_layout() {
		let at = NaiveDate::from_ymd_opt(2024, 5, 1)
			.unwrap()
			.and_hms_opt(13, 4, 5)
			.unwrap();
		assert_eq!(
			session_file(Path::new("/opt/kismet/logs"), at, "Bluetooth"),
			PathBuf::from("/opt/kismet/logs/Kismet-2024.05.01-130405-1/bluetooth.devices.json")
		);
	}

	#[test]
	fn devices_url_is_joined() {
		let settings = MonitorSettings {
			kismet_url: "http://10.0.0.5:2501".into(),
			..MonitorSettings::default()
		};
		let p = KismetPoller::new(&settings).unwrap();
		assert_eq!(
			p.devices_url.as_str(),
			"http://10.0.0.5:2501/devices/views/all/devices.json"
		);
	}

	#[test]
	fn bad_url_rejected() {
		let settings = MonitorSettings {
			kismet_url: "not a url".into(),
			..MonitorSettings::default()
		};
		assert!(matches!(
			KismetPoller::new(&settings),
			Err(MonitorError::InvalidUrl { .. })
		));
	}

	#[tokio::test]
	async fn unreachable_scanner_keeps_looping() {
		let dir = tempfile::tempdir().unwrap();
		let settings = MonitorSettings {
			kismet_url: "http://127.0.0.1:1".into(),
			poll_interval_secs: 1,
			output_dir: dir.path().to_path_buf(),
			..MonitorSettings::default()
		};
		let monitor = Monitor::new(&settings, LogHandle::discard())
			.unwrap()
			.with_max_cycles(2);
		let report = monitor.run(&Cancellation::new()).await.unwrap();
		assert_eq!(report.cycles, 2);
		assert_eq!(report.failed_polls, 2);
		assert_eq!(report.records_written, 0);
		assert!(report.output.exists());
	}
}
