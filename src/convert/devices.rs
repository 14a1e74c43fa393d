//! Device inventory: the `devices` table of a capture database written out
//! as one line-delimited file per radio, beside the monitor's session logs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use serde::Serialize;
use serde_json::{Map, Value};

use super::ConvertError;
use crate::ingest::document::now_iso8601;
use crate::monitor::normalize_numeric_arrays;
use crate::observability::LogHandle;
use crate::persist::NdjsonWriter;

const DEVICES_QUERY: &str = "SELECT devkey, phyname, devmac, strongest_signal, \
	min_lat, min_lon, max_lat, max_lon, first_time, last_time, device FROM devices";

const MANUF: &str = "kismet.device.base.manuf";
const NAME: &str = "kismet.device.base.name";
const PACKETS: &str = "kismet.device.base.packets.total";
const DOT11: &str = "dot11.device";
const DOT11_SSID: &str = "dot11.device.last_beaconed_ssid";
const DOT11_ASSOCIATED: &str = "dot11.device.num_associated_clients";
const DOT11_CLIENTS: &str = "dot11.device.client_map";
const BLUETOOTH: &str = "bluetooth.device";
const BLUETOOTH_TYPE: &str = "bluetooth.device.type";

/// Radio a device row belongs to. Rows of any other PHY are not exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhy {
	Wifi,
	Bluetooth,
}

impl DevicePhy {
	pub fn from_phyname(phyname: &str) -> Option<Self> {
		match phyname {
			"IEEE802.11" => Some(DevicePhy::Wifi),
			"Bluetooth" => Some(DevicePhy::Bluetooth),
			_ => None,
		}
	}

	pub fn file_name(&self) -> &'static str {
		match self {
			DevicePhy::Wifi => "wifi.devices.json",
			DevicePhy::Bluetooth => "bluetooth.devices.json",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventTag {
	pub kind: &'static str,
	pub category: [&'static str; 1],
}

impl Default for EventTag {
	fn default() -> Self {
		Self {
			kind: "signal",
			category: ["network"],
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
	pub lat: f64,
	pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Geo {
	pub location: GeoPoint,
}

/// One line of `wifi.devices.json` or `bluetooth.devices.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryRecord {
	#[serde(rename = "@timestamp")]
	pub exported_at: String,
	/// Last time the device was heard.
	pub timestamp: Option<String>,
	pub first_seen: Option<String>,
	pub last_seen: Option<String>,
	pub device_key: Option<String>,
	pub phy_name: String,
	pub mac_address: Option<String>,
	pub signal_dbm: Option<i64>,
	pub packets: Value,
	pub event: EventTag,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub geo: Option<Geo>,
	pub device_type: Value,
	pub manufacturer: Value,
	pub device_name: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssid: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub associated_clients: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_count: Option<usize>,
	pub raw_device: Value,
}

/// Columns of one `devices` row, before the device blob is interpreted.
#[derive(Debug, Clone, Default)]
pub struct DeviceRow {
	pub devkey: Option<String>,
	pub phyname: String,
	pub devmac: Option<String>,
	pub strongest_signal: Option<i64>,
	pub min_lat: Option<f64>,
	pub min_lon: Option<f64>,
	pub max_lat: Option<f64>,
	pub max_lon: Option<f64>,
	pub first_time: Option<i64>,
	pub last_time: Option<i64>,
	pub device: Map<String, Value>,
}

impl DeviceRow {
	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(Self {
			devkey: row.get(0)?,
			phyname: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
			devmac: row.get(2)?,
			strongest_signal: row.get(3)?,
			min_lat: row.get(4)?,
			min_lon: row.get(5)?,
			max_lat: row.get(6)?,
			max_lon: row.get(7)?,
			first_time: row.get(8)?,
			last_time: row.get(9)?,
			device: device_blob(row.get_ref(10)?),
		})
	}
}

/// The device column holds JSON as text or blob. Anything unreadable is
/// treated as an empty device.
fn device_blob(value: ValueRef<'_>) -> Map<String, Value> {
	let bytes = match value {
		ValueRef::Text(b) | ValueRef::Blob(b) => b,
		_ => return Map::new(),
	};
	match serde_json::from_slice(bytes) {
		Ok(Value::Object(map)) => map,
		_ => Map::new(),
	}
}

fn local_time(epoch: Option<i64>) -> Option<String> {
	let secs = epoch.filter(|&t| t != 0)?;
	DateTime::from_timestamp(secs, 0)
		.map(|t| t.with_timezone(&Local).to_rfc3339_opts(SecondsFormat::Secs, false))
}

fn nonzero(v: Option<f64>) -> Option<f64> {
	v.filter(|&x| x != 0.0)
}

/// Midpoint of the bounding box. A missing or zero maximum falls back to
/// the minimum; a missing or zero minimum means no fix at all.
fn midpoint(row: &DeviceRow) -> Option<Geo> {
	let (min_lat, min_lon) = (nonzero(row.min_lat)?, nonzero(row.min_lon)?);
	let mid = |min: f64, max: Option<f64>| match nonzero(max) {
		Some(max) => (min + max) / 2.0,
		None => min,
	};
	Some(Geo {
		location: GeoPoint {
			lat: mid(min_lat, row.max_lat),
			lon: mid(min_lon, row.max_lon),
		},
	})
}

impl InventoryRecord {
	/// Build the record for `row`, or `None` when its PHY is not exported.
	pub fn from_row(row: &DeviceRow) -> Option<(DevicePhy, Self)> {
		let phy = DevicePhy::from_phyname(&row.phyname)?;
		let device = &row.device;
		let nested = |outer: &str, key: &str| device.get(outer).and_then(|o| o.get(key)).cloned();

		let mut record = Self {
			exported_at: now_iso8601(),
			timestamp: local_time(row.last_time),
			first_seen: local_time(row.first_time),
			last_seen: local_time(row.last_time),
			device_key: row.devkey.clone(),
			phy_name: row.phyname.clone(),
			mac_address: row.devmac.clone(),
			signal_dbm: row.strongest_signal,
			packets: device.get(PACKETS).cloned().unwrap_or(Value::from(0)),
			event: EventTag::default(),
			geo: midpoint(row),
			device_type: Value::from("WiFi"),
			manufacturer: device.get(MANUF).cloned().unwrap_or(Value::from("Unknown")),
			device_name: device.get(NAME).cloned().unwrap_or(Value::from("")),
			ssid: None,
			associated_clients: None,
			client_count: None,
			raw_device: serde_json::json!({
				"kismet": {"device": normalize_numeric_arrays(Value::Object(device.clone()))}
			}),
		};

		match phy {
			DevicePhy::Wifi => {
				record.ssid = nested(DOT11, DOT11_SSID);
				record.associated_clients = nested(DOT11, DOT11_ASSOCIATED);
				record.client_count = nested(DOT11, DOT11_CLIENTS).and_then(|c| match c {
					Value::Object(m) => Some(m.len()),
					Value::Array(a) => Some(a.len()),
					_ => None,
				});
			}
			DevicePhy::Bluetooth => {
				record.device_type =
					nested(BLUETOOTH, BLUETOOTH_TYPE).unwrap_or(Value::from("BTLE"));
			}
		}
		Some((phy, record))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceExportReport {
	pub session_dir: PathBuf,
	pub wifi: u64,
	pub bluetooth: u64,
	/// Rows of other radios, or rows that could not be read.
	pub skipped: u64,
}

/// Export the device inventory of `db` into `<output_dir>/<db stem>/`.
///
/// Both files are rewritten on every run, empty when the database has no
/// device of that radio.
pub fn export_devices(
	db: &Path,
	output_dir: &Path,
	log: &LogHandle,
) -> Result<DeviceExportReport, ConvertError> {
	let db_err = |source| ConvertError::Database {
		path: db.to_path_buf(),
		source,
	};
	if !db.is_file() {
		return Err(ConvertError::Input {
			path: db.to_path_buf(),
			source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such database"),
		});
	}
	let conn = Connection::open_with_flags(
		db,
		OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
	)
	.map_err(db_err)?;

	let mut stmt = conn.prepare(DEVICES_QUERY).map_err(db_err)?;

	let stem = db
		.file_stem()
		.map(|s| s.to_string_lossy().into_owned())
		.unwrap_or_else(|| "kismet".to_owned());
	let session_dir = output_dir.join(stem);
	let open = |phy: DevicePhy| {
		let path = session_dir.join(phy.file_name());
		NdjsonWriter::create(&path).map_err(|source| ConvertError::Output { path, source })
	};
	let mut wifi = open(DevicePhy::Wifi)?;
	let mut bluetooth = open(DevicePhy::Bluetooth)?;

	let mut report = DeviceExportReport {
		session_dir: session_dir.clone(),
		..DeviceExportReport::default()
	};
	let rows = stmt.query_map([], DeviceRow::from_row).map_err(db_err)?;
	for row in rows {
		let row = match row {
			Ok(row) => row,
			Err(e) => {
				log.warn(format_args!("{}: unreadable device row: {e}", db.display()));
				report.skipped += 1;
				continue;
			}
		};
		let Some((phy, record)) = InventoryRecord::from_row(&row) else {
			report.skipped += 1;
			continue;
		};
		let writer = match phy {
			DevicePhy::Wifi => &mut wifi,
			DevicePhy::Bluetooth => &mut bluetooth,
		};
		writer.write(&record).map_err(|source| ConvertError::Output {
			path: session_dir.join(phy.file_name()),
			source,
		})?;
	}

	for (phy, writer) in [(DevicePhy::Wifi, &mut wifi), (DevicePhy::Bluetooth, &mut bluetooth)] {
		writer.flush().map_err(|source| ConvertError::Output {
			path: session_dir.join(phy.file_name()),
			source,
		})?;
	}
	report.wifi = wifi.written();
	report.bluetooth = bluetooth.written();

	log.info(format_args!(
		"exported {} wifi and {} bluetooth devices to {} ({} rows skipped)",
		report.wifi,
		report.bluetooth,
		session_dir.display(),
		report.skipped
	));
	Ok(report)
}
