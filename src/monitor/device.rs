use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::ingest::document::now_iso8601;

const MACADDR: &str = "kismet.device.base.macaddr";
const NAME: &str = "kismet.device.base.name";
const MANUF: &str = "kismet.device.base.manuf";
const FIRST_TIME: &str = "kismet.device.base.first_time";
const LAST_TIME: &str = "kismet.device.base.last_time";
const SIGNAL: &str = "kismet.device.base.signal";
const LAST_SIGNAL: &str = "kismet.common.signal.last_signal";
const PACKETS: &str = "kismet.device.base.packets.total";
const DATASIZE: &str = "kismet.device.base.datasize";
const TYPE: &str = "kismet.device.base.type";
pub(crate) const PHYNAME: &str = "kismet.device.base.phyname";

/// Flattened view of one scanner device, one NDJSON line in the device log.
///
/// Fields hold whatever the scanner reported; a default (`""` or `0`) only
/// stands in for a key the device does not carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
	pub timestamp: String,
	pub mac_address: Value,
	pub device_name: Value,
	pub manufacturer: Value,
	pub first_seen: Value,
	pub last_seen: Value,
	pub signal_dbm: Value,
	pub packets: Value,
	pub data_size: Value,
	pub device_type: Value,
	pub phy_name: Value,
	/// The full device, numeric arrays normalized to floats.
	pub raw_device: Value,
}

impl DeviceRecord {
	pub fn from_device(device: &Map<String, Value>) -> Self {
		let or = |key: &str, default: Value| device.get(key).cloned().unwrap_or(default);
		let text = |key: &str| or(key, Value::from(""));
		let number = |key: &str| or(key, Value::from(0));
		let signal = device
			.get(SIGNAL)
			.and_then(|s| s.get(LAST_SIGNAL))
			.cloned()
			.unwrap_or(Value::from(0));

		Self {
			timestamp: now_iso8601(),
			mac_address: text(MACADDR),
			device_name: text(NAME),
			manufacturer: text(MANUF),
			first_seen: number(FIRST_TIME),
			last_seen: number(LAST_TIME),
			signal_dbm: signal,
			packets: number(PACKETS),
			data_size: number(DATASIZE),
			device_type: text(TYPE),
			phy_name: text(PHYNAME),
			raw_device: normalize_numeric_arrays(Value::Object(device.clone())),
		}
	}
}

/// Give numeric arrays one element type so the datastore maps them once.
///
/// Arrays under keys ending in `_vec` get every number widened to float and
/// keep their other elements. Any other all-number array is widened too;
/// mixed arrays are walked element by element.
pub fn normalize_numeric_arrays(value: Value) -> Value {
	match value {
		Value::Object(map) => Value::Object(
			map.into_iter()
				.map(|(key, value)| {
					let value = match value {
						Value::Array(items) if key.ends_with("_vec") => {
							Value::Array(items.into_iter().map(widen).collect())
						}
						Value::Array(items) if items.iter().all(Value::is_number) => {
							Value::Array(items.into_iter().map(widen).collect())
						}
						other => normalize_numeric_arrays(other),
					};
					(key, value)
				})
				.collect(),
		),
		Value::Array(items) => Value::Array(items.into_iter().map(normalize_numeric_arrays).collect()),
		other => other,
	}
}

fn widen(value: Value) -> Value {
	match &value {
		Value::Number(n) => n
			.as_f64()
			.and_then(Number::from_f64)
			.map(Value::Number)
			.unwrap_or(value),
		_ => value,
	}
}
