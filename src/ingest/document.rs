use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ingest::format_detection::SourceKind;
use crate::normalizers::{self, RawValue};

pub const FIELD_TIMESTAMP: &str = "@timestamp";
pub const FIELD_SOURCE_FILE: &str = "source_file";
pub const FIELD_SOURCE_TABLE: &str = "source_table";
pub const FIELD_LINE_NUMBER: &str = "line_number";
pub const FIELD_ROW_NUMBER: &str = "row_number";
pub const FIELD_DEVICE_NAME: &str = "device_name";
pub const FIELD_APP_NAME: &str = "app_name";
pub const FIELD_DATA_TYPE: &str = "data_type";
pub const FIELD_LOG_TYPE: &str = "log_type";
pub const FIELD_RAW_MESSAGE: &str = "raw_message";

/// One normalized record bound for the datastore.
///
/// Field order is irrelevant. Provenance is written first and source fields
/// are inserted afterwards under their own names, so a source column called
/// `@timestamp` or `device_name` replaces the provenance value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
	pub fn new() -> Self {
		Self(Map::new())
	}

	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
		self.0.insert(key.into(), value.into())
	}

	/// Normalize `raw` and insert it under `key`, adding the `<key>_type`
	/// marker for re-encoded binary. Nulls are dropped; returns whether
	/// anything was inserted.
	pub fn insert_raw(&mut self, key: &str, raw: RawValue<'_>) -> bool {
		if raw.is_null() {
			return false;
		}
		let normalized = normalizers::normalize(raw);
		if let Some((suffix, marker)) = normalized.marker() {
			self.0.insert(format!("{key}{suffix}"), Value::from(marker));
		}
		self.0.insert(key.to_owned(), normalized.value);
		true
	}

	/// Merge the top-level keys of a parsed object. Incoming keys win.
	pub fn merge_object(&mut self, object: Map<String, Value>) {
		self.0.extend(object);
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.0.contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_map(&self) -> &Map<String, Value> {
		&self.0
	}

	pub fn into_map(self) -> Map<String, Value> {
		self.0
	}
}

impl From<Map<String, Value>> for Document {
	fn from(map: Map<String, Value>) -> Self {
		Self(map)
	}
}

/// Where inside a source a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin<'a> {
	Table(&'a str),
	Line(u64),
	Row(u64),
}

/// Identity labels stamped on every document of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
	pub device_name: String,
	pub app_name: String,
}

impl SourceContext {
	pub fn new(device_name: impl Into<String>, app_name: impl Into<String>) -> Self {
		Self {
			device_name: device_name.into(),
			app_name: app_name.into(),
		}
	}

	/// `<app>_<suffix>`, e.g. `kismet_db`.
	pub fn log_type(&self, kind: SourceKind) -> String {
		format!("{}_{}", self.app_name, kind.log_type_suffix())
	}

	/// A fresh document carrying the timestamp and provenance fields.
	pub fn seed(&self, source_file: &str, kind: SourceKind, origin: Origin<'_>) -> Document {
		let mut doc = Document::new();
		doc.insert(FIELD_TIMESTAMP, now_iso8601());
		doc.insert(FIELD_SOURCE_FILE, source_file);
		match origin {
			Origin::Table(table) => doc.insert(FIELD_SOURCE_TABLE, table),
			Origin::Line(n) => doc.insert(FIELD_LINE_NUMBER, n),
			Origin::Row(n) => doc.insert(FIELD_ROW_NUMBER, n),
		};
		doc.insert(FIELD_DEVICE_NAME, self.device_name.as_str());
		doc.insert(FIELD_APP_NAME, self.app_name.as_str());
		doc.insert(FIELD_DATA_TYPE, kind.data_type());
		doc.insert(FIELD_LOG_TYPE, self.log_type(kind));
		doc
	}
}

/// Extraction-time timestamp, UTC, microsecond precision.
pub fn now_iso8601() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
