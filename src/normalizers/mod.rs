//! Canonicalization of loosely-typed scalar values.
//!
//! Scanner databases store the same logical field as INTEGER in one file, as
//! TEXT in the next, and sometimes as a BLOB of JSON. Every scalar placed in a
//! [`Document`](crate::ingest::Document) passes through [`normalize`] first so
//! the emitted documents are always JSON-serializable.
//!
//! ## Rules
//!
//! - Binary: UTF-8 text when it decodes, otherwise standard Base64 with the
//!   [`Encoding::Base64`] marker so the caller can add `<field>_type`.
//! - Text is run through an ordered chain of conversion attempts
//!   ([`TEXT_STAGES`]): embedded JSON (only for text starting with `{`),
//!   decimal integer, float literal. The first stage that succeeds wins and a
//!   string no stage accepts is returned unchanged.
//! - Integers pass through. Finite reals become JSON numbers; non-finite reals
//!   are rendered as strings since JSON has no representation for them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Number, Value};

/// Value of the sibling `<field>_type` marker for re-encoded binary.
pub const BASE64_MARKER: &str = "base64_encoded";

/// Suffix of the marker field name.
pub const MARKER_SUFFIX: &str = "_type";

/// A scalar as read from a source, before normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue<'a> {
	Null,
	Integer(i64),
	Real(f64),
	Text(&'a str),
	Blob(&'a [u8]),
}

impl RawValue<'_> {
	pub fn is_null(&self) -> bool {
		matches!(self, RawValue::Null)
	}
}

impl<'a> From<&'a rusqlite::types::Value> for RawValue<'a> {
	fn from(v: &'a rusqlite::types::Value) -> Self {
		use rusqlite::types::Value as Sql;
		match v {
			Sql::Null => RawValue::Null,
			Sql::Integer(i) => RawValue::Integer(*i),
			Sql::Real(f) => RawValue::Real(*f),
			Sql::Text(s) => RawValue::Text(s),
			Sql::Blob(b) => RawValue::Blob(b),
		}
	}
}

/// How the normalized value relates to the raw one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
	Native,
	Base64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
	pub value: Value,
	pub encoding: Encoding,
}

impl Normalized {
	fn native(value: Value) -> Self {
		Self {
			value,
			encoding: Encoding::Native,
		}
	}

	/// The `(suffix, marker)` pair to attach next to the field, if any.
	pub fn marker(&self) -> Option<(&'static str, &'static str)> {
		match self.encoding {
			Encoding::Base64 => Some((MARKER_SUFFIX, BASE64_MARKER)),
			Encoding::Native => None,
		}
	}
}

/// One fallible conversion attempt over text. `None` hands the text to the
/// next stage.
pub type TextStage = fn(&str) -> Option<Value>;

/// Text conversion attempts, in priority order.
pub const TEXT_STAGES: [TextStage; 3] = [embedded_json, decimal_integer, float_literal];

/// Normalize one raw scalar. Never fails: every rejected attempt falls
/// through to the next rule and finally to the original value.
pub fn normalize(raw: RawValue<'_>) -> Normalized {
	match raw {
		RawValue::Null => Normalized::native(Value::Null),
		RawValue::Integer(i) => Normalized::native(Value::from(i)),
		RawValue::Real(f) => Normalized::native(real(f)),
		RawValue::Text(s) => Normalized::native(normalize_text(s)),
		RawValue::Blob(bytes) => match std::str::from_utf8(bytes) {
			Ok(s) => Normalized::native(Value::String(s.to_owned())),
			Err(_) => Normalized {
				value: Value::String(STANDARD.encode(bytes)),
				encoding: Encoding::Base64,
			},
		},
	}
}

/// Run `s` through [`TEXT_STAGES`].
pub fn normalize_text(s: &str) -> Value {
	TEXT_STAGES
		.iter()
		.find_map(|stage| stage(s))
		.unwrap_or_else(|| Value::String(s.to_owned()))
}

fn real(f: f64) -> Value {
	Number::from_f64(f)
		.map(Value::Number)
		.unwrap_or_else(|| Value::String(f.to_string()))
}

/// `{...}` text that parses as JSON becomes the parsed structure.
pub fn embedded_json(s: &str) -> Option<Value> {
	if !s.starts_with('{') {
		return None;
	}
	serde_json::from_str(s).ok()
}

/// Text made only of ASCII decimal digits becomes an integer. Digit strings
/// wider than `u64` have no exact JSON number here, so they stay text
/// instead of reaching the float stage and losing digits.
pub fn decimal_integer(s: &str) -> Option<Value> {
	if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	Some(
		s.parse::<u64>()
			.map(Value::from)
			.unwrap_or_else(|_| Value::String(s.to_owned())),
	)
}

/// Text that parses as a finite float literal becomes a float. Surrounding
/// whitespace is tolerated; `inf`/`nan` spellings are rejected.
pub fn float_literal(s: &str) -> Option<Value> {
	s.trim()
		.parse::<f64>()
		.ok()
		.filter(|f| f.is_finite())
		.and_then(Number::from_f64)
		.map(Value::Number)
}
