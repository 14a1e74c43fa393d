use std::io::BufRead;
use std::path::Path;

use serde_json::Value;

use crate::ingest::document::{Document, FIELD_RAW_MESSAGE, Origin, SourceContext};
use crate::ingest::format_detection::{LineFormat, SourceKind};
use crate::ingest::parsers::compressed;
use crate::ingest::{ExtractionError, Extractor};
use crate::observability::LogHandle;

/// One document per non-blank line of a text or JSON-lines source.
///
/// Bytes are split on `\n` and decoded lossily, so a stray invalid byte
/// degrades one line instead of ending the file. Line numbers count every
/// physical line, blank ones included, starting at 1.
pub struct LineExtractor {
	reader: Box<dyn BufRead + Send>,
	path: String,
	source_file: String,
	format: LineFormat,
	ctx: SourceContext,
	line_number: u64,
	buf: Vec<u8>,
	failures: Vec<ExtractionError>,
	log: LogHandle,
}

impl LineExtractor {
	pub fn open(
		path: &Path,
		compressed: bool,
		format: LineFormat,
		ctx: SourceContext,
		log: LogHandle,
	) -> Result<Self, ExtractionError> {
		let reader = compressed::open_source(path, compressed).map_err(|source| {
			ExtractionError::Io {
				path: path.display().to_string(),
				source,
			}
		})?;
		Ok(Self::from_reader(
			reader,
			&path.display().to_string(),
			&super::basename(path),
			format,
			ctx,
			log,
		))
	}

	pub fn from_reader(
		reader: Box<dyn BufRead + Send>,
		path: &str,
		source_file: &str,
		format: LineFormat,
		ctx: SourceContext,
		log: LogHandle,
	) -> Self {
		Self {
			reader,
			path: path.to_owned(),
			source_file: source_file.to_owned(),
			format,
			ctx,
			line_number: 0,
			buf: Vec::new(),
			failures: Vec::new(),
			log,
		}
	}
}

impl Iterator for LineExtractor {
	type Item = Document;

	fn next(&mut self) -> Option<Document> {
		loop {
			self.buf.clear();
			match self.reader.read_until(b'\n', &mut self.buf) {
				Ok(0) => return None,
				Ok(_) => {
					self.line_number += 1;
					let text = String::from_utf8_lossy(&self.buf);
					let line = text.trim_end_matches(['\n', '\r']);
					if line.trim().is_empty() {
						continue;
					}
					return Some(line_document(
						&self.ctx,
						&self.source_file,
						self.line_number,
						line,
						self.format,
					));
				}
				Err(source) => {
					self.log.warn(format_args!(
						"{}: read failed after line {}: {source}",
						self.path, self.line_number
					));
					self.failures.push(ExtractionError::Read {
						path: self.path.clone(),
						line: self.line_number + 1,
						source,
					});
					return None;
				}
			}
		}
	}
}

impl Extractor for LineExtractor {
	fn source_kind(&self) -> SourceKind {
		SourceKind::LineLog
	}

	fn take_failures(&mut self) -> Vec<ExtractionError> {
		std::mem::take(&mut self.failures)
	}
}

/// Build the document for one non-blank line.
///
/// A line that parses as a JSON object has its top-level keys merged over
/// the provenance fields. Anything else, including valid JSON that is not
/// an object, is kept under `raw_message` with surrounding whitespace
/// stripped.
pub fn line_document(
	ctx: &SourceContext,
	source_file: &str,
	line_number: u64,
	line: &str,
	format: LineFormat,
) -> Document {
	let mut doc = ctx.seed(source_file, SourceKind::LineLog, Origin::Line(line_number));
	let trimmed = line.trim();
	let try_json = match format {
		LineFormat::Json => true,
		LineFormat::Auto => trimmed.starts_with('{'),
		LineFormat::Text => false,
	};

	if try_json {
		if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
			doc.merge_object(object);
			return doc;
		}
	}
	doc.insert(FIELD_RAW_MESSAGE, trimmed);
	doc
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::io::Cursor;

	use serde_json::json;

	use super::*;
	use crate::ingest::document::{FIELD_DATA_TYPE, FIELD_LINE_NUMBER};

	fn extract(input: &[u8], format: LineFormat) -> Vec<Document> {
		LineExtractor::from_reader(
			Box::new(Cursor::new(input.to_vec())),
			"test.log",
			"test.log",
			format,
			SourceContext::new("sensor", "kismet"),
			LogHandle::discard(),
		)
		.collect()
	}

	#[test]
	fn blank_lines_skipped_and_json_merged() {
		let docs = extract(b"\n{\"a\":1}\nplain text\n", LineFormat::Auto);
		assert_eq!(docs.len(), 2);
		assert_eq!(docs[0].get("a"), Some(&json!(1)));
		assert!(docs[0].get(FIELD_RAW_MESSAGE).is_none());
		assert_eq!(docs[0].get(FIELD_LINE_NUMBER), Some(&json!(2)));
		assert_eq!(docs[1].get(FIELD_RAW_MESSAGE), Some(&json!("plain text")));
		assert_eq!(docs[1].get(FIELD_LINE_NUMBER), Some(&json!(3)));
		assert_eq!(docs[1].get(FIELD_DATA_TYPE), Some(&json!("log")));
	}

	#[test]
	fn whitespace_only_lines_skipped() {
		let docs = extract(b"  \t \r\nx\r\n", LineFormat::Auto);
		assert_eq!(docs.len(), 1);
		assert_eq!(docs[0].get(FIELD_RAW_MESSAGE), Some(&json!("x")));
	}

	#[test]
	fn raw_message_is_stripped() {
		let docs = extract(b"  \tpadded text \t\n", LineFormat::Auto);
		assert_eq!(docs[0].get(FIELD_RAW_MESSAGE), Some(&json!("padded text")));
	}

	#[test]
	fn malformed_json_degrades_to_raw() {
		let docs = extract(b"{broken\n", LineFormat::Auto);
		assert_eq!(docs[0].get(FIELD_RAW_MESSAGE), Some(&json!("{broken")));
	}

	#[test]
	fn json_hint_only_accepts_objects() {
		let docs = extract(b"[1,2]\n  {\"b\":true}\n", LineFormat::Json);
		assert_eq!(docs[0].get(FIELD_RAW_MESSAGE), Some(&json!("[1,2]")));
		assert_eq!(docs[1].get("b"), Some(&json!(true)));
	}

	#[test]
	fn text_hint_never_parses() {
		let docs = extract(b"{\"a\":1}\n", LineFormat::Text);
		assert_eq!(docs[0].get(FIELD_RAW_MESSAGE), Some(&json!("{\"a\":1}")));
		assert!(docs[0].get("a").is_none());
	}

	#[test]
	fn invalid_utf8_is_lossy_not_fatal() {
		let docs = extract(b"ok\n\xff\xfe bad\nlast", LineFormat::Auto);
		assert_eq!(docs.len(), 3);
		assert_eq!(docs[2].get(FIELD_RAW_MESSAGE), Some(&json!("last")));
	}

	#[test]
	fn parsed_keys_overwrite_provenance() {
		let docs = extract(b"{\"line_number\":99}\n", LineFormat::Auto);
		assert_eq!(docs[0].get(FIELD_LINE_NUMBER), Some(&json!(99)));
	}
}
