use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Format override chosen by the operator. `Auto` lets discovery decide per
/// file from extension and content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
	#[default]
	Auto,
	Sqlite,
	Log,
	Json,
	Csv,
}

impl InputFormat {
	pub fn as_str(&self) -> &'static str {
		match self {
			InputFormat::Auto => "auto",
			InputFormat::Sqlite => "sqlite",
			InputFormat::Log => "log",
			InputFormat::Json => "json",
			InputFormat::Csv => "csv",
		}
	}
}

impl FromStr for InputFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"auto" => Ok(InputFormat::Auto),
			"sqlite" | "db" | "kismet" => Ok(InputFormat::Sqlite),
			"log" | "text" => Ok(InputFormat::Log),
			"json" | "ndjson" | "jsonl" => Ok(InputFormat::Json),
			"csv" => Ok(InputFormat::Csv),
			other => Err(format!("unknown input format '{other}'")),
		}
	}
}

/// How a line-oriented source is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineFormat {
	/// Lines starting with `{` are tried as JSON, everything else is text.
	#[default]
	Auto,
	/// Every line is tried as JSON.
	Json,
	/// Every line is kept verbatim.
	Text,
}

/// The extractor a source is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
	/// A Kismet capture database (`.kismet`).
	KismetDb,
	/// Any other SQLite database.
	Database,
	LineLog,
	Csv,
}

impl SourceKind {
	/// Value of the `data_type` provenance field.
	pub fn data_type(&self) -> &'static str {
		match self {
			SourceKind::KismetDb => "kismetdb",
			SourceKind::Database => "database",
			SourceKind::LineLog => "log",
			SourceKind::Csv => "csv",
		}
	}

	pub fn log_type_suffix(&self) -> &'static str {
		match self {
			SourceKind::KismetDb | SourceKind::Database => "db",
			SourceKind::LineLog => "log",
			SourceKind::Csv => "csv",
		}
	}

	pub fn is_database(&self) -> bool {
		matches!(self, SourceKind::KismetDb | SourceKind::Database)
	}
}

/// Result of classifying one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
	pub kind: SourceKind,
	pub line_format: LineFormat,
	pub compressed: bool,
}

impl Detected {
	fn new(kind: SourceKind) -> Self {
		Self {
			kind,
			line_format: LineFormat::Auto,
			compressed: false,
		}
	}

	fn lines(line_format: LineFormat) -> Self {
		Self {
			kind: SourceKind::LineLog,
			line_format,
			compressed: false,
		}
	}

	fn gz(mut self, compressed: bool) -> Self {
		self.compressed = compressed;
		self
	}
}

/// Lower-cased extension, with a trailing `.gz` peeled off.
fn extension_of(path: &Path) -> (Option<String>, bool) {
	let lower = |p: &Path| {
		p.extension()
			.and_then(|e| e.to_str())
			.map(|e| e.to_ascii_lowercase())
	};
	match lower(path) {
		Some(ext) if ext == "gz" => (path.file_stem().map(Path::new).and_then(lower), true),
		other => (other, false),
	}
}

/// Classify `path`. `peek` holds the first bytes of the file and is only
/// consulted when the extension gives no answer. Returns `None` for files
/// no extractor handles (packet captures, unrecognised binary).
pub fn detect_source(path: &Path, peek: &[u8], format: InputFormat) -> Option<Detected> {
	let (ext, gz_ext) = extension_of(path);
	let compressed = gz_ext || peek.starts_with(&GZIP_MAGIC);

	match format {
		InputFormat::Sqlite => {
			let kind = if ext.as_deref() == Some("kismet") {
				SourceKind::KismetDb
			} else {
				SourceKind::Database
			};
			return Some(Detected::new(kind));
		}
		InputFormat::Log => return Some(Detected::lines(LineFormat::Text).gz(compressed)),
		InputFormat::Json => return Some(Detected::lines(LineFormat::Json).gz(compressed)),
		InputFormat::Csv => return Some(Detected::new(SourceKind::Csv).gz(compressed)),
		InputFormat::Auto => {}
	}

	match ext.as_deref() {
		Some("kismet") if !gz_ext => return Some(Detected::new(SourceKind::KismetDb)),
		Some("db" | "sqlite" | "sqlite3") if !gz_ext => {
			return Some(Detected::new(SourceKind::Database));
		}
		Some("json" | "jsonl" | "ndjson" | "log" | "txt") => {
			return Some(Detected::lines(LineFormat::Auto).gz(compressed));
		}
		Some("csv") => return Some(Detected::new(SourceKind::Csv).gz(compressed)),
		Some("pcap" | "pcapng") => return None,
		_ => {}
	}

	sniff(peek)
}

/// Content-based fallback for files without a telling extension.
fn sniff(peek: &[u8]) -> Option<Detected> {
	if peek.starts_with(SQLITE_MAGIC) {
		return Some(Detected::new(SourceKind::Database));
	}
	if peek.starts_with(&GZIP_MAGIC) {
		return Some(Detected::lines(LineFormat::Auto).gz(true));
	}
	if peek.is_empty() {
		return None;
	}

	let printable = peek.iter().filter(|&&b| is_printable(b)).count();
	if (printable as f64 / peek.len() as f64) < 0.7 {
		return None;
	}

	let text = String::from_utf8_lossy(peek);
	let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
	if first_line.trim_start().starts_with('{') {
		return Some(Detected::lines(LineFormat::Auto));
	}
	if first_line.contains(',') {
		return Some(Detected::new(SourceKind::Csv));
	}
	Some(Detected::lines(LineFormat::Auto))
}

fn is_printable(b: u8) -> bool {
	match b {
		0x09 | 0x0A | 0x0D => true,
		0x20..=0x7E => true,
		// UTF-8 continuation and lead bytes
		0x80..=0xF4 => true,
		_ => false,
	}
}
