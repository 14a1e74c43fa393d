pub mod discovery;
pub mod document;
pub mod format_detection;
pub mod parsers;

use thiserror::Error;

use crate::observability::LogHandle;

pub use discovery::{SourceDescriptor, discover};
pub use document::{Document, Origin, SourceContext};
pub use format_detection::{InputFormat, LineFormat, SourceKind};
pub use parsers::{CsvExtractor, LineExtractor, SqliteExtractor};

/// Failures while reading a source. `Open`, `Catalog` and `Io` stop the
/// source before any document is produced; the rest are recorded by the
/// extractor and extraction carries on with the next table, row or file.
#[derive(Debug, Error)]
pub enum ExtractionError {
	#[error("cannot open database {path}: {source}")]
	Open {
		path: String,
		#[source]
		source: rusqlite::Error,
	},

	#[error("cannot list tables in {path}: {source}")]
	Catalog {
		path: String,
		#[source]
		source: rusqlite::Error,
	},

	#[error("{path}: table {table}: {source}")]
	Table {
		path: String,
		table: String,
		#[source]
		source: rusqlite::Error,
	},

	#[error("cannot open {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{path}: read failed at line {line}: {source}")]
	Read {
		path: String,
		line: u64,
		#[source]
		source: std::io::Error,
	},

	#[error("{path}: row {row}: {source}")]
	Csv {
		path: String,
		row: u64,
		#[source]
		source: csv::Error,
	},
}

/// A finite, non-restartable stream of documents from one source.
///
/// Recoverable failures met while iterating are kept and handed out by
/// [`take_failures`](Extractor::take_failures) once the caller is done.
pub trait Extractor: Iterator<Item = Document> + Send {
	fn source_kind(&self) -> SourceKind;

	fn take_failures(&mut self) -> Vec<ExtractionError>;
}

/// Route a discovered source to its extractor.
pub fn open_extractor(
	source: &SourceDescriptor,
	ctx: SourceContext,
	table_row_limit: Option<u64>,
	log: LogHandle,
) -> Result<Box<dyn Extractor>, ExtractionError> {
	Ok(match source.kind {
		SourceKind::KismetDb | SourceKind::Database => Box::new(SqliteExtractor::open(
			&source.path,
			source.kind,
			ctx,
			table_row_limit,
			log,
		)?),
		SourceKind::LineLog => Box::new(LineExtractor::open(
			&source.path,
			source.compressed,
			source.line_format,
			ctx,
			log,
		)?),
		SourceKind::Csv => Box::new(CsvExtractor::open(
			&source.path,
			source.compressed,
			ctx,
			log,
		)?),
	})
}
