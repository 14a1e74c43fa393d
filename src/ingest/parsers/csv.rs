use std::io::BufRead;
use std::path::Path;

use crate::ingest::document::{Document, Origin, SourceContext};
use crate::ingest::format_detection::SourceKind;
use crate::ingest::parsers::compressed;
use crate::ingest::{ExtractionError, Extractor};
use crate::normalizers::RawValue;
use crate::observability::LogHandle;

type Records = csv::StringRecordsIntoIter<Box<dyn BufRead + Send>>;

/// One document per CSV data row. The header row names the fields; rows
/// wider than the header get `column_<n>` names. Cells are taken as
/// written: only cells with no characters at all are left out.
pub struct CsvExtractor {
	records: Records,
	headers: Vec<String>,
	path: String,
	source_file: String,
	ctx: SourceContext,
	row_number: u64,
	failures: Vec<ExtractionError>,
	log: LogHandle,
}

impl CsvExtractor {
	pub fn open(
		path: &Path,
		compressed: bool,
		ctx: SourceContext,
		log: LogHandle,
	) -> Result<Self, ExtractionError> {
		let display = path.display().to_string();
		let reader = compressed::open_source(path, compressed).map_err(|source| {
			ExtractionError::Io {
				path: display.clone(),
				source,
			}
		})?;
		Self::from_reader(reader, &display, &super::basename(path), ctx, log)
	}

	pub fn from_reader(
		reader: Box<dyn BufRead + Send>,
		path: &str,
		source_file: &str,
		ctx: SourceContext,
		log: LogHandle,
	) -> Result<Self, ExtractionError> {
		let mut rdr = csv::ReaderBuilder::new()
			.has_headers(true)
			.flexible(true)
			.trim(csv::Trim::None)
			.from_reader(reader);

		let headers = rdr
			.headers()
			.map_err(|source| ExtractionError::Csv {
				path: path.to_owned(),
				row: 0,
				source,
			})?
			.iter()
			.map(String::from)
			.collect();

		Ok(Self {
			records: rdr.into_records(),
			headers,
			path: path.to_owned(),
			source_file: source_file.to_owned(),
			ctx,
			row_number: 0,
			failures: Vec::new(),
			log,
		})
	}
}

impl Iterator for CsvExtractor {
	type Item = Document;

	fn next(&mut self) -> Option<Document> {
		loop {
			let result = self.records.next()?;
			self.row_number += 1;
			let record = match result {
				Ok(record) => record,
				Err(source) => {
					self.log.warn(format_args!(
						"{}: skipping row {}: {source}",
						self.path, self.row_number
					));
					self.failures.push(ExtractionError::Csv {
						path: self.path.clone(),
						row: self.row_number,
						source,
					});
					continue;
				}
			};

			let mut doc = self.ctx.seed(
				&self.source_file,
				SourceKind::Csv,
				Origin::Row(self.row_number),
			);
			for (i, cell) in record.iter().enumerate() {
				if cell.is_empty() {
					continue;
				}
				match self.headers.get(i).filter(|h| !h.is_empty()) {
					Some(name) => doc.insert_raw(name, RawValue::Text(cell)),
					None => doc.insert_raw(&format!("column_{}", i + 1), RawValue::Text(cell)),
				};
			}
			return Some(doc);
		}
	}
}

impl Extractor for CsvExtractor {
	fn source_kind(&self) -> SourceKind {
		SourceKind::Csv
	}

	fn take_failures(&mut self) -> Vec<ExtractionError> {
		std::mem::take(&mut self.failures)
	}
}
