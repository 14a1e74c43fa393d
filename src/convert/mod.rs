//! Offline conversion: one input file to a line-delimited JSON artifact a
//! log shipper can tail.

pub mod devices;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ingest::{self, ExtractionError, InputFormat, SourceContext, SourceDescriptor};
use crate::observability::LogHandle;
use crate::persist::NdjsonWriter;

pub use devices::{DeviceExportReport, export_devices};

#[derive(Debug, Error)]
pub enum ConvertError {
	#[error("cannot read {path}: {source}")]
	Input {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("{0}: not a recognized input (database, line log or csv)")]
	Unrecognized(PathBuf),

	#[error(transparent)]
	Extraction(#[from] ExtractionError),

	#[error("{path}: {source}")]
	Database {
		path: PathBuf,
		#[source]
		source: rusqlite::Error,
	},

	#[error("cannot write {path}: {source}")]
	Output {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertReport {
	pub documents: u64,
	/// Tables, rows or lines that could not be read.
	pub failures: usize,
}

/// Extract `input` and write every document to `output`, replacing it.
pub fn convert(
	input: &Path,
	output: &Path,
	format: InputFormat,
	ctx: SourceContext,
	table_row_limit: Option<u64>,
	log: &LogHandle,
) -> Result<ConvertReport, ConvertError> {
	let source = SourceDescriptor::from_path(input, format)
		.map_err(|source| ConvertError::Input {
			path: input.to_path_buf(),
			source,
		})?
		.ok_or_else(|| ConvertError::Unrecognized(input.to_path_buf()))?;

	log.info(format_args!(
		"converting {} ({}) to {}",
		input.display(),
		source.kind.data_type(),
		output.display()
	));

	let mut extractor = ingest::open_extractor(
		&source,
		ctx,
		table_row_limit,
		log.for_component("bifrost::ingest"),
	)?;
	let write_err = |source| ConvertError::Output {
		path: output.to_path_buf(),
		source,
	};

	let mut writer = NdjsonWriter::create(output).map_err(write_err)?;
	for doc in extractor.by_ref() {
		writer.write(&doc).map_err(write_err)?;
	}
	writer.flush().map_err(write_err)?;

	let failures = extractor.take_failures();
	for failure in &failures {
		log.warn(format_args!("{failure}"));
	}
	let report = ConvertReport {
		documents: writer.written(),
		failures: failures.len(),
	};
	log.info(format_args!(
		"wrote {} documents to {} ({} failures)",
		report.documents,
		output.display(),
		report.failures
	));
	Ok(report)
}
