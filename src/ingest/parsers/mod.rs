pub mod compressed;
pub mod csv;
pub mod lines;
pub mod sqlite;

use std::path::Path;

pub use self::csv::CsvExtractor;
pub use lines::{LineExtractor, line_document};
pub use sqlite::SqliteExtractor;

/// File name recorded as `source_file`.
pub(crate) fn basename(path: &Path) -> String {
	path.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_else(|| path.display().to_string())
}
