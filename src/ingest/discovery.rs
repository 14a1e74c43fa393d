use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::ingest::format_detection::{self, InputFormat, LineFormat, SourceKind};
use crate::ingest::parsers::compressed;
use crate::observability::LogHandle;

const PEEK_LEN: usize = 512;

/// One input, classified and ready for its extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
	pub path: PathBuf,
	pub kind: SourceKind,
	pub line_format: LineFormat,
	pub compressed: bool,
}

impl SourceDescriptor {
	/// Classify a single file. `Ok(None)` means no extractor handles it.
	pub fn from_path(path: &Path, format: InputFormat) -> io::Result<Option<Self>> {
		let peek = compressed::peek_file(path, PEEK_LEN)?;
		Ok(
			format_detection::detect_source(path, &peek, format).map(|d| Self {
				path: path.to_path_buf(),
				kind: d.kind,
				line_format: d.line_format,
				compressed: d.compressed,
			}),
		)
	}
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(dir: &Path) -> PathBuf {
	match dir.strip_prefix("~") {
		Ok(rest) => match dirs::home_dir() {
			Some(home) => home.join(rest),
			None => dir.to_path_buf(),
		},
		Err(_) => dir.to_path_buf(),
	}
}

/// Scan each directory (not recursively) for sources.
///
/// Missing or unreadable directories and unclassifiable files are logged
/// and skipped. The same file reached through two directories is returned
/// once; the result is sorted by path.
pub fn discover(
	dirs: &[PathBuf],
	format: InputFormat,
	include: Option<&Regex>,
	log: &LogHandle,
) -> Vec<SourceDescriptor> {
	let mut found: BTreeMap<PathBuf, SourceDescriptor> = BTreeMap::new();

	for dir in dirs {
		let dir = expand_home(dir);
		let entries = match std::fs::read_dir(&dir) {
			Ok(entries) => entries,
			Err(e) => {
				log.warn(format_args!("skipping directory {}: {e}", dir.display()));
				continue;
			}
		};

		for entry in entries.flatten() {
			let path = entry.path();
			if !path.is_file() {
				continue;
			}
			if let Some(re) = include {
				let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
				if !re.is_match(&name) {
					continue;
				}
			}

			let key = path.canonicalize().unwrap_or_else(|_| path.clone());
			if found.contains_key(&key) {
				continue;
			}

			match SourceDescriptor::from_path(&path, format) {
				Ok(Some(source)) => {
					log.debug(format_args!(
						"found {} ({})",
						path.display(),
						source.kind.data_type()
					));
					found.insert(key, source);
				}
				Ok(None) => {
					log.debug(format_args!("ignoring {}", path.display()));
				}
				Err(e) => {
					log.warn(format_args!("cannot inspect {}: {e}", path.display()));
				}
			}
		}
	}

	found.into_values().collect()
}
