use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// Line-delimited JSON output, one value per line, UTF-8.
///
/// The underlying file is opened once; long-running writers keep the same
/// handle across cycles and flush after each one.
pub struct NdjsonWriter<W: Write> {
	out: BufWriter<W>,
	written: u64,
}

impl NdjsonWriter<File> {
	/// Truncate or create `path`.
	pub fn create(path: &Path) -> io::Result<Self> {
		ensure_parent(path)?;
		Ok(Self::new(File::create(path)?))
	}

	/// Append to `path`, creating it and its parent directories as needed.
	pub fn append(path: &Path) -> io::Result<Self> {
		ensure_parent(path)?;
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(Self::new(file))
	}
}

impl<W: Write> NdjsonWriter<W> {
	pub fn new(inner: W) -> Self {
		Self {
			out: BufWriter::new(inner),
			written: 0,
		}
	}

	pub fn write<T: Serialize>(&mut self, item: &T) -> io::Result<()> {
		serde_json::to_writer(&mut self.out, item)?;
		self.out.write_all(b"\n")?;
		self.written += 1;
		Ok(())
	}

	pub fn flush(&mut self) -> io::Result<()> {
		self.out.flush()
	}

	/// Lines written through this writer.
	pub fn written(&self) -> u64 {
		self.written
	}

	pub fn into_inner(self) -> io::Result<W> {
		self.out.into_inner().map_err(|e| e.into_error())
	}
}

fn ensure_parent(path: &Path) -> io::Result<()> {
	match path.parent() {
		Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
		_ => Ok(()),
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn one_value_per_line() {
		let mut w = NdjsonWriter::new(Vec::new());
		w.write(&json!({"a": 1})).unwrap();
		w.write(&json!({"b": "two"})).unwrap();
		assert_eq!(w.written(), 2);
		let bytes = w.into_inner().unwrap();
		assert_eq!(String::from_utf8(bytes).unwrap(), "{\"a\":1}\n{\"b\":\"two\"}\n");
	}

	#[test]
	fn append_keeps_existing_lines() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested/out.json");
		{
			let mut w = NdjsonWriter::append(&path).unwrap();
			w.write(&json!(1)).unwrap();
			w.flush().unwrap();
		}
		{
			let mut w = NdjsonWriter::append(&path).unwrap();
			w.write(&json!(2)).unwrap();
			w.flush().unwrap();
		}
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n");
	}
}
