use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;

/// Open `path` for buffered reading, transparently inflating gzip when
/// `compressed` is set. Concatenated gzip members (rotated logs glued
/// together) are read through to the end.
pub fn open_source(path: &Path, compressed: bool) -> io::Result<Box<dyn BufRead + Send>> {
	let file = File::open(path)?;
	Ok(wrap(file, compressed))
}

pub fn wrap<R: Read + Send + 'static>(reader: R, compressed: bool) -> Box<dyn BufRead + Send> {
	if compressed {
		Box::new(BufReader::new(MultiGzDecoder::new(reader)))
	} else {
		Box::new(BufReader::new(reader))
	}
}

/// Read up to `n` leading bytes for format sniffing.
pub fn peek_file(path: &Path, n: usize) -> io::Result<Vec<u8>> {
	let mut buf = Vec::with_capacity(n);
	File::open(path)?.take(n as u64).read_to_end(&mut buf)?;
	Ok(buf)
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::io::{Cursor, Write};

	use flate2::Compression;
	use flate2::write::GzEncoder;

	use super::*;

	fn gz(data: &[u8]) -> Vec<u8> {
		let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
		encoder.write_all(data).unwrap();
		encoder.finish().unwrap()
	}

	#[test]
	fn inflates_gzip() {
		let mut out = String::new();
		wrap(Cursor::new(gz(b"Hello, World!\n")), true)
			.read_to_string(&mut out)
			.unwrap();
		assert_eq!(out, "Hello, World!\n");
	}

	#[test]
	fn reads_concatenated_members() {
		let mut data = gz(b"one\n");
		data.extend(gz(b"two\n"));
		let lines: Vec<String> = wrap(Cursor::new(data), true)
			.lines()
			.map(Result::unwrap)
			.collect();
		assert_eq!(lines, vec!["one", "two"]);
	}

	#[test]
	fn peek_is_bounded() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"0123456789").unwrap();
		assert_eq!(peek_file(&path, 4).unwrap(), b"0123");
	}
}
