use std::path::Path;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags};

use crate::ingest::document::{Document, Origin, SourceContext};
use crate::ingest::format_detection::SourceKind;
use crate::ingest::{ExtractionError, Extractor};
use crate::normalizers::RawValue;
use crate::observability::LogHandle;

/// Rows of one table, fully read before any of them is normalized.
struct TableRows {
	name: String,
	columns: Vec<String>,
	rows: std::vec::IntoIter<Vec<SqlValue>>,
}

/// Streams one document per row across every table of a SQLite database.
///
/// Each table is read with a single query into memory, then its rows are
/// turned into documents lazily as the iterator is pulled. A table that
/// cannot be read is logged, recorded in [`Extractor::take_failures`] and
/// skipped.
pub struct SqliteExtractor {
	conn: Connection,
	path: String,
	source_file: String,
	kind: SourceKind,
	ctx: SourceContext,
	row_limit: Option<u64>,
	tables: std::vec::IntoIter<String>,
	current: Option<TableRows>,
	failures: Vec<ExtractionError>,
	log: LogHandle,
}

impl SqliteExtractor {
	/// Open `path` read-only and list its tables. Failure here is fatal for
	/// this source only.
	pub fn open(
		path: &Path,
		kind: SourceKind,
		ctx: SourceContext,
		row_limit: Option<u64>,
		log: LogHandle,
	) -> Result<Self, ExtractionError> {
		let display = path.display().to_string();
		let conn = Connection::open_with_flags(
			path,
			OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
		)
		.map_err(|source| ExtractionError::Open {
			path: display.clone(),
			source,
		})?;
		let tables = list_tables(&conn).map_err(|source| ExtractionError::Catalog {
			path: display.clone(),
			source,
		})?;

		log.debug(format_args!("{display}: {} tables", tables.len()));

		Ok(Self {
			conn,
			source_file: super::basename(path),
			path: display,
			kind,
			ctx,
			row_limit,
			tables: tables.into_iter(),
			current: None,
			failures: Vec::new(),
			log,
		})
	}
}

impl Iterator for SqliteExtractor {
	type Item = Document;

	fn next(&mut self) -> Option<Document> {
		loop {
			if let Some(table) = &mut self.current {
				if let Some(row) = table.rows.next() {
					let mut doc =
						self.ctx
							.seed(&self.source_file, self.kind, Origin::Table(&table.name));
					for (column, value) in table.columns.iter().zip(row.iter()) {
						doc.insert_raw(column, RawValue::from(value));
					}
					return Some(doc);
				}
				self.current = None;
			}

			let name = self.tables.next()?;
			match read_table(&self.conn, &name, self.row_limit) {
				Ok(rows) => {
					self.log.debug(format_args!(
						"{}: table {name} yielded {} rows",
						self.path,
						rows.rows.len()
					));
					self.current = Some(rows);
				}
				Err(source) => {
					self.log.warn(format_args!(
						"{}: skipping table {name}: {source}",
						self.path
					));
					self.failures.push(ExtractionError::Table {
						path: self.path.clone(),
						table: name,
						source,
					});
				}
			}
		}
	}
}

impl Extractor for SqliteExtractor {
	fn source_kind(&self) -> SourceKind {
		self.kind
	}

	fn take_failures(&mut self) -> Vec<ExtractionError> {
		std::mem::take(&mut self.failures)
	}
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
	let mut stmt = conn.prepare(
		"SELECT name FROM sqlite_master \
		 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
		 ORDER BY name",
	)?;
	let names = stmt
		.query_map([], |row| row.get::<_, String>(0))?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	Ok(names)
}

fn quote_ident(name: &str) -> String {
	format!("\"{}\"", name.replace('"', "\"\""))
}

fn read_table(conn: &Connection, table: &str, limit: Option<u64>) -> rusqlite::Result<TableRows> {
	let sql = match limit {
		Some(n) => format!("SELECT * FROM {} LIMIT {n}", quote_ident(table)),
		None => format!("SELECT * FROM {}", quote_ident(table)),
	};
	let mut stmt = conn.prepare(&sql)?;
	let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
	let width = columns.len();

	let rows = stmt
		.query_map([], move |row| {
			(0..width)
				.map(|i| row.get_ref(i).map(owned))
				.collect::<rusqlite::Result<Vec<_>>>()
		})?
		.collect::<rusqlite::Result<Vec<_>>>()?;

	Ok(TableRows {
		name: table.to_owned(),
		columns,
		rows: rows.into_iter(),
	})
}

/// Copy a borrowed cell out of the row. TEXT that is not valid UTF-8 is
/// carried as a blob so the normalizer can re-encode it.
fn owned(value: ValueRef<'_>) -> SqlValue {
	match value {
		ValueRef::Null => SqlValue::Null,
		ValueRef::Integer(i) => SqlValue::Integer(i),
		ValueRef::Real(f) => SqlValue::Real(f),
		ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
			Ok(s) => SqlValue::Text(s.to_owned()),
			Err(_) => SqlValue::Blob(bytes.to_vec()),
		},
		ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
	}
}
