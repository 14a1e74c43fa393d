use std::fmt;
use std::path::Path;
use std::sync::Arc;

use fern::colors::{Color, ColoredLevelConfig};
use log::{Level, LevelFilter, Log, Record};

/// Cloneable logging handle held by every pipeline component.
///
/// The handle owns the `log::Log` produced by a `fern::Dispatch`, so nothing
/// is installed as the process-wide logger. Each component stamps records
/// with its own target.
#[derive(Clone)]
pub struct LogHandle {
	sink: Arc<dyn Log>,
	level: LevelFilter,
	target: &'static str,
}

impl LogHandle {
	/// Wrap a configured dispatch.
	pub fn new(dispatch: fern::Dispatch) -> Self {
		let (level, sink) = dispatch.into_log();
		Self {
			sink: Arc::from(sink),
			level,
			target: "bifrost",
		}
	}

	/// A handle that drops everything. Handy for tests and library callers
	/// that do not care about diagnostics.
	pub fn discard() -> Self {
		Self::new(fern::Dispatch::new().level(LevelFilter::Off))
	}

	/// Same sink, different target.
	pub fn for_component(&self, target: &'static str) -> Self {
		Self {
			sink: Arc::clone(&self.sink),
			level: self.level,
			target,
		}
	}

	pub fn enabled(&self, level: Level) -> bool {
		level <= self.level
	}

	pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
		if !self.enabled(level) {
			return;
		}
		self.sink.log(
			&Record::builder()
				.args(args)
				.level(level)
				.target(self.target)
				.build(),
		);
	}

	pub fn error(&self, args: fmt::Arguments<'_>) {
		self.log(Level::Error, args);
	}

	pub fn warn(&self, args: fmt::Arguments<'_>) {
		self.log(Level::Warn, args);
	}

	pub fn info(&self, args: fmt::Arguments<'_>) {
		self.log(Level::Info, args);
	}

	pub fn debug(&self, args: fmt::Arguments<'_>) {
		self.log(Level::Debug, args);
	}

	pub fn flush(&self) {
		self.sink.flush();
	}
}

impl fmt::Debug for LogHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LogHandle")
			.field("level", &self.level)
			.field("target", &self.target)
			.finish()
	}
}

/// Build the dispatch used by the binary: colored records on stderr and,
/// when `log_file` is set, plain records appended to that file.
pub fn build_dispatch(level: Level, log_file: Option<&Path>) -> anyhow::Result<fern::Dispatch> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	let console = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.chain(std::io::stderr());

	let mut root = fern::Dispatch::new()
		.level(level.to_level_filter())
		.chain(console);

	if let Some(path) = log_file {
		let file = fern::Dispatch::new()
			.format(|out, message, record| {
				out.finish(format_args!(
					"{} {:<5} [{}] {}",
					chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
					record.level(),
					record.target(),
					message
				))
			})
			.chain(fern::log_file(path)?);
		root = root.chain(file);
	}

	Ok(root)
}
