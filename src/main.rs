use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::Level;
use vanopticon_bifrost::config::{self, Settings};
use vanopticon_bifrost::convert::{convert, export_devices};
use vanopticon_bifrost::export::BulkClient;
use vanopticon_bifrost::ingest::InputFormat;
use vanopticon_bifrost::monitor::Monitor;
use vanopticon_bifrost::observability::{LogHandle, MetricsRegistry, build_dispatch};
use vanopticon_bifrost::session::{Cancellation, ExportSession, SessionOptions};

const EXIT_CONFIG: u8 = 3;

#[derive(Parser)]
#[command(
	name = "bifrost",
	version,
	about = "Bifrost - ships Kismet databases and logs to a search datastore"
)]
struct Cli {
	#[command(flatten)]
	overrides: Overrides,

	#[command(subcommand)]
	command: Option<Commands>,
}

/// Flags layered over the configuration files and `BFR_*` variables.
#[derive(Args)]
struct Overrides {
	/// Extra configuration file, applied after the standard locations
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	/// Destination host; repeat for several
	#[arg(long = "host", global = true)]
	hosts: Vec<String>,
	#[arg(long, global = true)]
	username: Option<String>,
	#[arg(long, global = true, env = "BFR_PASSWORD", hide_env_values = true)]
	password: Option<String>,
	#[arg(long, global = true)]
	index_prefix: Option<String>,
	/// Device identity stamped on every document
	#[arg(long, global = true)]
	device_name: Option<String>,
	#[arg(long, global = true)]
	app_name: Option<String>,
	#[arg(long, value_enum, global = true)]
	format: Option<InputFormat>,
	#[arg(long, global = true)]
	batch_size: Option<usize>,
	/// Read at most this many rows per table
	#[arg(long, global = true)]
	table_row_limit: Option<u64>,
	/// Concurrent bulk requests per file
	#[arg(long, global = true)]
	workers: Option<usize>,
	/// Directory to scan; repeat for several
	#[arg(long = "source-dir", global = true)]
	source_dirs: Vec<PathBuf>,
	/// Only files whose name matches this regex
	#[arg(long, global = true)]
	include: Option<String>,
	#[arg(long, global = true)]
	max_retries: Option<u32>,
	/// Extract and batch, but send nothing
	#[arg(long, global = true)]
	dry_run: bool,
	/// Index a test document before extracting
	#[arg(long, global = true)]
	write_check: bool,
	/// Succeed when no sources are found
	#[arg(long, global = true)]
	allow_empty: bool,
	/// Verify the destination's TLS certificate
	#[arg(long, global = true)]
	verify_certs: bool,
	#[arg(long, global = true)]
	ca_cert: Option<PathBuf>,
	#[arg(long, global = true)]
	log_level: Option<Level>,
	#[arg(long, global = true)]
	log_file: Option<PathBuf>,
	/// Write Prometheus text metrics here when the run ends
	#[arg(long, global = true)]
	metrics_file: Option<PathBuf>,
}

impl Overrides {
	fn apply(self, s: &mut Settings) {
		if !self.hosts.is_empty() {
			s.hosts = self.hosts;
		}
		if !self.source_dirs.is_empty() {
			s.source_dirs = self.source_dirs;
		}
		if let Some(v) = self.username {
			s.username = v;
		}
		if let Some(v) = self.password {
			s.password = v;
		}
		if let Some(v) = self.index_prefix {
			s.index_prefix = v;
		}
		if let Some(v) = self.device_name {
			s.device_name = v;
		}
		if let Some(v) = self.app_name {
			s.app_name = v;
		}
		if let Some(v) = self.format {
			s.format = v;
		}
		if let Some(v) = self.batch_size {
			s.batch_size = v;
		}
		if let Some(v) = self.workers {
			s.workers = v;
		}
		if let Some(v) = self.max_retries {
			s.max_retries = v;
		}
		if let Some(v) = self.log_level {
			s.log_level = v;
		}
		if self.table_row_limit.is_some() {
			s.table_row_limit = self.table_row_limit;
		}
		if self.include.is_some() {
			s.include_pattern = self.include;
		}
		if self.ca_cert.is_some() {
			s.ca_cert = self.ca_cert;
		}
		if self.log_file.is_some() {
			s.log_file = self.log_file;
		}
		if self.metrics_file.is_some() {
			s.metrics_file = self.metrics_file;
		}
		s.dry_run |= self.dry_run;
		s.write_check |= self.write_check;
		s.allow_empty |= self.allow_empty;
		s.verify_certs |= self.verify_certs;
	}
}

#[derive(Subcommand)]
enum Commands {
	/// Discover sources and upload them (default)
	Upload,
	/// Convert one file to line-delimited JSON
	Convert {
		input: PathBuf,
		output: PathBuf,
	},
	/// Write a capture database's WiFi and Bluetooth devices to per-radio files
	ExportDevices {
		db: PathBuf,
		/// Defaults to the monitor's output directory
		#[arg(long)]
		output_dir: Option<PathBuf>,
	},
	/// Poll the scanner and append live devices to a session log
	Monitor {
		#[arg(long)]
		kismet_url: Option<String>,
		#[arg(long)]
		interval: Option<u64>,
		/// PHY name to keep, e.g. Bluetooth
		#[arg(long)]
		phy: Option<String>,
		#[arg(long)]
		output_dir: Option<PathBuf>,
	},
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	let command = cli.command.unwrap_or(Commands::Upload);

	let mut settings = match config::load_with(cli.overrides.config.as_deref()) {
		Ok(s) => s,
		Err(e) => {
			eprintln!("bifrost: {e}");
			return ExitCode::from(EXIT_CONFIG);
		}
	};
	cli.overrides.apply(&mut settings);
	if let Commands::Monitor {
		kismet_url,
		interval,
		phy,
		output_dir,
	} = &command
	{
		let m = &mut settings.monitor;
		if let Some(v) = kismet_url {
			m.kismet_url = v.clone();
		}
		if let Some(v) = interval {
			m.poll_interval_secs = *v;
		}
		if let Some(v) = phy {
			m.phy_filter = v.clone();
		}
		if let Some(v) = output_dir {
			m.output_dir = v.clone();
		}
	}
	if let Err(e) = settings.validate() {
		eprintln!("bifrost: {e}");
		return ExitCode::from(EXIT_CONFIG);
	}

	let log = match build_dispatch(settings.log_level, settings.log_file.as_deref()) {
		Ok(dispatch) => LogHandle::new(dispatch),
		Err(e) => {
			eprintln!("bifrost: cannot set up logging: {e}");
			return ExitCode::from(EXIT_CONFIG);
		}
	};

	let cancel = Cancellation::new();
	{
		let cancel = cancel.clone();
		let log = log.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				log.warn(format_args!("interrupted; finishing the current batch"));
				cancel.cancel();
			}
		});
	}

	let code = match command {
		Commands::Upload => upload(&settings, cancel, &log).await,
		Commands::Convert { input, output } => {
			match convert(
				&input,
				&output,
				settings.format,
				settings.source_context(),
				settings.table_row_limit,
				&log,
			) {
				Ok(report) if report.failures == 0 => 0,
				Ok(_) => 1,
				Err(e) => {
					log.error(format_args!("{e}"));
					1
				}
			}
		}
		Commands::ExportDevices { db, output_dir } => {
			let output_dir = output_dir.unwrap_or_else(|| settings.monitor.output_dir.clone());
			match export_devices(&db, &output_dir, &log) {
				Ok(_) => 0,
				Err(e) => {
					log.error(format_args!("{e}"));
					1
				}
			}
		}
		Commands::Monitor { .. } => match Monitor::new(&settings.monitor, log.clone()) {
			Ok(monitor) => match monitor.run(&cancel).await {
				Ok(_) => 0,
				Err(e) => {
					log.error(format_args!("{e}"));
					1
				}
			},
			Err(e) => {
				log.error(format_args!("{e}"));
				EXIT_CONFIG
			}
		},
	};
	log.flush();
	ExitCode::from(code)
}

async fn upload(settings: &Settings, cancel: Cancellation, log: &LogHandle) -> u8 {
	let options = match SessionOptions::from_settings(settings) {
		Ok(o) => o,
		Err(e) => {
			log.error(format_args!("{e}"));
			return EXIT_CONFIG;
		}
	};
	let mut session = ExportSession::new(options, settings.source_context(), log.clone())
		.with_metrics(Arc::new(MetricsRegistry::new()))
		.with_cancellation(cancel);

	if !settings.dry_run {
		match BulkClient::new(&settings.destination(), log.for_component("bifrost::export")) {
			Ok(client) => session = session.with_sink(Arc::new(client)),
			Err(e) => {
				log.error(format_args!("{e}"));
				return 1;
			}
		}
	}

	match session.run().await {
		Ok(report) => report.exit_code(),
		Err(e) => e.exit_code(),
	}
}
