//! Whole runs: fixture files on disk, the real bulk client, a mock
//! datastore. Also covers the device monitor against a mock scanner.

#[cfg(feature = "integration-tests")]
mod session_tests {
	use std::path::Path;
	use std::sync::Arc;

	use serde_json::{Value, json};
	use vanopticon_bifrost::config::MonitorSettings;
	use vanopticon_bifrost::export::{BulkClient, Credentials, Destination};
	use vanopticon_bifrost::ingest::SourceContext;
	use vanopticon_bifrost::monitor::Monitor;
	use vanopticon_bifrost::observability::{LogHandle, MetricsRegistry};
	use vanopticon_bifrost::session::{
		Cancellation, ExportSession, Scheduler, SessionOptions, SessionState,
	};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

	/// Accepts every document of every bulk request.
	struct AcceptAll;

	impl Respond for AcceptAll {
		fn respond(&self, req: &Request) -> ResponseTemplate {
			let body = String::from_utf8_lossy(&req.body);
			let docs = body.lines().filter(|l| !l.is_empty()).count() / 2;
			let items: Vec<Value> = (0..docs)
				.map(|_| json!({"index": {"_index": "x", "status": 201}}))
				.collect();
			ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": items}))
		}
	}

	fn write_kismet_db(path: &Path) {
		let conn = rusqlite::Connection::open(path).unwrap();
		conn.execute_batch(
			"CREATE TABLE devices (id INTEGER, name TEXT, raw BLOB);
			 INSERT INTO devices VALUES (1, 'Pixel', x'8081');
			 CREATE TABLE packets (ts TEXT, len INTEGER);
			 INSERT INTO packets VALUES ('1700000000', 64);
			 INSERT INTO packets VALUES ('1700000001', 128);",
		)
		.unwrap();
	}

	async fn destination_server(root_status: u16) -> MockServer {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/"))
			.respond_with(ResponseTemplate::new(root_status))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/_bulk"))
			.respond_with(AcceptAll)
			.mount(&server)
			.await;
		server
	}

	fn session_for(dir: &Path, server: &MockServer, opts: SessionOptions) -> ExportSession {
		let destination = Destination {
			hosts: vec![server.uri()],
			credentials: Credentials::None,
			..Destination::default()
		};
		let client = BulkClient::new(&destination, LogHandle::discard()).unwrap();
		ExportSession::new(
			SessionOptions {
				source_dirs: vec![dir.to_path_buf()],
				..opts
			},
			SourceContext::new("sensor-7", "kismet"),
			LogHandle::discard(),
		)
		.with_sink(Arc::new(client))
	}

	async fn bulk_bodies(server: &MockServer) -> Vec<String> {
		server
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.filter(|r| r.url.path() == "/_bulk")
			.map(|r| String::from_utf8_lossy(&r.body).into_owned())
			.collect()
	}

	#[tokio::test]
	async fn database_and_log_are_shipped() {
		let dir = tempfile::tempdir().unwrap();
		write_kismet_db(&dir.path().join("capture.kismet"));
		std::fs::write(dir.path().join("events.log"), "\n{\"a\":1}\nplain text\n").unwrap();

		let server = destination_server(200).await;
		let metrics = Arc::new(MetricsRegistry::new());
		let mut session = session_for(dir.path(), &server, SessionOptions::default())
			.with_metrics(Arc::clone(&metrics));
		let report = session.run().await.unwrap();

		assert_eq!(report.stats.files_processed, 2);
		assert_eq!(report.stats.documents_extracted, 5);
		assert_eq!(report.stats.documents_uploaded, 5);
		assert_eq!(report.stats.errors, 0);
		assert_eq!(report.stats.by_type["kismetdb_devices"], 1);
		assert_eq!(report.stats.by_type["kismetdb_packets"], 2);
		assert_eq!(report.stats.by_type["log"], 2);
		assert_eq!(report.exit_code(), 0);
		assert_eq!(metrics.documents_indexed_total.get(), 5);

		let bodies = bulk_bodies(&server).await.join("");
		let docs: Vec<Value> = bodies
			.lines()
			.map(|l| serde_json::from_str::<Value>(l).unwrap())
			.filter(|v| v.get("index").is_none())
			.collect();
		let pixel = docs.iter().find(|d| d["name"] == "Pixel").unwrap();
		assert_eq!(pixel["id"], 1);
		assert_eq!(pixel["raw"], "gIE=");
		assert_eq!(pixel["raw_type"], "base64_encoded");
		assert_eq!(pixel["source_table"], "devices");
		assert_eq!(pixel["device_name"], "sensor-7");
		assert_eq!(pixel["data_type"], "kismetdb");
		assert_eq!(pixel["log_type"], "kismet_db");

		let packet = docs.iter().find(|d| d["len"] == 128).unwrap();
		assert_eq!(packet["ts"], 1700000001);

		let plain = docs.iter().find(|d| d["raw_message"] == "plain text").unwrap();
		assert_eq!(plain["line_number"], 3);
		assert!(bodies.contains("\"_index\":\"kismet-kismetdb-"));
		assert!(bodies.contains("\"_index\":\"kismet-log-"));
	}

	#[tokio::test]
	async fn write_only_credential_proceeds_to_extraction() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("events.log"), "one\ntwo\n").unwrap();
		let server = destination_server(403).await;
		let mut session = session_for(dir.path(), &server, SessionOptions::default());
		let report = session.run().await.unwrap();
		assert_eq!(report.stats.documents_uploaded, 2);
		assert!(session.history().contains(&SessionState::ExtractingFile));
	}

	#[tokio::test]
	async fn unauthorized_halts_before_extraction() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("events.log"), "one\n").unwrap();
		let server = destination_server(401).await;
		let mut session = session_for(dir.path(), &server, SessionOptions::default());
		let err = session.run().await.unwrap_err();
		assert_eq!(err.exit_code(), 1);
		assert_eq!(session.state(), SessionState::ConnectFailed);
		assert!(bulk_bodies(&server).await.is_empty());
	}

	#[tokio::test]
	async fn dry_run_sends_nothing() {
		let dir = tempfile::tempdir().unwrap();
		write_kismet_db(&dir.path().join("capture.kismet"));
		let server = destination_server(200).await;
		let opts = SessionOptions {
			dry_run: true,
			..SessionOptions::default()
		};
		let report = session_for(dir.path(), &server, opts).run().await.unwrap();
		assert_eq!(report.stats.documents_extracted, 3);
		assert_eq!(report.stats.documents_uploaded, 0);
		assert!(server.received_requests().await.unwrap_or_default().is_empty());
	}

	#[tokio::test]
	async fn concurrent_batches_all_arrive() {
		let dir = tempfile::tempdir().unwrap();
		let lines: String = (0..40).map(|i| format!("event {i}\n")).collect();
		std::fs::write(dir.path().join("events.log"), lines).unwrap();
		let server = destination_server(200).await;
		let opts = SessionOptions {
			batch_size: 7,
			scheduler: Scheduler::Concurrent { workers: 3 },
			..SessionOptions::default()
		};
		let report = session_for(dir.path(), &server, opts).run().await.unwrap();
		assert_eq!(report.stats.documents_uploaded, 40);
		assert_eq!(report.stats.batches_sent, 6);
		assert_eq!(bulk_bodies(&server).await.len(), 6);
	}

	#[tokio::test]
	async fn monitor_appends_filtered_devices() {
		let scanner = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/devices/views/all/devices.json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([
				{
					"kismet.device.base.phyname": "Bluetooth",
					"kismet.device.base.macaddr": "AA:BB:CC:DD:EE:01",
					"kismet.device.base.signal": {"kismet.common.signal.last_signal": -70},
					"kismet.device.base.freq_vec": [1, 2]
				},
				{
					"kismet.device.base.phyname": "IEEE802.11",
					"kismet.device.base.macaddr": "AA:BB:CC:DD:EE:02"
				}
			])))
			.mount(&scanner)
			.await;

		let out = tempfile::tempdir().unwrap();
		let settings = MonitorSettings {
			kismet_url: scanner.uri(),
			poll_interval_secs: 1,
			output_dir: out.path().to_path_buf(),
			..MonitorSettings::default()
		};
		let monitor = Monitor::new(&settings, LogHandle::discard())
			.unwrap()
			.with_max_cycles(2);
		let report = monitor.run(&Cancellation::new()).await.unwrap();
		assert_eq!(report.records_written, 2);
		assert!(report.output.ends_with("bluetooth.devices.json"));

		let text = std::fs::read_to_string(&report.output).unwrap();
		let records: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
		assert_eq!(records.len(), 2);
		assert_eq!(records[0]["mac_address"], "AA:BB:CC:DD:EE:01");
		assert_eq!(records[0]["signal_dbm"], -70);
		assert_eq!(
			records[0]["raw_device"]["kismet.device.base.freq_vec"].to_string(),
			"[1.0,2.0]"
		);
	}
}
