use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

/// Prometheus counters for one process.
pub struct MetricsRegistry {
	registry: Registry,

	pub files_processed_total: IntCounter,
	pub bulk_requests_total: IntCounter,
	pub documents_indexed_total: IntCounter,
	pub document_failures_total: IntCounter,
	pub batch_failures_total: IntCounter,
	pub bulk_latency_ms: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
	let c = IntCounter::with_opts(Opts::new(name, help).namespace("bifrost"))
		.expect("static counter definition is valid");
	registry
		.register(Box::new(c.clone()))
		.expect("counter names are unique");
	c
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let files_processed_total = counter(
			&registry,
			"files_processed_total",
			"Source files taken through extraction",
		);
		let bulk_requests_total = counter(
			&registry,
			"bulk_requests_total",
			"Bulk requests sent to the destination",
		);
		let documents_indexed_total = counter(
			&registry,
			"documents_indexed_total",
			"Documents acknowledged with status 200 or 201",
		);
		let document_failures_total = counter(
			&registry,
			"document_failures_total",
			"Documents rejected item-by-item inside a bulk response",
		);
		let batch_failures_total = counter(
			&registry,
			"batch_failures_total",
			"Whole batches lost to transport errors or top-level rejections",
		);

		let bulk_latency_ms = Histogram::with_opts(
			HistogramOpts::new("bulk_latency_ms", "Bulk request round trip in milliseconds")
				.namespace("bifrost")
				.buckets(vec![5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0]),
		)
		.expect("static histogram definition is valid");
		registry
			.register(Box::new(bulk_latency_ms.clone()))
			.expect("histogram name is unique");

		Self {
			registry,
			files_processed_total,
			bulk_requests_total,
			documents_indexed_total,
			document_failures_total,
			batch_failures_total,
			bulk_latency_ms,
		}
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		encoder.encode_to_string(&metric_families).unwrap_or_default()
	}

	/// Write the text exposition to `path` (node_exporter textfile style).
	pub fn write_to(&self, path: &std::path::Path) -> std::io::Result<()> {
		std::fs::write(path, self.encode())
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}
