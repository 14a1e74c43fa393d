pub mod logging;
pub mod metrics;

pub use logging::{LogHandle, build_dispatch};
pub use metrics::MetricsRegistry;
