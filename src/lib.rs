//! Bifrost: ships Kismet capture databases and logs to a bulk-indexing
//! search datastore, converts them offline to NDJSON, and logs live devices.

pub mod config;
pub mod convert;
pub mod export;
pub mod ingest;
pub mod monitor;
pub mod normalizers;
pub mod observability;
pub mod persist;
pub mod session;
pub mod tls_utils;
