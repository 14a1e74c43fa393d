pub mod batcher;
pub mod ndjson_sink;

pub use batcher::{Batch, Batches, batch};
pub use ndjson_sink::NdjsonWriter;
