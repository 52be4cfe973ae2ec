//! Destination storage
//!
//! This module handles everything the loader persists:
//! - NDJSON file reading/writing
//! - Directory-backed datasets with buffering and file rotation
//! - An in-memory sink
//! - A DuckDB database (with the `duckdb` feature)

mod dataset;
#[cfg(feature = "duckdb")]
mod database;
mod memory;
mod ndjson;

pub use dataset::{DatasetReader, DatasetWriter, TRACE_FILE};
#[cfg(feature = "duckdb")]
pub use database::DuckDbSink;
pub use memory::MemorySink;
pub use ndjson::{NdjsonReader, NdjsonWriter};
