//! Jaffle Pipeline
//!
//! Extracts paginated REST resources and loads them into a local dataset

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod etl;
pub mod resource;
pub mod storage;

// Re-exports for convenience
pub use client::{Auth, RestClient};
pub use config::{Destination, PipelineConfig};
pub use error::{ErrorKind, ExtractError, FetchError, WriteError};
pub use etl::{
    Coordinator, Fetcher, HttpFetcher, LoadBatch, PageNumberPaginator, Paginator,
    ResourceExtractor, Run, RunTrace, Sink,
};
pub use resource::{ResourceDefinition, ResourcesManifest, WritePolicy};
pub use storage::{DatasetReader, DatasetWriter, MemorySink, NdjsonReader, NdjsonWriter};
#[cfg(feature = "duckdb")]
pub use storage::DuckDbSink;
