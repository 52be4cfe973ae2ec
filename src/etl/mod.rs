//! Core extraction and load abstractions
//!
//! This module provides the building blocks of a paginated pipeline: a
//! fetcher retrieves one page, a paginator decides the next page, an
//! extractor turns one resource into a stream of page batches, and the
//! coordinator runs extractors concurrently into a sink.

mod extract;
mod fetch;
mod load;
mod paginate;
mod pipeline;
mod retry;
mod trace;

pub use extract::ResourceExtractor;
pub use fetch::{Fetcher, HttpFetcher, classify_status, decode_records};
pub use load::{LoadBatch, Sink};
pub use paginate::{PageNumberPaginator, PageRequest, PageResponse, PageStep, Paginator, Record};
pub use pipeline::{Coordinator, Run};
pub use retry::RetryPolicy;
pub use trace::{ResourceStatus, ResourceTrace, RunOutcome, RunTrace};
