//! Sink trait for loading page batches to a destination

use super::paginate::Record;
use crate::error::WriteError;
use crate::resource::{ResourceDefinition, WritePolicy};

/// One page worth of records on its way to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBatch {
    pub resource_name: String,
    pub page_number: u32,
    pub records: Vec<Record>,
    pub write_policy: WritePolicy,
}

impl LoadBatch {
    pub fn new(resource: &ResourceDefinition, page_number: u32, records: Vec<Record>) -> Self {
        Self {
            resource_name: resource.name.clone(),
            page_number,
            records,
            write_policy: resource.write_policy,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Sink trait for persisting batches, one table per resource
///
/// For each resource the coordinator calls `open`, then `write` once per
/// batch in page order, then `close`. Different tables may be written
/// concurrently; a single table only ever has one writer.
///
/// REPLACE tables are truncated before the first batch of a run. If a run
/// succeeds without any batch, `close` truncates so the table ends empty.
///
/// # Example
/// ```no_run
/// use jaffle_pipeline::error::WriteError;
/// use jaffle_pipeline::etl::{LoadBatch, Sink};
/// use jaffle_pipeline::resource::ResourceDefinition;
///
/// struct CountingSink;
///
/// impl Sink for CountingSink {
///     async fn open(&self, _resource: &ResourceDefinition) -> Result<(), WriteError> {
///         Ok(())
///     }
///
///     async fn write(&self, batch: LoadBatch) -> Result<usize, WriteError> {
///         Ok(batch.len())
///     }
///
///     async fn close(&self, _table: &str, _succeeded: bool) -> Result<(), WriteError> {
///         Ok(())
///     }
/// }
/// ```
pub trait Sink: Send + Sync + 'static {
    /// Prepare the resource's table for a new run
    fn open(
        &self,
        resource: &ResourceDefinition,
    ) -> impl std::future::Future<Output = Result<(), WriteError>> + Send;

    /// Persist one batch, returning the number of records written
    fn write(
        &self,
        batch: LoadBatch,
    ) -> impl std::future::Future<Output = Result<usize, WriteError>> + Send;

    /// Flush buffered records and finish the table's run
    fn close(
        &self,
        table: &str,
        succeeded: bool,
    ) -> impl std::future::Future<Output = Result<(), WriteError>> + Send;
}
