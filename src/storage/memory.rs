//! In-memory sink

use crate::error::WriteError;
use crate::etl::{LoadBatch, Record, Sink};
use crate::resource::{ResourceDefinition, WritePolicy};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryTable {
    records: Vec<Record>,
    pending_truncate: bool,
}

/// Sink keeping every table in memory
///
/// Useful for embedding the pipeline and for tests. Follows the same
/// APPEND/REPLACE rules as [`DatasetWriter`](super::DatasetWriter).
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of a table in arrival order; empty if the table is unknown
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.lock()
            .get(table)
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    /// Table names, sorted
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_table(&self, resource: &ResourceDefinition) {
        self.lock()
            .entry(resource.name.clone())
            .or_default()
            .pending_truncate = resource.write_policy == WritePolicy::Replace;
    }

    fn append(&self, batch: LoadBatch) -> usize {
        let mut tables = self.lock();
        let table = tables.entry(batch.resource_name).or_default();
        if table.pending_truncate {
            table.records.clear();
            table.pending_truncate = false;
        }
        let count = batch.records.len();
        table.records.extend(batch.records);
        count
    }

    fn close_table(&self, table: &str, succeeded: bool) {
        if let Some(table) = self.lock().get_mut(table)
            && table.pending_truncate
        {
            if succeeded {
                table.records.clear();
            }
            table.pending_truncate = false;
        }
    }
}

impl Sink for MemorySink {
    async fn open(&self, resource: &ResourceDefinition) -> Result<(), WriteError> {
        self.open_table(resource);
        Ok(())
    }

    async fn write(&self, batch: LoadBatch) -> Result<usize, WriteError> {
        Ok(self.append(batch))
    }

    async fn close(&self, table: &str, succeeded: bool) -> Result<(), WriteError> {
        self.close_table(table, succeeded);
        Ok(())
    }
}
