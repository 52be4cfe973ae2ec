//! Directory-backed dataset: one sub-directory of NDJSON files per table
//!
//! Layout:
//! ```text
//! <destination_dir>/<dataset_name>/
//!     _trace.json
//!     customers/00000.ndjson
//!     customers/00001.ndjson
//!     products/00000.ndjson
//! ```
//!
//! Records are buffered in memory per table and flushed once the buffer
//! reaches `buffer_max_items`, or when the table is closed. Data files rotate
//! after `file_max_items` records.

use super::ndjson::{NdjsonReader, NdjsonWriter};
use crate::config::PipelineConfig;
use crate::error::WriteError;
use crate::etl::{LoadBatch, Record, RunTrace, Sink};
use crate::resource::{ResourceDefinition, WritePolicy, is_valid_table_name};

use eyre::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// File name of the persisted trace of the last run
pub const TRACE_FILE: &str = "_trace.json";

const DATA_EXTENSION: &str = "ndjson";

/// Sink writing tables into a dataset directory
///
/// Each table has its own lock, so different tables load concurrently.
pub struct DatasetWriter {
    root: PathBuf,
    file_max_items: usize,
    buffer_max_items: usize,
    tables: Mutex<HashMap<String, Arc<tokio::sync::Mutex<TableWriter>>>>,
}

impl DatasetWriter {
    pub fn new(
        root: impl AsRef<Path>,
        file_max_items: usize,
        buffer_max_items: usize,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create dataset directory: {}", root.display()))?;

        Ok(Self {
            root,
            file_max_items: file_max_items.max(1),
            buffer_max_items: buffer_max_items.max(1),
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.dataset_dir(),
            config.file_max_items,
            config.buffer_max_items,
        )
    }

    /// Get the dataset directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open_table(
        &self,
        name: &str,
        write_policy: WritePolicy,
    ) -> Result<Arc<tokio::sync::Mutex<TableWriter>>, WriteError> {
        if !is_valid_table_name(name) {
            return Err(WriteError::new(
                name,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "table name must be a single path component",
                ),
            ));
        }

        let table = TableWriter::open(
            name,
            self.root.join(name),
            self.file_max_items,
            self.buffer_max_items,
            write_policy == WritePolicy::Replace,
        )
        .map_err(|e| WriteError::new(name, e))?;

        let table = Arc::new(tokio::sync::Mutex::new(table));
        self.lock_tables()
            .insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    fn table(&self, name: &str) -> Option<Arc<tokio::sync::Mutex<TableWriter>>> {
        self.lock_tables().get(name).cloned()
    }

    fn lock_tables(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<TableWriter>>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sink for DatasetWriter {
    async fn open(&self, resource: &ResourceDefinition) -> Result<(), WriteError> {
        self.open_table(&resource.name, resource.write_policy)?;
        log::debug!(
            "Opened table '{}' ({}) in {}",
            resource.name,
            resource.write_policy,
            self.root.display()
        );
        Ok(())
    }

    async fn write(&self, batch: LoadBatch) -> Result<usize, WriteError> {
        let LoadBatch {
            resource_name,
            records,
            write_policy,
            ..
        } = batch;

        let table = match self.table(&resource_name) {
            Some(table) => table,
            None => self.open_table(&resource_name, write_policy)?,
        };

        let mut table = table.lock().await;
        table
            .push(records)
            .map_err(|e| WriteError::new(&resource_name, e))
    }

    async fn close(&self, table: &str, succeeded: bool) -> Result<(), WriteError> {
        let writer = self.lock_tables().remove(table);
        let Some(writer) = writer else {
            return Ok(());
        };

        let mut writer = writer.lock().await;
        writer
            .close(succeeded)
            .map_err(|e| WriteError::new(table, e))?;

        log::debug!("Closed table '{}'", table);
        Ok(())
    }
}

/// Buffered, rotating writer for one table directory
struct TableWriter {
    name: String,
    dir: PathBuf,
    file_max_items: usize,
    buffer_max_items: usize,
    buffer: Vec<Record>,
    /// Truncate before the first batch of this run
    pending_truncate: bool,
    file_index: u32,
    file_items: usize,
}

impl TableWriter {
    fn open(
        name: &str,
        dir: PathBuf,
        file_max_items: usize,
        buffer_max_items: usize,
        replace: bool,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;

        // Appends continue in the newest file
        let (file_index, file_items) = match data_files(&dir)?.pop() {
            Some((index, path)) => (index, NdjsonReader::new(path).count()?),
            None => (0, 0),
        };

        Ok(Self {
            name: name.to_string(),
            dir,
            file_max_items,
            buffer_max_items,
            buffer: Vec::new(),
            pending_truncate: replace,
            file_index,
            file_items,
        })
    }

    fn push(&mut self, records: Vec<Record>) -> std::io::Result<usize> {
        if self.pending_truncate {
            self.truncate()?;
        }

        let count = records.len();
        self.buffer.extend(records);

        if self.buffer.len() >= self.buffer_max_items {
            self.flush()?;
        }

        Ok(count)
    }

    fn close(&mut self, succeeded: bool) -> std::io::Result<()> {
        // A successful REPLACE run without batches leaves the table empty
        if succeeded && self.pending_truncate {
            self.truncate()?;
        }
        self.flush()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        log::debug!("Truncating table '{}'", self.name);
        for (_, path) in data_files(&self.dir)? {
            std::fs::remove_file(path)?;
        }
        self.buffer.clear();
        self.file_index = 0;
        self.file_items = 0;
        self.pending_truncate = false;
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let records = std::mem::take(&mut self.buffer);
        let mut rest = records.as_slice();

        while !rest.is_empty() {
            if self.file_items >= self.file_max_items {
                self.file_index += 1;
                self.file_items = 0;
            }

            let room = self.file_max_items - self.file_items;
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            NdjsonWriter::new(self.file_path(self.file_index)).append(chunk)?;
            self.file_items += chunk.len();
            rest = tail;
        }

        log::trace!(
            "Flushed {} record(s) to table '{}'",
            records.len(),
            self.name
        );
        Ok(())
    }

    fn file_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{:05}.{}", index, DATA_EXTENSION))
    }
}

/// Data files of a table directory, sorted by index
fn data_files(dir: &Path) -> std::io::Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) == Some(DATA_EXTENSION)
            && let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
        {
            files.push((index, path));
        }
    }

    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

/// Read tables back from a dataset directory
pub struct DatasetReader {
    root: PathBuf,
}

impl DatasetReader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.dataset_dir())
    }

    /// List table names, sorted
    pub fn tables(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut tables = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir()
                && let Some(name) = path.file_name().and_then(|s| s.to_str())
                && !name.starts_with('_')
            {
                tables.push(name.to_string());
            }
        }

        tables.sort();
        Ok(tables)
    }

    /// Read all records of a table in arrival order
    pub fn read_table(&self, table: &str) -> Result<Vec<Value>> {
        let dir = self.table_dir(table)?;
        if !dir.is_dir() {
            eyre::bail!("Table '{}' not found in {}", table, self.root.display());
        }

        let mut records = Vec::new();
        for (_, path) in data_files(&dir)? {
            records.extend(NdjsonReader::new(path).read()?);
        }
        Ok(records)
    }

    /// Count records of a table without parsing them
    pub fn count(&self, table: &str) -> Result<usize> {
        let mut count = 0;
        for (_, path) in data_files(&self.table_dir(table)?)? {
            count += NdjsonReader::new(&path)
                .count()
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }
        Ok(count)
    }

    fn table_dir(&self, table: &str) -> Result<PathBuf> {
        if !is_valid_table_name(table) {
            eyre::bail!("Invalid table name '{}'", table);
        }
        Ok(self.root.join(table))
    }

    /// Trace of the last run loaded into this dataset, if any
    pub fn last_trace(&self) -> Result<Option<RunTrace>> {
        let path = self.root.join(TRACE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        RunTrace::read(path).map(Some)
    }
}
