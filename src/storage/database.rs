//! DuckDB destination: one table per resource inside a dataset schema
//!
//! Layout:
//! ```text
//! <destination_dir>/<pipeline_name>.duckdb
//!     schema <dataset_name>
//!         table customers (_seq BIGINT, _page INTEGER, record VARCHAR)
//!         table orders    (...)
//! ```
//!
//! `record` holds the source object as JSON text. `_seq` keeps arrival
//! order across batches and runs.

use crate::config::PipelineConfig;
use crate::error::WriteError;
use crate::etl::{LoadBatch, Sink};
use crate::resource::{ResourceDefinition, WritePolicy, is_valid_table_name};

use duckdb::{Connection, params};
use eyre::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Sink loading tables into a DuckDB database
///
/// Statements share one connection. Each table also has its own lock, so a
/// table only ever sees one batch at a time.
pub struct DuckDbSink {
    path: Option<PathBuf>,
    schema: String,
    conn: Mutex<Connection>,
    tables: Mutex<HashMap<String, Arc<tokio::sync::Mutex<TableState>>>>,
}

#[derive(Debug)]
struct TableState {
    /// Delete existing rows before the first batch of this run
    pending_truncate: bool,
    next_seq: i64,
}

impl DuckDbSink {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>, schema: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open DuckDB database: {}", path.display()))?;
        Self::with_connection(conn, Some(path), schema)
    }

    /// In-memory database, gone when the sink is dropped
    pub fn in_memory(schema: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open DuckDB in memory")?;
        Self::with_connection(conn, None, schema)
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.database_path(), &config.dataset_name)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>, schema: &str) -> Result<Self> {
        conn.execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {};", quote(schema)))
            .with_context(|| format!("Failed to create schema '{}'", schema))?;

        Ok(Self {
            path,
            schema: schema.to_string(),
            conn: Mutex::new(conn),
            tables: Mutex::new(HashMap::new()),
        })
    }

    /// Database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Tables in the dataset schema, sorted
    pub fn tables(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = ? ORDER BY table_name",
        )?;
        let names = stmt
            .query_map(params![self.schema], |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Read all records of a table in arrival order
    pub fn read_table(&self, table: &str) -> Result<Vec<Value>> {
        if !is_valid_table_name(table) {
            eyre::bail!("Invalid table name '{}'", table);
        }

        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT record FROM {} ORDER BY _seq",
                self.qualified(table)
            ))
            .with_context(|| format!("Table '{}' not found in schema '{}'", table, self.schema))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<Vec<_>>>()?;

        rows.iter()
            .map(|row| serde_json::from_str(row).with_context(|| "Failed to parse stored record"))
            .collect()
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote(&self.schema), quote(table))
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tables(
        &self,
    ) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<TableState>>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_table(
        &self,
        name: &str,
        write_policy: WritePolicy,
    ) -> Result<Arc<tokio::sync::Mutex<TableState>>, WriteError> {
        if !is_valid_table_name(name) {
            return Err(WriteError::new(
                name,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid table name"),
            ));
        }

        let table = self.qualified(name);
        let next_seq = {
            let conn = self.lock_conn();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 _seq BIGINT NOT NULL, _page INTEGER NOT NULL, record VARCHAR NOT NULL);",
                table
            ))
            .map_err(|e| db_error(name, e))?;
            conn.query_row(
                &format!("SELECT coalesce(max(_seq), 0) FROM {}", table),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| db_error(name, e))?
        };

        let state = Arc::new(tokio::sync::Mutex::new(TableState {
            pending_truncate: write_policy == WritePolicy::Replace,
            next_seq,
        }));
        self.lock_tables()
            .insert(name.to_string(), Arc::clone(&state));
        Ok(state)
    }

    fn table(&self, name: &str) -> Option<Arc<tokio::sync::Mutex<TableState>>> {
        self.lock_tables().get(name).cloned()
    }

    /// Insert one batch in a transaction, deleting old rows first if pending
    fn insert(&self, name: &str, state: &mut TableState, batch: &LoadBatch) -> duckdb::Result<()> {
        let table = self.qualified(name);
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        if state.pending_truncate {
            log::debug!("Replacing rows of '{}'", name);
            tx.execute(&format!("DELETE FROM {}", table), [])?;
        }

        let mut seq = if state.pending_truncate {
            0
        } else {
            state.next_seq
        };
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (_seq, _page, record) VALUES (?, ?, ?)",
                table
            ))?;
            for record in &batch.records {
                seq += 1;
                let json = Value::Object(record.clone()).to_string();
                stmt.execute(params![seq, batch.page_number, json])?;
            }
        }
        tx.commit()?;

        state.pending_truncate = false;
        state.next_seq = seq;
        Ok(())
    }

    fn delete_all(&self, name: &str) -> duckdb::Result<()> {
        self.lock_conn()
            .execute(&format!("DELETE FROM {}", self.qualified(name)), [])
            .map(|_| ())
    }
}

impl Sink for DuckDbSink {
    async fn open(&self, resource: &ResourceDefinition) -> Result<(), WriteError> {
        self.open_table(&resource.name, resource.write_policy)?;
        log::debug!(
            "Opened table {} ({})",
            self.qualified(&resource.name),
            resource.write_policy
        );
        Ok(())
    }

    async fn write(&self, batch: LoadBatch) -> Result<usize, WriteError> {
        let state = match self.table(&batch.resource_name) {
            Some(state) => state,
            None => self.open_table(&batch.resource_name, batch.write_policy)?,
        };

        let mut state = state.lock().await;
        self.insert(&batch.resource_name, &mut state, &batch)
            .map_err(|e| db_error(&batch.resource_name, e))?;
        Ok(batch.len())
    }

    async fn close(&self, table: &str, succeeded: bool) -> Result<(), WriteError> {
        let state = self.lock_tables().remove(table);
        let Some(state) = state else {
            return Ok(());
        };

        let mut state = state.lock().await;
        // A successful REPLACE run without batches leaves the table empty
        if succeeded && state.pending_truncate {
            self.delete_all(table).map_err(|e| db_error(table, e))?;
            state.pending_truncate = false;
        }

        log::debug!("Closed table {}", self.qualified(table));
        Ok(())
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn db_error(table: &str, e: duckdb::Error) -> WriteError {
    WriteError::new(table, std::io::Error::other(e.to_string()))
}
