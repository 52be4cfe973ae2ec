//! Run traces: per-resource results of one pipeline run

use crate::error::{ErrorKind, ExtractError};
use crate::resource::{ResourceDefinition, WritePolicy};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResourceStatus {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

/// Result of extracting and loading one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTrace {
    pub name: String,
    pub write_policy: WritePolicy,
    #[serde(flatten)]
    pub status: ResourceStatus,
    /// Batches written to the sink
    pub pages: u32,
    /// Records written to the sink
    pub records: usize,
    pub duration_ms: u64,
}

impl ResourceTrace {
    pub fn new(resource: &ResourceDefinition) -> Self {
        Self {
            name: resource.name.clone(),
            write_policy: resource.write_policy,
            status: ResourceStatus::Succeeded,
            pages: 0,
            records: 0,
            duration_ms: 0,
        }
    }

    /// Record the terminal error of this resource
    pub fn fail(&mut self, error: &ExtractError) {
        self.status = match error {
            ExtractError::Cancelled { .. } => ResourceStatus::Cancelled,
            e => ResourceStatus::Failed {
                kind: e.kind(),
                message: e.to_string(),
            },
        };
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == ResourceStatus::Succeeded
    }
}

/// Overall outcome of a run, mapped to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Partial => 1,
            Self::Failed => 2,
        }
    }
}

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTrace {
    pub pipeline_name: String,
    pub dataset_name: String,
    /// Unix timestamp in milliseconds
    pub started_at: u64,
    pub duration_ms: u64,
    /// Resources in declaration order
    pub resources: Vec<ResourceTrace>,
}

impl RunTrace {
    pub fn resource(&self, name: &str) -> Option<&ResourceTrace> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn total_records(&self) -> usize {
        self.resources.iter().map(|r| r.records).sum()
    }

    /// All succeeded, some succeeded, or none succeeded
    ///
    /// A run with no resources counts as a success.
    pub fn outcome(&self) -> RunOutcome {
        let succeeded = self.resources.iter().filter(|r| r.succeeded()).count();
        if succeeded == self.resources.len() {
            RunOutcome::Success
        } else if succeeded > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed
        }
    }

    /// Read a trace from a JSON file
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read trace: {}", path.as_ref().display()))?;
        serde_json::from_str(&content).with_context(|| "Failed to parse trace JSON")
    }

    /// Write the trace as pretty JSON
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write trace: {}", path.as_ref().display()))?;
        Ok(())
    }
}

impl std::fmt::Display for RunTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Run of pipeline {} into dataset {}: {} record(s) in {} ms",
            self.pipeline_name,
            self.dataset_name,
            self.total_records(),
            self.duration_ms
        )?;
        for r in &self.resources {
            let status = match &r.status {
                ResourceStatus::Succeeded => "succeeded".to_string(),
                ResourceStatus::Failed { kind, message } => format!("failed ({kind}): {message}"),
                ResourceStatus::Cancelled => "cancelled".to_string(),
            };
            writeln!(
                f,
                "  {:<16} {:<8} {:>5} page(s) {:>8} record(s) {:>7} ms  {}",
                r.name, r.write_policy, r.pages, r.records, r.duration_ms, status
            )?;
        }
        Ok(())
    }
}
