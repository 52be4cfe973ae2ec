//! Resource definitions and the resources manifest
//!
//! A resource is one logical entity pulled from the API. The set of resources
//! is built at startup, either from the built-in Jaffle Shop list or from a
//! YAML manifest.
//!
//! Example manifest:
//! ```yaml
//! resources:
//!   - name: customers
//!     path: /customers
//!   - name: products
//!     path: /products
//!     write_policy: replace
//!   - name: stores
//!     path: /stores
//!     parallel: false
//!     data_selector: data
//! ```

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// How batches for a resource are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Accumulate records across runs
    #[default]
    Append,
    /// Truncate the table before the first batch of a run
    Replace,
}

impl std::fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Append => write!(f, "append"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

fn default_parallel() -> bool {
    true
}

/// One logical entity extracted from the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Resource name, also used as the destination table name
    pub name: String,

    /// Endpoint path relative to the API base URL
    pub path: String,

    #[serde(default)]
    pub write_policy: WritePolicy,

    /// Whether the resource may run on the shared worker pool
    #[serde(rename = "parallel", default = "default_parallel")]
    pub parallel_eligible: bool,

    /// Key holding the record array when the endpoint returns an object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_selector: Option<String>,

    /// Extra query parameters sent with every page request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl ResourceDefinition {
    /// Create an append-only, parallel-eligible resource
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            write_policy: WritePolicy::Append,
            parallel_eligible: true,
            data_selector: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_write_policy(mut self, write_policy: WritePolicy) -> Self {
        self.write_policy = write_policy;
        self
    }

    pub fn parallel(mut self, parallel_eligible: bool) -> Self {
        self.parallel_eligible = parallel_eligible;
        self
    }

    pub fn with_data_selector(mut self, key: impl Into<String>) -> Self {
        self.data_selector = Some(key.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Whether `name` can be used as a destination table name
///
/// Table names become directory names, so they must be a single plain path
/// component. Names starting with `_` or `.` are reserved for dataset
/// metadata such as the run trace.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.starts_with(['_', '.'])
        && !name.contains(['/', '\\', ':', '\0'])
}

/// The Jaffle Shop resources: customers and orders accumulate, products are replaced
pub fn jaffle_shop() -> Vec<ResourceDefinition> {
    vec![
        ResourceDefinition::new("customers", "/customers"),
        ResourceDefinition::new("orders", "/orders"),
        ResourceDefinition::new("products", "/products").with_write_policy(WritePolicy::Replace),
    ]
}

/// Resources manifest stored as YAML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcesManifest {
    pub resources: Vec<ResourceDefinition>,
}

impl Default for ResourcesManifest {
    fn default() -> Self {
        Self {
            resources: jaffle_shop(),
        }
    }
}

impl ResourcesManifest {
    pub fn with_resources(resources: Vec<ResourceDefinition>) -> Self {
        Self { resources }
    }

    /// Get the number of resources in the manifest
    pub fn count(&self) -> usize {
        self.resources.len()
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Check names are present, non-empty and unique
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                eyre::bail!("Resource with path '{}' has an empty name", resource.path);
            }
            if !is_valid_table_name(&resource.name) {
                eyre::bail!(
                    "Invalid resource name '{}': names must not contain path separators or start with '_' or '.'",
                    resource.name
                );
            }
            if !seen.insert(resource.name.as_str()) {
                eyre::bail!("Duplicate resource name '{}' in manifest", resource.name);
            }
        }
        Ok(())
    }

    /// Keep only the named resources, preserving manifest order
    ///
    /// An empty selection keeps everything.
    pub fn select(&self, names: &[String]) -> Result<Vec<ResourceDefinition>> {
        if names.is_empty() {
            return Ok(self.resources.clone());
        }

        if let Some(unknown) = names.iter().find(|n| self.get(n).is_none()) {
            eyre::bail!(
                "Resource '{}' not found. Available resources: {}",
                unknown,
                self.resources
                    .iter()
                    .map(|r| r.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(self
            .resources
            .iter()
            .filter(|r| names.contains(&r.name))
            .cloned()
            .collect())
    }

    /// Read manifest from YAML file
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "Failed to read resources manifest: {}",
                path.as_ref().display()
            )
        })?;

        let manifest: Self = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse resources manifest YAML")?;
        manifest.validate()?;

        Ok(manifest)
    }

    /// Write manifest to YAML file
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(self)
            .with_context(|| "Failed to serialize resources manifest to YAML")?;

        std::fs::write(path.as_ref(), yaml).with_context(|| {
            format!(
                "Failed to write resources manifest: {}",
                path.as_ref().display()
            )
        })?;

        Ok(())
    }
}
