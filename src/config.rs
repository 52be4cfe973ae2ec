//! Pipeline configuration
//!
//! `PipelineConfig` is passed explicitly to the coordinator and sinks. It can
//! be built in code or read from the environment (after a `.env` file has
//! been sourced) using the variables below. Unset variables keep defaults.
//!
//! | Variable                        | Field               |
//! |---------------------------------|---------------------|
//! | `JAFFLE_API_URL`                | `base_url`          |
//! | `PIPELINE_NAME`                 | `pipeline_name`     |
//! | `DATASET_NAME`                  | `dataset_name`      |
//! | `DESTINATION_DIR`               | `destination_dir`   |
//! | `EXTRACT__WORKERS`              | `worker_count`      |
//! | `DATA_WRITER__FILE_MAX_ITEMS`   | `file_max_items`    |
//! | `DATA_WRITER__BUFFER_MAX_ITEMS` | `buffer_max_items`  |
//! | `HTTP__MAX_ATTEMPTS`            | `max_attempts`      |
//! | `HTTP__BACKOFF_BASE_MS`         | `backoff_base`      |
//! | `HTTP__TIMEOUT_SECS`            | `request_timeout`   |
//! | `DESTINATION`                   | `destination`       |

use crate::etl::RetryPolicy;
use crate::resource::is_valid_table_name;

use eyre::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://jaffle-shop.scalevector.ai/api/v1";

/// Where loaded tables are stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
    /// `<destination_dir>/<dataset_name>/<table>/*.ndjson`
    #[default]
    Ndjson,
    /// `<destination_dir>/<pipeline_name>.duckdb`, one schema per dataset
    Duckdb,
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ndjson" => Ok(Self::Ndjson),
            "duckdb" => Ok(Self::Duckdb),
            other => Err(format!("unknown destination '{}' (ndjson, duckdb)", other)),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ndjson => write!(f, "ndjson"),
            Self::Duckdb => write!(f, "duckdb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub base_url: Url,
    pub pipeline_name: String,
    pub dataset_name: String,
    /// Directory holding one sub-directory per dataset
    pub destination_dir: PathBuf,
    /// Maximum number of resources extracted concurrently
    pub worker_count: usize,
    /// Records per data file before rotating to a new file
    pub file_max_items: usize,
    /// Records buffered in memory per table before flushing to disk
    pub buffer_max_items: usize,
    /// Query parameter carrying the page number
    pub page_param: String,
    /// Total attempts per page, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub destination: Destination,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_API_URL).expect("default API URL is valid"),
            pipeline_name: "jaffle_shop".to_string(),
            dataset_name: "jaffle_shop_dataset".to_string(),
            destination_dir: PathBuf::from(".jaffle"),
            worker_count: 4,
            file_max_items: 10_000,
            buffer_max_items: 5_000,
            page_param: "page".to_string(),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            destination: Destination::Ndjson,
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("JAFFLE_API_URL") {
            config.base_url =
                Url::parse(&url).with_context(|| format!("Invalid JAFFLE_API_URL: {}", url))?;
        }
        if let Ok(name) = std::env::var("PIPELINE_NAME") {
            config.pipeline_name = name;
        }
        if let Ok(name) = std::env::var("DATASET_NAME") {
            config.dataset_name = name;
        }
        if let Ok(dir) = std::env::var("DESTINATION_DIR") {
            config.destination_dir = PathBuf::from(dir);
        }
        if let Some(workers) = env_parse("EXTRACT__WORKERS")? {
            config.worker_count = workers;
        }
        if let Some(items) = env_parse("DATA_WRITER__FILE_MAX_ITEMS")? {
            config.file_max_items = items;
        }
        if let Some(items) = env_parse("DATA_WRITER__BUFFER_MAX_ITEMS")? {
            config.buffer_max_items = items;
        }
        if let Some(attempts) = env_parse("HTTP__MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(millis) = env_parse("HTTP__BACKOFF_BASE_MS")? {
            config.backoff_base = Duration::from_millis(millis);
        }
        if let Some(secs) = env_parse("HTTP__TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(destination) = env_parse("DESTINATION")? {
            config.destination = destination;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_destination_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination_dir = dir.into();
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            eyre::bail!("worker_count must be at least 1");
        }
        if self.file_max_items == 0 {
            eyre::bail!("file_max_items must be at least 1");
        }
        if self.buffer_max_items == 0 {
            eyre::bail!("buffer_max_items must be at least 1");
        }
        if self.max_attempts == 0 {
            eyre::bail!("max_attempts must be at least 1");
        }
        // Both names become paths below destination_dir
        if !is_valid_table_name(&self.dataset_name) {
            eyre::bail!("Invalid dataset_name '{}'", self.dataset_name);
        }
        if !is_valid_table_name(&self.pipeline_name) {
            eyre::bail!("Invalid pipeline_name '{}'", self.pipeline_name);
        }
        Ok(())
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Directory of the dataset this pipeline loads into
    ///
    /// Holds the NDJSON tables and, for every destination, the run trace.
    pub fn dataset_dir(&self) -> PathBuf {
        self.destination_dir.join(&self.dataset_name)
    }

    /// Database file used by the DuckDB destination
    pub fn database_path(&self) -> PathBuf {
        self.destination_dir
            .join(format!("{}.duckdb", self.pipeline_name))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base, self.backoff_max)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre::eyre!("Invalid {}='{}': {}", key, value, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "JAFFLE_API_URL",
        "PIPELINE_NAME",
        "DATASET_NAME",
        "DESTINATION_DIR",
        "EXTRACT__WORKERS",
        "DATA_WRITER__FILE_MAX_ITEMS",
        "DATA_WRITER__BUFFER_MAX_ITEMS",
        "HTTP__MAX_ATTEMPTS",
        "HTTP__BACKOFF_BASE_MS",
        "HTTP__TIMEOUT_SECS",
        "DESTINATION",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_url.as_str(), DEFAULT_API_URL);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.file_max_items, 10_000);
        assert_eq!(config.page_param, "page");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.dataset_dir(),
            PathBuf::from(".jaffle/jaffle_shop_dataset")
        );
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("EXTRACT__WORKERS", "8");
            std::env::set_var("DATA_WRITER__FILE_MAX_ITEMS", "10000");
            std::env::set_var("DATA_WRITER__BUFFER_MAX_ITEMS", "20000");
            std::env::set_var("DATASET_NAME", "jaffle_shop_dataset_boosted");
            std::env::set_var("HTTP__BACKOFF_BASE_MS", "250");
        }

        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.file_max_items, 10_000);
        assert_eq!(config.buffer_max_items, 20_000);
        assert_eq!(config.dataset_name, "jaffle_shop_dataset_boosted");
        assert_eq!(config.backoff_base, Duration::from_millis(250));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        clear_env();
        unsafe { std::env::set_var("EXTRACT__WORKERS", "four") };

        let err = PipelineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("EXTRACT__WORKERS"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_destination() {
        clear_env();
        assert_eq!(PipelineConfig::from_env().unwrap().destination, Destination::Ndjson);

        unsafe { std::env::set_var("DESTINATION", "DuckDB") };
        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.destination, Destination::Duckdb);
        assert_eq!(config.database_path(), PathBuf::from(".jaffle/jaffle_shop.duckdb"));

        unsafe { std::env::set_var("DESTINATION", "postgres") };
        let err = PipelineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DESTINATION"));

        clear_env();
    }

    #[test]
    fn test_path_like_names_rejected() {
        let mut config = PipelineConfig::default();
        config.dataset_name = "../elsewhere".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.pipeline_name = "/tmp/jaffle".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_workers() {
        clear_env();
        unsafe { std::env::set_var("EXTRACT__WORKERS", "0") };

        let err = PipelineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("worker_count"));

        clear_env();
    }
}
