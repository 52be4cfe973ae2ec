//! CLI helper functions

use crate::{
    client::{Auth, RestClient},
    config::{Destination, PipelineConfig},
    error::FetchError,
    etl::{
        Coordinator, Fetcher, HttpFetcher, PageNumberPaginator, PageStep, Paginator, RunTrace,
        Sink,
    },
    resource::{ResourceDefinition, ResourcesManifest},
    storage::{DatasetReader, DatasetWriter, TRACE_FILE},
};
#[cfg(feature = "duckdb")]
use crate::storage::DuckDbSink;
use eyre::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Load the resources manifest, or the built-in Jaffle Shop resources
pub fn load_resources(manifest: Option<&Path>) -> Result<ResourcesManifest> {
    match manifest {
        Some(path) => {
            log::info!("Loading resources from {}", path.display());
            ResourcesManifest::read(path)
        }
        None => {
            log::debug!("No resources manifest given, using the Jaffle Shop resources");
            Ok(ResourcesManifest::default())
        }
    }
}

/// Write the Jaffle Shop resources as a starting manifest
///
/// Refuses to overwrite an existing file unless `force` is set.
pub fn init_manifest(path: &Path, force: bool) -> Result<ResourcesManifest> {
    if path.exists() && !force {
        eyre::bail!(
            "Manifest {} already exists, use --force to overwrite it",
            path.display()
        );
    }

    let manifest = ResourcesManifest::default();
    manifest.write(path)?;
    log::info!(
        "Wrote {} resource(s) to {}",
        manifest.count(),
        path.display()
    );
    Ok(manifest)
}

/// Build the HTTP page fetcher for the configured API
pub fn build_fetcher(config: &PipelineConfig, auth: Auth) -> Result<HttpFetcher> {
    let client = RestClient::try_new(config.base_url.clone(), auth, config.request_timeout)
        .context("Failed to create REST client")?;
    Ok(HttpFetcher::new(client))
}

/// Run the pipeline into the configured destination
///
/// Pipeline: HttpFetcher → PageNumberPaginator → ResourceExtractor → Sink
/// Ctrl-C cancels the run; the trace is persisted as `<dataset>/_trace.json`.
pub async fn run_pipeline(
    config: &PipelineConfig,
    auth: Auth,
    resources: &[ResourceDefinition],
) -> Result<RunTrace> {
    config.validate()?;

    let fetcher = Arc::new(build_fetcher(config, auth)?);
    log::info!("Connecting to {}", fetcher.client());

    let trace = match config.destination {
        Destination::Ndjson => {
            let sink = DatasetWriter::from_config(config)?;
            log::info!("Loading into {}", sink.root().display());
            run_into(config, fetcher, Arc::new(sink), resources).await
        }
        Destination::Duckdb => run_into_duckdb(config, fetcher, resources).await?,
    };

    let trace_path = config.dataset_dir().join(TRACE_FILE);
    trace
        .write(&trace_path)
        .with_context(|| "Failed to persist run trace")?;
    log::debug!("Trace written to {}", trace_path.display());

    Ok(trace)
}

async fn run_into<S: Sink>(
    config: &PipelineConfig,
    fetcher: Arc<HttpFetcher>,
    sink: Arc<S>,
    resources: &[ResourceDefinition],
) -> RunTrace {
    let coordinator = Coordinator::new(fetcher, sink, config);

    let cancel = coordinator.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling pipeline...");
            cancel.cancel();
        }
    });

    let run = coordinator.run(resources).await;
    interrupt.abort();
    run.into_trace()
}

#[cfg(feature = "duckdb")]
async fn run_into_duckdb(
    config: &PipelineConfig,
    fetcher: Arc<HttpFetcher>,
    resources: &[ResourceDefinition],
) -> Result<RunTrace> {
    let sink = DuckDbSink::from_config(config)?;
    log::info!(
        "Loading into {} (schema {})",
        config.database_path().display(),
        config.dataset_name
    );
    Ok(run_into(config, fetcher, Arc::new(sink), resources).await)
}

#[cfg(not(feature = "duckdb"))]
async fn run_into_duckdb(
    _config: &PipelineConfig,
    _fetcher: Arc<HttpFetcher>,
    _resources: &[ResourceDefinition],
) -> Result<RunTrace> {
    Err(duckdb_disabled())
}

#[cfg(not(feature = "duckdb"))]
fn duckdb_disabled() -> eyre::Report {
    eyre::eyre!("The duckdb destination needs a build with `--features duckdb`")
}

/// Fetch the first page of each resource
///
/// Returns the record count of page 1 per resource, or the fetch error.
pub async fn check_resources(
    config: &PipelineConfig,
    auth: Auth,
    resources: &[ResourceDefinition],
) -> Result<Vec<(String, Result<usize, FetchError>)>> {
    let fetcher = build_fetcher(config, auth)?;
    let paginator = PageNumberPaginator::new(config.page_param.clone());

    let mut results = Vec::with_capacity(resources.len());
    for resource in resources {
        let resource = Arc::new(resource.clone());
        let PageStep::Request(request) = paginator.next(&resource, None) else {
            continue;
        };
        let result = fetcher
            .fetch(&request)
            .await
            .map(|page| page.records.len());
        results.push((resource.name.clone(), result));
    }

    Ok(results)
}

/// Read up to `limit` records of a loaded table
pub fn show_table(config: &PipelineConfig, table: &str, limit: usize) -> Result<Vec<Value>> {
    let mut records = match config.destination {
        Destination::Ndjson => DatasetReader::from_config(config).read_table(table)?,
        Destination::Duckdb => read_duckdb_table(config, table)?,
    };
    records.truncate(limit);
    Ok(records)
}

#[cfg(feature = "duckdb")]
fn read_duckdb_table(config: &PipelineConfig, table: &str) -> Result<Vec<Value>> {
    DuckDbSink::from_config(config)?.read_table(table)
}

#[cfg(not(feature = "duckdb"))]
fn read_duckdb_table(_config: &PipelineConfig, _table: &str) -> Result<Vec<Value>> {
    Err(duckdb_disabled())
}

/// Trace of the last run into the configured dataset
pub fn last_trace(config: &PipelineConfig) -> Result<Option<RunTrace>> {
    DatasetReader::from_config(config).last_trace()
}
