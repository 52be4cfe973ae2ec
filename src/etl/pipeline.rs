//! Pipeline orchestration: runs resource extractors into a sink

use super::extract::ResourceExtractor;
use super::fetch::Fetcher;
use super::load::Sink;
use super::paginate::{PageNumberPaginator, Paginator};
use super::retry::RetryPolicy;
use super::trace::{ResourceTrace, RunOutcome, RunTrace};
use crate::config::PipelineConfig;
use crate::error::ExtractError;
use crate::resource::ResourceDefinition;

use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Result of [`Coordinator::run`], owned by the caller
#[derive(Debug, Clone)]
pub struct Run {
    trace: RunTrace,
}

impl Run {
    pub fn trace(&self) -> &RunTrace {
        &self.trace
    }

    pub fn into_trace(self) -> RunTrace {
        self.trace
    }

    pub fn outcome(&self) -> RunOutcome {
        self.trace.outcome()
    }
}

/// Extraction coordinator
///
/// Runs one extractor per resource and feeds every batch to the sink.
/// Parallel-eligible resources share a pool of `worker_count` workers; the
/// rest run one after another in declaration order on a single lane that
/// also takes a worker slot. Failures are isolated per resource.
///
/// # Example
/// ```no_run
/// use jaffle_pipeline::client::{Auth, RestClient};
/// use jaffle_pipeline::config::PipelineConfig;
/// use jaffle_pipeline::etl::{Coordinator, HttpFetcher};
/// use jaffle_pipeline::resource::jaffle_shop;
/// use jaffle_pipeline::storage::DatasetWriter;
/// use std::sync::Arc;
///
/// # async fn example() -> eyre::Result<()> {
/// let config = PipelineConfig::default();
/// let client = RestClient::try_new(config.base_url.clone(), Auth::None, config.request_timeout)?;
/// let sink = DatasetWriter::from_config(&config)?;
///
/// let coordinator = Coordinator::new(Arc::new(HttpFetcher::new(client)), Arc::new(sink), &config);
/// let run = coordinator.run(&jaffle_shop()).await;
/// println!("{}", run.trace());
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<F, S, P = PageNumberPaginator> {
    fetcher: Arc<F>,
    sink: Arc<S>,
    paginator: Arc<P>,
    retry: RetryPolicy,
    worker_count: usize,
    pipeline_name: String,
    dataset_name: String,
    cancel: CancellationToken,
}

impl<F, S> Coordinator<F, S, PageNumberPaginator>
where
    F: Fetcher,
    S: Sink,
{
    /// Create a coordinator with page-number pagination
    pub fn new(fetcher: Arc<F>, sink: Arc<S>, config: &PipelineConfig) -> Self {
        let paginator = PageNumberPaginator::new(config.page_param.clone());
        Self::with_paginator(fetcher, sink, Arc::new(paginator), config)
    }
}

impl<F, S, P> Coordinator<F, S, P>
where
    F: Fetcher,
    S: Sink,
    P: Paginator + 'static,
{
    pub fn with_paginator(
        fetcher: Arc<F>,
        sink: Arc<S>,
        paginator: Arc<P>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            sink,
            paginator,
            retry: config.retry_policy(),
            worker_count: config.worker_count.max(1),
            pipeline_name: config.pipeline_name.clone(),
            dataset_name: config.dataset_name.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run when cancelled
    ///
    /// No new pages are requested after cancellation; pages in flight are
    /// discarded and unfinished resources are reported as cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run all resources and collect their traces
    pub async fn run(&self, resources: &[ResourceDefinition]) -> Run {
        let started = Instant::now();
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        log::info!(
            "Starting pipeline '{}' with {} resource(s) on {} worker(s)",
            self.pipeline_name,
            resources.len(),
            self.worker_count
        );

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut workers = JoinSet::new();

        let (parallel, sequential): (Vec<_>, Vec<_>) = resources
            .iter()
            .cloned()
            .enumerate()
            .partition(|(_, r)| r.parallel_eligible);

        for (index, resource) in parallel {
            let job = self.job();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                vec![(index, job.guarded(resource).await)]
            });
        }

        if !sequential.is_empty() {
            let job = self.job();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let mut traces = Vec::with_capacity(sequential.len());
                for (index, resource) in sequential {
                    let _permit = semaphore.acquire().await;
                    traces.push((index, job.guarded(resource).await));
                }
                traces
            });
        }

        let mut traces = Vec::with_capacity(resources.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(done) => traces.extend(done),
                Err(e) => log::error!("Pipeline worker failed to join: {}", e),
            }
        }
        backfill_lost(resources, &mut traces);
        traces.sort_by_key(|(index, _)| *index);

        let trace = RunTrace {
            pipeline_name: self.pipeline_name.clone(),
            dataset_name: self.dataset_name.clone(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            resources: traces.into_iter().map(|(_, t)| t).collect(),
        };

        match trace.outcome() {
            RunOutcome::Success => log::info!(
                "Pipeline '{}' loaded {} record(s)",
                self.pipeline_name,
                trace.total_records()
            ),
            _ => log::warn!(
                "Pipeline '{}' finished with failures: {}",
                self.pipeline_name,
                trace.failed().join(", ")
            ),
        }

        Run { trace }
    }

    fn job(&self) -> ResourceJob<F, S, P> {
        ResourceJob {
            fetcher: Arc::clone(&self.fetcher),
            sink: Arc::clone(&self.sink),
            paginator: Arc::clone(&self.paginator),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Add a failed trace for every resource whose worker never reported back
fn backfill_lost(resources: &[ResourceDefinition], traces: &mut Vec<(usize, ResourceTrace)>) {
    if traces.len() >= resources.len() {
        return;
    }

    let reported: HashSet<usize> = traces.iter().map(|(index, _)| *index).collect();
    for (index, resource) in resources.iter().enumerate() {
        if reported.contains(&index) {
            continue;
        }
        log::error!("No result for '{}', marking it failed", resource.name);
        let mut trace = ResourceTrace::new(resource);
        trace.fail(&ExtractError::WorkerLost(resource.name.clone()));
        traces.push((index, trace));
    }
}

/// Everything a worker needs to extract and load one resource
struct ResourceJob<F, S, P> {
    fetcher: Arc<F>,
    sink: Arc<S>,
    paginator: Arc<P>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<F, S, P> ResourceJob<F, S, P>
where
    F: Fetcher,
    S: Sink,
    P: Paginator + 'static,
{
    /// Extract and load, turning a panic into a failed resource
    async fn guarded(&self, resource: ResourceDefinition) -> ResourceTrace {
        let started = Instant::now();
        let fallback = ResourceTrace::new(&resource);
        let name = resource.name.clone();

        match AssertUnwindSafe(self.extract_and_load(resource))
            .catch_unwind()
            .await
        {
            Ok(trace) => trace,
            Err(_) => {
                log::error!("Worker for '{}' panicked", name);
                let mut trace = fallback;
                trace.fail(&ExtractError::Panicked(name));
                trace.with_duration(started.elapsed())
            }
        }
    }

    async fn extract_and_load(&self, resource: ResourceDefinition) -> ResourceTrace {
        let started = Instant::now();
        let mut trace = ResourceTrace::new(&resource);

        if self.cancel.is_cancelled() {
            trace.fail(&ExtractError::Cancelled { page: 1 });
            return trace;
        }

        log::info!(
            "Extracting '{}' from {} ({})",
            resource.name,
            resource.path,
            resource.write_policy
        );

        if let Err(e) = self.sink.open(&resource).await {
            trace.fail(&e.into());
            return trace.with_duration(started.elapsed());
        }

        let name = resource.name.clone();
        let extractor = ResourceExtractor::new(
            resource,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.paginator),
            self.retry.clone(),
            self.cancel.clone(),
        );
        let mut batches = std::pin::pin!(extractor.into_stream());

        let mut failure: Option<ExtractError> = None;
        while let Some(item) = batches.next().await {
            let batch = match item {
                Ok(batch) => batch,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let page = batch.page_number;
            match self.sink.write(batch).await {
                Ok(written) => {
                    trace.pages += 1;
                    trace.records += written;
                    log::debug!("Loaded {} record(s) from '{}' page {}", written, name, page);
                }
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
        }

        if let Err(e) = self.sink.close(&name, failure.is_none()).await {
            match failure {
                Some(_) => log::warn!("Failed to close '{}' after an earlier error: {}", name, e),
                None => failure = Some(e.into()),
            }
        }

        match failure {
            None => log::info!(
                "Loaded '{}': {} record(s) in {} page(s)",
                name,
                trace.records,
                trace.pages
            ),
            Some(ExtractError::Cancelled { page }) => {
                log::warn!("'{}' cancelled before page {}", name, page);
                trace.fail(&ExtractError::Cancelled { page });
            }
            Some(e) => {
                log::error!("'{}' failed after {} page(s): {}", name, trace.pages, e);
                trace.fail(&e);
            }
        }

        trace.with_duration(started.elapsed())
    }
}
