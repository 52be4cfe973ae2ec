//! Resource extraction: drives the paginator and fetcher for one resource

use super::fetch::Fetcher;
use super::load::LoadBatch;
use super::paginate::{PageRequest, PageResponse, PageStep, Paginator};
use super::retry::RetryPolicy;
use crate::error::{ExtractError, FetchError};
use crate::resource::ResourceDefinition;

use futures::Stream;
use futures::stream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-resource extraction state, owned by one extractor
#[derive(Debug)]
struct ExtractionState {
    current_page: u32,
    exhausted: bool,
    pending: PageStep,
}

impl ExtractionState {
    fn new(first: PageStep) -> Self {
        Self {
            current_page: 0,
            exhausted: false,
            pending: first,
        }
    }

    /// Mark the resource exhausted; later calls are no-ops
    fn finish(&mut self) -> bool {
        let first = !self.exhausted;
        self.exhausted = true;
        self.pending = PageStep::Done;
        first
    }
}

/// Extractor for one resource
///
/// Produces a lazy stream of [`LoadBatch`]es, one per non-empty page, in
/// page order. The stream ends when the paginator reports `Done`, after the
/// first unrecoverable error (yielded once), or on cancellation. Transient
/// fetch errors are retried on the same page number, so each page is yielded
/// at most once. Not restartable: a new extractor starts again from page 1.
///
/// # Example
/// ```no_run
/// use futures::StreamExt;
/// use jaffle_pipeline::client::{Auth, RestClient};
/// use jaffle_pipeline::etl::{HttpFetcher, PageNumberPaginator, ResourceExtractor, RetryPolicy};
/// use jaffle_pipeline::resource::ResourceDefinition;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
/// use url::Url;
///
/// # async fn example() -> eyre::Result<()> {
/// let url = Url::parse("https://jaffle-shop.scalevector.ai/api/v1")?;
/// let client = RestClient::try_new(url, Auth::None, Duration::from_secs(30))?;
///
/// let extractor = ResourceExtractor::new(
///     ResourceDefinition::new("customers", "/customers"),
///     Arc::new(HttpFetcher::new(client)),
///     Arc::new(PageNumberPaginator::default()),
///     RetryPolicy::default(),
///     CancellationToken::new(),
/// );
///
/// let mut pages = std::pin::pin!(extractor.into_stream());
/// while let Some(batch) = pages.next().await {
///     println!("{} records", batch?.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct ResourceExtractor<F, P> {
    resource: Arc<ResourceDefinition>,
    fetcher: Arc<F>,
    paginator: Arc<P>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<F, P> ResourceExtractor<F, P>
where
    F: Fetcher,
    P: Paginator + 'static,
{
    pub fn new(
        resource: ResourceDefinition,
        fetcher: Arc<F>,
        paginator: Arc<P>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resource: Arc::new(resource),
            fetcher,
            paginator,
            retry,
            cancel,
        }
    }

    pub fn resource(&self) -> &ResourceDefinition {
        &self.resource
    }

    /// Turn the extractor into a lazy stream of page batches
    pub fn into_stream(self) -> impl Stream<Item = Result<LoadBatch, ExtractError>> + Send {
        let first = self.paginator.next(&self.resource, None);
        let state = ExtractionState::new(first);

        stream::unfold((self, state), |(this, mut state)| async move {
            match this.next_batch(&mut state).await {
                Some(item) => Some((item, (this, state))),
                None => None,
            }
        })
    }

    async fn next_batch(
        &self,
        state: &mut ExtractionState,
    ) -> Option<Result<LoadBatch, ExtractError>> {
        loop {
            if state.exhausted {
                return None;
            }

            let request = match std::mem::replace(&mut state.pending, PageStep::Done) {
                PageStep::Request(request) => request,
                PageStep::Done => {
                    if state.finish() {
                        log::debug!(
                            "'{}' exhausted after page {}",
                            self.resource.name,
                            state.current_page
                        );
                    }
                    return None;
                }
            };

            if request.page_number <= state.current_page {
                let previous = state.current_page;
                state.finish();
                return Some(Err(ExtractError::Pagination {
                    previous,
                    next: request.page_number,
                }));
            }

            if self.cancel.is_cancelled() {
                state.finish();
                return Some(Err(ExtractError::Cancelled {
                    page: request.page_number,
                }));
            }

            state.current_page = request.page_number;

            let mut response = match self.fetch_with_retry(&request).await {
                Ok(response) => response,
                Err(e) => {
                    state.finish();
                    return Some(Err(e));
                }
            };

            self.paginator.inspect(&mut response);
            state.pending = self
                .paginator
                .next(&self.resource, Some((&request, &response)));

            if response.records.is_empty() {
                log::trace!(
                    "'{}' page {} is empty",
                    self.resource.name,
                    request.page_number
                );
                continue;
            }

            return Some(Ok(LoadBatch::new(
                &self.resource,
                request.page_number,
                response.records,
            )));
        }
    }

    /// Fetch one page, retrying transient failures with backoff
    ///
    /// Cancellation wins over an in-flight fetch; the page is then discarded.
    async fn fetch_with_retry(&self, request: &PageRequest) -> Result<PageResponse, ExtractError> {
        let cancelled = || ExtractError::Cancelled {
            page: request.page_number,
        };
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(cancelled()),
                result = self.fetcher.fetch(request) => result,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e @ FetchError::Transient(_)) if attempt < self.retry.max_attempts() => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "'{}' page {} attempt {}/{} failed, retrying in {:?}: {}",
                        self.resource.name,
                        request.page_number,
                        attempt,
                        self.retry.max_attempts(),
                        delay,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e @ FetchError::Transient(_)) => {
                    return Err(ExtractError::RetriesExhausted {
                        page: request.page_number,
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::etl::PageNumberPaginator;
    use futures::StreamExt;
    use serde_json::{Value, json};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fetcher replaying scripted pages; unscripted pages are empty
    #[derive(Default)]
    struct ScriptedFetcher {
        pages: Mutex<HashMap<u32, VecDeque<Result<Vec<Value>, FetchError>>>>,
        requested: Mutex<Vec<u32>>,
    }

    impl ScriptedFetcher {
        fn page(self, page: u32, outcome: Result<Vec<Value>, FetchError>) -> Self {
            self.pages
                .lock()
                .unwrap()
                .entry(page)
                .or_default()
                .push_back(outcome);
            self
        }

        fn requested(&self) -> Vec<u32> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
            self.requested.lock().unwrap().push(request.page_number);
            let outcome = self
                .pages
                .lock()
                .unwrap()
                .get_mut(&request.page_number)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Ok(Vec::new()));
            outcome.map(|values| {
                PageResponse::new(
                    values
                        .into_iter()
                        .map(|v| v.as_object().cloned().unwrap())
                        .collect(),
                )
            })
        }
    }

    fn extractor(
        fetcher: Arc<ScriptedFetcher>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> ResourceExtractor<ScriptedFetcher, PageNumberPaginator> {
        ResourceExtractor::new(
            ResourceDefinition::new("customers", "/customers"),
            fetcher,
            Arc::new(PageNumberPaginator::default()),
            retry,
            cancel,
        )
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    async fn collect(
        extractor: ResourceExtractor<ScriptedFetcher, PageNumberPaginator>,
    ) -> Vec<Result<LoadBatch, ExtractError>> {
        extractor.into_stream().collect().await
    }

    #[tokio::test]
    async fn test_batches_in_page_order() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .page(1, Ok(vec![json!({"id": 1}), json!({"id": 2})]))
                .page(2, Ok(vec![json!({"id": 3})])),
        );

        let batches = collect(extractor(fetcher.clone(), fast_retry(1), CancellationToken::new())).await;
        let batches: Vec<LoadBatch> = batches.into_iter().map(|b| b.unwrap()).collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].page_number, 1);
        assert_eq!(batches[0].records[0]["id"], 1);
        assert_eq!(batches[0].records[1]["id"], 2);
        assert_eq!(batches[1].page_number, 2);
        // One extra request for the empty page that ends extraction
        assert_eq!(fetcher.requested(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_first_page() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let batches = collect(extractor(fetcher.clone(), fast_retry(1), CancellationToken::new())).await;
        assert!(batches.is_empty());
        assert_eq!(fetcher.requested(), vec![1]);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_on_same_page() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .page(1, Ok(vec![json!({"id": 1})]))
                .page(2, Ok(vec![json!({"id": 2})]))
                .page(3, Err(FetchError::Transient("503".to_string())))
                .page(3, Err(FetchError::Transient("timeout".to_string())))
                .page(3, Ok(vec![json!({"id": 3})])),
        );

        let batches = collect(extractor(fetcher.clone(), fast_retry(5), CancellationToken::new())).await;
        let pages: Vec<u32> = batches.into_iter().map(|b| b.unwrap().page_number).collect();

        assert_eq!(pages, vec![1, 2, 3]);
        assert_eq!(fetcher.requested(), vec![1, 2, 3, 3, 3, 4]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .page(1, Err(FetchError::Transient("503".to_string())))
                .page(1, Err(FetchError::Transient("503".to_string()))),
        );

        let batches = collect(extractor(fetcher.clone(), fast_retry(2), CancellationToken::new())).await;
        assert_eq!(batches.len(), 1);
        let err = batches.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ExtractError::RetriesExhausted {
                page: 1,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::TransientHttp);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried_and_ends_stream() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .page(1, Ok(vec![json!({"id": 1})]))
                .page(2, Err(FetchError::Fatal("404".to_string()))),
        );

        let batches = collect(extractor(fetcher.clone(), fast_retry(5), CancellationToken::new())).await;
        assert_eq!(batches.len(), 2);
        assert!(batches[0].is_ok());
        assert_eq!(
            batches[1].as_ref().unwrap_err().kind(),
            ErrorKind::FatalHttp
        );
        assert_eq!(fetcher.requested(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fetcher = Arc::new(ScriptedFetcher::default().page(1, Ok(vec![json!({"id": 1})])));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batches = collect(extractor(fetcher.clone(), fast_retry(1), cancel)).await;
        assert_eq!(batches.len(), 1);
        assert!(matches!(
            batches[0],
            Err(ExtractError::Cancelled { page: 1 })
        ));
        assert!(fetcher.requested().is_empty());
    }

    /// Paginator that repeats page 1 forever
    struct StuckPaginator;

    impl Paginator for StuckPaginator {
        fn inspect(&self, response: &mut PageResponse) {
            response.has_more = true;
        }

        fn next(
            &self,
            resource: &Arc<ResourceDefinition>,
            _previous: Option<(&PageRequest, &PageResponse)>,
        ) -> PageStep {
            PageStep::Request(PageRequest {
                resource: Arc::clone(resource),
                page_number: 1,
                params: Default::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_page_reuse_rejected() {
        let fetcher = Arc::new(ScriptedFetcher::default().page(1, Ok(vec![json!({"id": 1})])));
        let extractor = ResourceExtractor::new(
            ResourceDefinition::new("orders", "/orders"),
            fetcher.clone(),
            Arc::new(StuckPaginator),
            fast_retry(1),
            CancellationToken::new(),
        );

        let batches: Vec<_> = extractor.into_stream().collect().await;
        assert_eq!(batches.len(), 2);
        assert!(matches!(
            batches[1],
            Err(ExtractError::Pagination {
                previous: 1,
                next: 1
            })
        ));
        assert_eq!(fetcher.requested(), vec![1]);
    }
}
