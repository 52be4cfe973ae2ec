//! REST API client
//!
//! Thin wrapper around a shared `reqwest::Client` bound to an API base URL.
//! Cloning is cheap and clones share one connection pool, so every worker
//! gets its own handle.

use super::Auth;
use crate::error::FetchError;

use eyre::Result;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// REST client for paginated GET requests.
///
/// # Example
/// ```no_run
/// use jaffle_pipeline::client::{Auth, RestClient};
/// use std::collections::BTreeMap;
/// use std::time::Duration;
/// use url::Url;
///
/// # async fn example() -> eyre::Result<()> {
/// let url = Url::parse("https://jaffle-shop.scalevector.ai/api/v1")?;
/// let client = RestClient::try_new(url, Auth::None, Duration::from_secs(30))?;
///
/// let mut query = BTreeMap::new();
/// query.insert("page".to_string(), "1".to_string());
/// let response = client.get("/customers", &query).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RestClient {
    client: Client,
    url: Url,
}

impl RestClient {
    /// Create a new client for an API base URL.
    ///
    /// The base URL is treated as a directory: endpoint paths are resolved
    /// below it, so `https://host/api/v1` + `/customers` becomes
    /// `https://host/api/v1/customers`.
    ///
    /// # Errors
    /// Returns an error if the auth header is invalid or the HTTP client
    /// cannot be built
    pub fn try_new(mut url: Url, auth: Auth, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        auth.apply(&mut headers)?;

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        log::debug!("REST client for {} (auth: {})", url, auth);

        Ok(Self { client, url })
    }

    /// Get the base URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Resolve an endpoint path against the base URL
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        // Strip leading slash so the path stays below the base URL
        let path_stripped = path.strip_prefix('/').unwrap_or(path);
        self.url.join(path_stripped)
    }

    /// Send a GET request with query parameters.
    ///
    /// Only transport failures are reported here; status handling is left to
    /// the caller. Request-building failures are fatal, everything else on
    /// the wire (connect, timeout, reset) is transient.
    pub async fn get(
        &self,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<reqwest::Response, FetchError> {
        let url = self
            .endpoint(path)
            .map_err(|e| FetchError::Fatal(format!("Invalid endpoint path '{}': {}", path, e)))?;

        log::trace!("GET {} {:?}", url, query);

        self.client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    FetchError::Fatal(format!("Failed to build request: {}", e))
                } else {
                    FetchError::Transient(format!("Failed to send request: {}", e))
                }
            })
    }
}

impl std::fmt::Display for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}
