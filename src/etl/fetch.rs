//! Page fetching: one HTTP request per page, decoded into records

use super::paginate::{PageRequest, PageResponse, Record};
use crate::client::RestClient;
use crate::error::FetchError;

use reqwest::StatusCode;
use serde_json::Value;

/// Keys checked, in order, when a page is a JSON object without a configured selector
const RECORD_KEYS: &[&str] = &["data", "results", "items", "records"];

/// Fetcher trait for retrieving a single page
///
/// Implementors perform exactly one outbound request per call and do no
/// pagination or retry of their own.
///
/// # Example
/// ```no_run
/// use jaffle_pipeline::error::FetchError;
/// use jaffle_pipeline::etl::{Fetcher, PageRequest, PageResponse};
///
/// struct EmptyFetcher;
///
/// impl Fetcher for EmptyFetcher {
///     async fn fetch(&self, _request: &PageRequest) -> Result<PageResponse, FetchError> {
///         Ok(PageResponse::new(Vec::new()))
///     }
/// }
/// ```
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch the page described by `request`
    ///
    /// # Errors
    /// `FetchError::Transient` for failures worth retrying,
    /// `FetchError::Fatal` for everything else
    fn fetch(
        &self,
        request: &PageRequest,
    ) -> impl std::future::Future<Output = Result<PageResponse, FetchError>> + Send;
}

/// Fetcher backed by the REST client
///
/// Issues `GET {base_url}/{resource.path}?page={n}`.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: RestClient,
}

impl HttpFetcher {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RestClient {
        &self.client
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
        let resource = &request.resource;

        log::debug!(
            "Fetching '{}' page {} from {}",
            resource.name,
            request.page_number,
            resource.path
        );

        let response = self.client.get(&resource.path, &request.params).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!(
                "GET {} page {} returned {}: {}",
                resource.path, request.page_number, status, body
            );
            return Err(classify_status(status, message));
        }

        let body = response.bytes().await.map_err(|e| {
            FetchError::Transient(format!(
                "Failed to read '{}' page {}: {}",
                resource.name, request.page_number, e
            ))
        })?;

        let value: Value = serde_json::from_slice(&body).map_err(|e| {
            FetchError::Fatal(format!(
                "Failed to parse '{}' page {} as JSON: {}",
                resource.name, request.page_number, e
            ))
        })?;

        let records = decode_records(value, resource.data_selector.as_deref())?;

        log::debug!(
            "Fetched {} record(s) from '{}' page {}",
            records.len(),
            resource.name,
            request.page_number
        );

        Ok(PageResponse::new(records))
    }
}

/// Map a non-success status to a fetch error
pub fn classify_status(status: StatusCode, message: String) -> FetchError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::Transient(message)
    } else {
        FetchError::Fatal(message)
    }
}

/// Decode a page body into records, preserving source order
///
/// Accepts a JSON array of objects, or an object holding such an array under
/// `selector`, one of the common record keys, or its only array field.
pub fn decode_records(value: Value, selector: Option<&str>) -> Result<Vec<Record>, FetchError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => {
            let key = match selector {
                Some(key) => key.to_string(),
                None => find_record_key(&object).ok_or_else(|| {
                    FetchError::Fatal(format!(
                        "Response object has no record array (keys: {})",
                        object.keys().cloned().collect::<Vec<_>>().join(", ")
                    ))
                })?,
            };
            match object.remove(&key) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(FetchError::Fatal(format!(
                        "Field '{}' is not an array: {}",
                        key,
                        type_name(&other)
                    )));
                }
                None => {
                    return Err(FetchError::Fatal(format!(
                        "Response object has no field '{}'",
                        key
                    )));
                }
            }
        }
        other => {
            return Err(FetchError::Fatal(format!(
                "Expected a JSON array or object, got {}",
                type_name(&other)
            )));
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record) => Ok(record),
            other => Err(FetchError::Fatal(format!(
                "Record {} is not an object: {}",
                index,
                type_name(&other)
            ))),
        })
        .collect()
}

fn find_record_key(object: &serde_json::Map<String, Value>) -> Option<String> {
    if let Some(key) = RECORD_KEYS
        .iter()
        .find(|k| matches!(object.get(**k), Some(Value::Array(_))))
    {
        return Some(key.to_string());
    }

    let mut arrays = object.iter().filter(|(_, v)| v.is_array());
    match (arrays.next(), arrays.next()) {
        (Some((key, _)), None) => Some(key.clone()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(records: &[Record]) -> Vec<i64> {
        records.iter().map(|r| r["id"].as_i64().unwrap()).collect()
    }

    #[test]
    fn test_decode_array_preserves_order() {
        let records = decode_records(json!([{"id": 3}, {"id": 1}, {"id": 2}]), None).unwrap();
        assert_eq!(ids(&records), vec![3, 1, 2]);
    }

    #[test]
    fn test_decode_object_with_selector() {
        let body = json!({"page": 1, "payload": [{"id": 1}], "data": [{"id": 9}]});
        let records = decode_records(body, Some("payload")).unwrap();
        assert_eq!(ids(&records), vec![1]);
    }

    #[test]
    fn test_decode_object_common_key() {
        let body = json!({"meta": {"page": 2}, "results": [{"id": 5}, {"id": 6}]});
        let records = decode_records(body, None).unwrap();
        assert_eq!(ids(&records), vec![5, 6]);
    }

    #[test]
    fn test_decode_object_single_array_field() {
        let body = json!({"count": 1, "customers": [{"id": 7}]});
        let records = decode_records(body, None).unwrap();
        assert_eq!(ids(&records), vec![7]);
    }

    #[test]
    fn test_decode_ambiguous_object_is_fatal() {
        let body = json!({"a": [{"id": 1}], "b": [{"id": 2}]});
        let err = decode_records(body, None).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode_records(json!("nope"), None).is_err());
        assert!(decode_records(json!([1, 2]), None).is_err());
        assert!(decode_records(json!({"data": {"id": 1}}), Some("data")).is_err());
        assert!(decode_records(json!({"data": []}), Some("rows")).is_err());
    }

    #[test]
    fn test_decode_empty_page() {
        assert!(decode_records(json!([]), None).unwrap().is_empty());
        assert!(decode_records(json!({"data": []}), None).unwrap().is_empty());
    }

    #[test]
    fn test_classify_status() {
        let msg = || "boom".to_string();
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, msg()).is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, msg()).is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, msg()).is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, msg()).is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, msg()).is_transient());
    }
}
