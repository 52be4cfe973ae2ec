//! Integration tests for HTTP page fetching against a mock server

use eyre::Result;
use jaffle_pipeline::client::{Auth, RestClient};
use jaffle_pipeline::config::PipelineConfig;
use jaffle_pipeline::etl::{
    Coordinator, Fetcher, HttpFetcher, PageNumberPaginator, PageStep, Paginator, RunOutcome,
};
use jaffle_pipeline::resource::{ResourceDefinition, WritePolicy};
use jaffle_pipeline::storage::{DatasetReader, DatasetWriter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path, query_param},
};

fn fetcher(server: &MockServer, auth: Auth) -> Result<HttpFetcher> {
    let url = Url::parse(&format!("{}/api/v1", server.uri()))?;
    Ok(HttpFetcher::new(RestClient::try_new(
        url,
        auth,
        Duration::from_secs(5),
    )?))
}

async fn fetch_page(
    fetcher: &HttpFetcher,
    resource: ResourceDefinition,
) -> Result<jaffle_pipeline::etl::PageResponse, jaffle_pipeline::error::FetchError> {
    let paginator = PageNumberPaginator::default();
    let PageStep::Request(request) = paginator.next(&Arc::new(resource), None) else {
        unreachable!("first step is always a request");
    };
    fetcher.fetch(&request).await
}

#[tokio::test]
async fn test_fetch_sends_page_param_and_decodes_array() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/customers"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "c1"}, {"id": "c2"}])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher(&server, Auth::None)?;
    let page = fetch_page(&fetcher, ResourceDefinition::new("customers", "/customers")).await?;

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0]["id"], "c1");
    assert_eq!(page.records[1]["id"], "c2");

    Ok(())
}

#[tokio::test]
async fn test_fetch_object_with_data_selector() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/stores"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 1,
            "stores": [{"id": "s1", "name": "Philadelphia"}],
        })))
        .mount(&server)
        .await;

    let fetcher = fetcher(&server, Auth::None)?;
    let page = fetch_page(
        &fetcher,
        ResourceDefinition::new("stores", "/stores").with_data_selector("stores"),
    )
    .await?;

    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0]["name"], "Philadelphia");

    Ok(())
}

#[tokio::test]
async fn test_status_classification() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(path("/api/v1/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/broken"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let fetcher = fetcher(&server, Auth::None)?;

    let flaky = fetch_page(&fetcher, ResourceDefinition::new("flaky", "/flaky")).await;
    assert!(flaky.unwrap_err().is_transient());

    let missing = fetch_page(&fetcher, ResourceDefinition::new("missing", "/missing")).await;
    let err = missing.unwrap_err();
    assert!(!err.is_transient());
    assert!(err.to_string().contains("404"));

    let broken = fetch_page(&fetcher, ResourceDefinition::new("broken", "/broken")).await;
    assert!(!broken.unwrap_err().is_transient());

    Ok(())
}

#[tokio::test]
async fn test_bearer_auth_header_sent() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(path("/api/v1/orders"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher(&server, Auth::Bearer("s3cret".to_string()))?;
    let page = fetch_page(&fetcher, ResourceDefinition::new("orders", "/orders")).await?;
    assert!(page.records.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_full_run_against_mock_api() -> Result<()> {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new()?;

    // customers: two pages, with two 500s on page 2 before it succeeds
    Mock::given(path("/api/v1/customers"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])))
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/customers"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/customers"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 3}])))
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/customers"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    // products: one page, then empty
    Mock::given(path("/api/v1/products"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "p1"}])))
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/products"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    // orders: forbidden
    Mock::given(path("/api/v1/orders"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let mut config = PipelineConfig::default()
        .with_base_url(Url::parse(&format!("{}/api/v1", server.uri()))?)
        .with_destination_dir(temp_dir.path())
        .with_worker_count(2);
    config.backoff_base = Duration::from_millis(1);
    config.backoff_max = Duration::from_millis(5);

    let fetcher = fetcher(&server, Auth::None)?;
    let sink = Arc::new(DatasetWriter::from_config(&config)?);
    let resources = vec![
        ResourceDefinition::new("customers", "/customers"),
        ResourceDefinition::new("orders", "/orders"),
        ResourceDefinition::new("products", "/products").with_write_policy(WritePolicy::Replace),
    ];
    let run = Coordinator::new(Arc::new(fetcher), sink, &config)
        .run(&resources)
        .await;

    assert_eq!(run.outcome(), RunOutcome::Partial);
    assert_eq!(run.trace().failed(), vec!["orders"]);
    assert_eq!(run.trace().resource("customers").unwrap().records, 3);

    let reader = DatasetReader::from_config(&config);
    let customers: Vec<_> = reader
        .read_table("customers")?
        .iter()
        .filter_map(|r| r["id"].as_i64())
        .collect();
    assert_eq!(customers, vec![1, 2, 3]);
    assert_eq!(reader.count("products")?, 1);

    Ok(())
}
