//! Elasticsearch backend over the REST API
//!
//! Bulk writes go to `POST /_bulk` as NDJSON `index` actions, so re-sending a
//! document id overwrites the stored document. Requests that fail at the
//! transport level, or with 429/5xx, are retried with a linear backoff and
//! rotated across the configured hosts.

use async_trait::async_trait;
use isis_common::{IsisError, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BulkOutcome, ItemResult, SearchBackend};
use crate::config::BackendConfig;
use crate::record::WriteOperation;

/// Elasticsearch 8.x REST client
pub struct ElasticsearchBackend {
    client: Client,
    hosts: Vec<Url>,
    next_host: AtomicUsize,
    config: BackendConfig,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_source")]
    source: Option<Value>,
}

impl ElasticsearchBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        let hosts = config
            .hosts
            .iter()
            .map(|host| {
                Url::parse(host)
                    .map_err(|e| IsisError::config(format!("invalid host '{}': {}", host, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IsisError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            hosts,
            next_host: AtomicUsize::new(0),
            config,
        })
    }

    fn url(&self, host: &Url, segments: &[&str]) -> Result<Url> {
        let mut url = host.clone();
        url.path_segments_mut()
            .map_err(|_| IsisError::config(format!("host '{}' cannot be a base URL", host)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(ref key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", key))
        } else if let Some(ref user) = self.config.username {
            request.basic_auth(user, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// Send a request, retrying on transport errors, 429 and 5xx
    ///
    /// Any other status is returned to the caller for interpretation.
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Body<'_>>,
    ) -> Result<Response> {
        let attempts = self.config.max_retries;
        let first = self.next_host.fetch_add(1, Ordering::Relaxed);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let host = &self.hosts[first.wrapping_add(attempt as usize - 1) % self.hosts.len()];
            let url = self.url(host, segments)?;
            debug!(%method, %url, attempt, "Backend request");

            let mut request = self.authorize(self.client.request(method.clone(), url));
            request = match &body {
                Some(Body::Json(value)) => request.json(*value),
                Some(Body::NdJson(text)) => request
                    .header("Content-Type", "application/x-ndjson")
                    .body(text.clone()),
                None => request,
            };

            match request.send().await {
                Ok(response) if is_retryable(response.status()) => {
                    last_error = format!("HTTP {}", response.status());
                },
                Ok(response) => return Ok(response),
                Err(e) => {
                    last_error = e.to_string();
                },
            }

            if attempt < attempts {
                let delay = self.config.retry_delay_ms * u64::from(attempt);
                warn!(
                    "Backend request attempt {}/{} failed: {}. Retrying in {}ms...",
                    attempt, attempts, last_error, delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(IsisError::network(format!(
            "{} /{} failed after {} attempts: {}",
            method,
            segments.join("/"),
            attempts,
            last_error
        )))
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let response = self.send(Method::HEAD, &[collection], None).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(backend_error(response).await),
        }
    }
}

enum Body<'a> {
    Json(&'a Value),
    NdJson(String),
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn backend_error(response: Response) -> IsisError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
    IsisError::Backend { status, message }
}

/// Render operations as `_bulk` NDJSON: one action line, one source line each
fn bulk_body(operations: &[WriteOperation]) -> Result<String> {
    let mut body = String::new();
    for op in operations {
        let action = json!({"index": {"_index": op.collection, "_id": op.document_id}});
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&op.document)?);
        body.push('\n');
    }
    Ok(body)
}

fn item_error(error: &Value) -> String {
    match (error.get("type"), error.get("reason")) {
        (Some(kind), Some(reason)) => format!(
            "{}: {}",
            kind.as_str().unwrap_or_default(),
            reason.as_str().unwrap_or_default()
        ),
        _ => error.to_string(),
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    async fn ensure_collection(&self, collection: &str, mappings: &Value) -> Result<()> {
        if self.collection_exists(collection).await? {
            debug!(collection, "Collection already exists");
            return Ok(());
        }

        let body = json!({
            "settings": {
                "number_of_shards": self.config.shards,
                "number_of_replicas": self.config.replicas,
                "refresh_interval": self.config.refresh_interval,
            },
            "mappings": mappings,
        });

        let response = self
            .send(Method::PUT, &[collection], Some(Body::Json(&body)))
            .await?;

        if response.status().is_success() {
            info!(
                collection,
                shards = self.config.shards,
                replicas = self.config.replicas,
                "Created collection"
            );
            return Ok(());
        }

        match backend_error(response).await {
            // Another builder created it between our HEAD and PUT
            IsisError::Backend { message, .. }
                if message.contains("resource_already_exists_exception") =>
            {
                Ok(())
            },
            err => Err(err),
        }
    }

    async fn bulk(&self, operations: &[WriteOperation]) -> Result<BulkOutcome> {
        if operations.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let body = bulk_body(operations)?;
        let response = self
            .send(Method::POST, &["_bulk"], Some(Body::NdJson(body)))
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response).await);
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| IsisError::network(format!("unreadable bulk response: {}", e)))?;

        let mut returned = parsed.items.into_iter();
        let items = operations
            .iter()
            .map(|op| {
                let Some(item) = returned.next().and_then(|m| m.into_values().next()) else {
                    return ItemResult::failed(&op.document_id, "missing from bulk response");
                };
                let id = item.id.unwrap_or_else(|| op.document_id.clone());
                match item.error {
                    Some(ref error) => ItemResult::failed(id, item_error(error)),
                    None if item.status >= 300 => {
                        ItemResult::failed(id, format!("HTTP {}", item.status))
                    },
                    None => ItemResult::ok(id),
                }
            })
            .collect();

        Ok(BulkOutcome { items })
    }

    async fn refresh(&self, collection: &str) -> Result<()> {
        let response = self
            .send(Method::POST, &[collection, "_refresh"], None)
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response).await);
        }
        Ok(())
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let response = self
            .send(Method::GET, &[collection, "_doc", id], None)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let parsed: GetResponse = response.json().await.map_err(|e| {
                    IsisError::network(format!("unreadable document response: {}", e))
                })?;
                Ok(parsed.source)
            },
            _ => Err(backend_error(response).await),
        }
    }

    async fn put_document(&self, collection: &str, id: &str, document: &Value) -> Result<()> {
        let response = self
            .send(Method::PUT, &[collection, "_doc", id], Some(Body::Json(document)))
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::record_mappings;
    use crate::record::Record;
    use wiremock::matchers::{body_partial_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer) -> ElasticsearchBackend {
        ElasticsearchBackend::new(BackendConfig {
            hosts: vec![server.uri()],
            retry_delay_ms: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn op(id: &str, title: &str) -> WriteOperation {
        WriteOperation::upsert("corpus", Record::new(id, title).with_year("2024"))
    }

    #[test]
    fn test_bulk_body_format() {
        let body = bulk_body(&[op("10.1/a", "First")]).unwrap();
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 2);
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action, json!({"index": {"_index": "corpus", "_id": "10.1/a"}}));
        let source: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["title"], "First");
        assert_eq!(source["year"], "2024");
        assert!(body.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_bulk_reports_per_item_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 3,
                "errors": true,
                "items": [
                    {"index": {"_id": "a", "status": 201}},
                    {"index": {"_id": "b", "status": 400, "error": {
                        "type": "mapper_parsing_exception",
                        "reason": "failed to parse field [year]"
                    }}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = backend_for(&server)
            .bulk(&[op("a", "t"), op("b", "t")])
            .await
            .unwrap();

        assert_eq!(outcome.succeeded(), 1);
        let failure = outcome.failures().next().unwrap();
        assert_eq!(failure.document_id, "b");
        assert!(failure
            .error
            .as_deref()
            .unwrap()
            .starts_with("mapper_parsing_exception"));
    }

    #[tokio::test]
    async fn test_bulk_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "items": [{"index": {"_id": "a", "status": 200}}]
            })))
            .mount(&server)
            .await;

        let outcome = backend_for(&server).bulk(&[op("a", "t")]).await.unwrap();
        assert_eq!(outcome.succeeded(), 1);
    }

    #[tokio::test]
    async fn test_bulk_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = backend_for(&server)
            .bulk(&[op("a", "t")])
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let backend = ElasticsearchBackend::new(BackendConfig {
            hosts: vec!["http://127.0.0.1:9".to_string()],
            max_retries: 2,
            retry_delay_ms: 1,
            ..Default::default()
        })
        .unwrap();

        let err = backend.refresh("corpus").await.unwrap_err();
        assert!(matches!(err, IsisError::Network(_)));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(401).set_body_string("missing authentication"))
            .expect(1)
            .mount(&server)
            .await;

        let err = backend_for(&server)
            .bulk(&[op("a", "t")])
            .await
            .unwrap_err();
        assert!(matches!(err, IsisError::Backend { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_ensure_collection_creates_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/corpus"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/corpus"))
            .and(body_partial_json(json!({
                "settings": {"number_of_shards": 5, "number_of_replicas": 1},
                "mappings": {"properties": {"id": {"type": "keyword"}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;

        backend_for(&server)
            .ensure_collection("corpus", &record_mappings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_collection_skips_existing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/corpus"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        backend_for(&server)
            .ensure_collection("corpus", &record_mappings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_isis_meta/_doc/progress_corpus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_index": "_isis_meta",
                "_id": "progress_corpus",
                "found": true,
                "_source": {"collection_name": "corpus"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_isis_meta/_doc/progress_other"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let doc = backend
            .get_document("_isis_meta", "progress_corpus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["collection_name"], "corpus");
        assert!(backend
            .get_document("_isis_meta", "progress_other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/corpus/_refresh"))
            .and(header("Authorization", "ApiKey c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = ElasticsearchBackend::new(BackendConfig {
            hosts: vec![server.uri()],
            api_key: Some("c2VjcmV0".to_string()),
            ..Default::default()
        })
        .unwrap();
        backend.refresh("corpus").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_document_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_isis_meta/_doc/progress_corpus"))
            .and(body_string(r#"{"collection_name":"corpus"}"#))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        backend_for(&server)
            .put_document(
                "_isis_meta",
                "progress_corpus",
                &json!({"collection_name": "corpus"}),
            )
            .await
            .unwrap();
    }
}
