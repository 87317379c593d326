//! Search-store boundary.
//!
//! The engine only needs one operation from the data store: run a rendered
//! query body against an index and hand back the structured response. The
//! trait keeps the engine testable without a live cluster.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueryError;

/// Executes one search per rule evaluation.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, index: &str, body: &str) -> Result<Value, QueryError>;
}

/// HTTP client posting to `{base_url}/{index}/_search`.
#[derive(Debug, Clone)]
pub struct HttpSearchClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSearchClient {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        HttpSearchClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, index: &str, body: &str) -> Result<Value, QueryError> {
        // The body was rendered from a template; make sure it is still
        // valid JSON before it goes on the wire.
        let body: Value = serde_json::from_str(body)
            .map_err(|e| QueryError::InvalidBody(e.to_string()))?;

        let url = format!("{}/{}/_search", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| QueryError::Request(format!("bad response body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_body_to_index_search_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics-2024/_search"))
            .and(body_partial_json(json!({"size": 0})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"hits": {"total": 3}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpSearchClient::new(server.uri(), reqwest::Client::new());
        let response = client
            .search("metrics-2024", "{\"size\": 0}")
            .await
            .unwrap();
        assert_eq!(response["hits"]["total"], 3);
    }

    #[tokio::test]
    async fn trailing_slash_in_base_url_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/idx/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            HttpSearchClient::new(format!("{}/", server.uri()), reqwest::Client::new());
        client.search("idx", "{}").await.unwrap();
    }

    #[tokio::test]
    async fn http_error_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = HttpSearchClient::new(server.uri(), reqwest::Client::new());
        let err = client.search("idx", "{}").await.unwrap_err();
        match err {
            QueryError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn invalid_rendered_body_never_hits_the_wire() {
        let client = HttpSearchClient::new("http://127.0.0.1:1", reqwest::Client::new());
        let err = client.search("idx", "{not json").await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidBody(_)));
    }
}
