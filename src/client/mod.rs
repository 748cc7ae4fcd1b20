//! Threat-intelligence API client
//!
//! [`ThreatIntelClient`] ties the transport to the retry executor, the pager
//! and the upload builder. Every read goes through rate-limit retries; file
//! uploads retry only their upload-URL lookup.

pub mod analysis;
pub mod classify;
pub mod pager;
pub mod resource;
pub mod retry;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{AnalysisConfig, Config};
use crate::error::{require_non_empty, ClientError};
use crate::transport::{ApiRequest, HttpTransport, Transport};

pub use analysis::{Analysis, AnalysisHandle, AnalysisStatus};
pub use pager::Page;
pub use resource::ResourceKind;
pub use retry::{execute_with_retry, RetryExecutor};
pub use upload::{FileUploader, UploadSource};

use analysis::AnalysisObject;
use pager::ListEnvelope;

/// `{"data": ...}` response wrapper
#[derive(Debug, Deserialize)]
pub(crate) struct DataEnvelope<T> {
    pub data: T,
}

/// High-level API client
#[derive(Clone)]
pub struct ThreatIntelClient {
    transport: Arc<dyn Transport>,
    retry: RetryExecutor,
    uploader: Arc<FileUploader>,
    analysis: AnalysisConfig,
}

impl ThreatIntelClient {
    /// Build a client with an HTTP transport from configuration
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.client)?);
        Ok(Self::with_transport(transport, config))
    }

    /// Build a client on an existing transport
    pub fn with_transport(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let retry = RetryExecutor::from(&config.retry);
        let uploader = Arc::new(FileUploader::new(
            transport.clone(),
            config.upload.clone(),
            retry.clone(),
        ));
        Self {
            transport,
            retry,
            uploader,
            analysis: config.analysis.clone(),
        }
    }

    /// Shared uploader, e.g. for the directory scan service
    pub fn uploader(&self) -> Arc<FileUploader> {
        self.uploader.clone()
    }

    /// GET a path and decode the whole body, retrying on rate limits
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T, ClientError> {
        let transport = &self.transport;
        self.retry
            .execute(
                || async move {
                    let mut request = ApiRequest::get(path);
                    for (key, value) in query {
                        request = request.with_query(key, value);
                    }
                    transport
                        .send(request, cancel)
                        .await?
                        .error_for_status()?
                        .json()
                },
                cancel,
            )
            .await
    }

    /// Fetch one object and return its `data` payload
    pub async fn get_object(
        &self,
        kind: ResourceKind,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ClientError> {
        let path = kind.object_path(id)?;
        let envelope: DataEnvelope<serde_json::Value> = self.get_json(&path, &[], cancel).await?;
        Ok(envelope.data)
    }

    /// List a collection, optionally following cursors to the end
    pub async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        limit: Option<u32>,
        cursor: Option<String>,
        fetch_all: bool,
        cancel: &CancellationToken,
    ) -> Result<Page<T>, ClientError> {
        pager::collect(
            |cursor, limit| async move {
                let mut query = Vec::new();
                if let Some(limit) = limit {
                    query.push(("limit", limit.to_string()));
                }
                if let Some(cursor) = cursor {
                    query.push(("cursor", cursor));
                }
                let envelope: ListEnvelope<T> = self.get_json(path, &query, cancel).await?;
                Ok(Page::from(envelope))
            },
            limit,
            cursor,
            fetch_all,
        )
        .await
    }

    /// Request a one-time URL for uploads above the large-file threshold
    pub async fn get_upload_url(&self, cancel: &CancellationToken) -> Result<String, ClientError> {
        self.uploader.upload_url(cancel).await
    }

    /// Submit a file for scanning
    pub async fn submit_file(
        &self,
        source: UploadSource,
        file_name: &str,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisHandle, ClientError> {
        self.uploader
            .submit_file(source, file_name, password, cancel)
            .await
    }

    /// Fetch the current state of an analysis
    pub async fn get_analysis(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Analysis, ClientError> {
        let id = require_non_empty(Some(id), "analysis_id")?;
        let path = ResourceKind::Analysis.object_path(id)?;
        let envelope: DataEnvelope<AnalysisObject> = self.get_json(&path, &[], cancel).await?;
        Ok(envelope.data.into())
    }

    /// Poll an analysis until it is terminal or `timeout` elapses
    ///
    /// `None` falls back to the configured interval and budget.
    pub async fn wait_for_analysis(
        &self,
        id: &str,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Analysis, ClientError> {
        require_non_empty(Some(id), "analysis_id")?;
        analysis::poll_until_terminal(
            move || self.get_analysis(id, cancel),
            poll_interval.unwrap_or_else(|| Duration::from_secs(self.analysis.poll_interval_secs)),
            timeout.unwrap_or_else(|| Duration::from_secs(self.analysis.timeout_secs)),
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server_uri: &str) -> ThreatIntelClient {
        let mut config = Config::default();
        config.client = ClientConfig {
            base_url: server_uri.to_string(),
            api_key: Some("test-key".to_string()),
            user_agent: None,
            timeout_secs: 10,
            upload_timeout_secs: None,
        };
        config.retry.max_retries = 2;
        config.retry.default_retry_delay_secs = 0;
        ThreatIntelClient::from_config(&config).unwrap()
    }

    // Test 1: get_object returns the data payload
    #[tokio::test]
    async fn test_get_object() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domains/example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":{"id":"example.com","type":"domain","attributes":{"reputation":0}}}"#,
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let value = test_client(&mock_server.uri())
            .get_object(ResourceKind::Domain, "example.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["type"], "domain");
    }

    // Test 2: Not-found keeps the server's code and message
    #[tokio::test]
    async fn test_get_object_not_found() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/deadbeef"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                r#"{"error":{"code":"NotFoundError","message":"File \"deadbeef\" not found"}}"#,
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = test_client(&mock_server.uri())
            .get_object(ResourceKind::File, "deadbeef", &CancellationToken::new())
            .await;
        match result {
            Err(ClientError::Api(err)) => {
                assert_eq!(err.status, 404);
                assert_eq!(err.code.as_deref(), Some("NotFoundError"));
                assert_eq!(err.message, "File \"deadbeef\" not found");
            }
            other => panic!("Expected ClientError::Api, got {:?}", other),
        }
    }

    // Test 3: list follows cursors and forwards the limit
    #[tokio::test]
    async fn test_list_fetch_all() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections"))
            .and(query_param("cursor", "page2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"data":[{"id":"c"}],"meta":{}}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":[{"id":"a"},{"id":"b"}],"meta":{"cursor":"page2"}}"#,
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let page: Page<serde_json::Value> = test_client(&mock_server.uri())
            .list("collections", Some(2), None, true, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<&str> = page.data.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(page.next_cursor, None);
    }

    // Test 4: Rate-limited page fetches are retried
    #[tokio::test]
    async fn test_list_retries_rate_limited_page() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/comments"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":[{"id":"x"}],"meta":{"cursor":"more"}}"#,
            ))
            .mount(&mock_server)
            .await;

        let page: Page<serde_json::Value> = test_client(&mock_server.uri())
            .list("comments", None, None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("more"));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    // Test 5: wait_for_analysis polls until completed
    #[tokio::test]
    async fn test_wait_for_analysis() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/analyses/an-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":{"id":"an-1","type":"analysis","attributes":{"status":"queued"}}}"#,
            ))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/analyses/an-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":{"id":"an-1","type":"analysis","attributes":{"status":"completed","stats":{"malicious":1}}}}"#,
            ))
            .mount(&mock_server)
            .await;

        let analysis = test_client(&mock_server.uri())
            .wait_for_analysis(
                "an-1",
                Some(Duration::from_millis(10)),
                Some(Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Completed);
        assert_eq!(analysis.stats.unwrap()["malicious"], 1);
    }

    // Test 6: Blank analysis id is rejected before any request
    #[tokio::test]
    async fn test_wait_for_analysis_blank_id() {
        let client = test_client("http://127.0.0.1:9");
        let result = client
            .wait_for_analysis("", None, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
    }
}
