//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use threatscan::client::{FileUploader, RetryExecutor};
use threatscan::config::{ClientConfig, Config};
use threatscan::transport::HttpTransport;
use threatscan::ThreatIntelClient;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

/// Submission response body used by mocked upload endpoints
pub const ANALYSIS_HANDLE_BODY: &str = r#"{"data":{"type":"analysis","id":"an-test"}}"#;

/// Create a configuration pointing at a mock server, with instant retries
pub fn create_test_config(server_uri: &str) -> Config {
    let mut config = Config::default();
    config.client = ClientConfig {
        base_url: server_uri.to_string(),
        api_key: Some("test-key".to_string()),
        user_agent: None,
        timeout_secs: 10,
        upload_timeout_secs: None,
    };
    config.retry.max_retries = 3;
    config.retry.default_retry_delay_secs = 0;
    config
}

/// Create a client against a mock server
pub fn create_test_client(server_uri: &str) -> ThreatIntelClient {
    ThreatIntelClient::from_config(&create_test_config(server_uri))
        .expect("Failed to create test client")
}

/// Create an uploader against a mock server
pub fn create_test_uploader(config: &Config) -> Arc<FileUploader> {
    let transport =
        HttpTransport::new(&config.client).expect("Failed to create test transport");
    Arc::new(FileUploader::new(
        Arc::new(transport),
        config.upload.clone(),
        RetryExecutor::from(&config.retry),
    ))
}

/// Poll the mock server until it has received `count` requests
pub async fn wait_for_requests(server: &MockServer, count: usize, timeout: Duration) -> Vec<Request> {
    let deadline = Instant::now() + timeout;
    loop {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= count || Instant::now() >= deadline {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Responder recording when each request arrived
#[derive(Clone, Default)]
pub struct RecordingResponder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
    delay: Option<Duration>,
}

impl RecordingResponder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn arrivals(&self) -> Vec<Instant> {
        self.arrivals.lock().expect("arrivals lock poisoned").clone()
    }
}

impl Respond for RecordingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals
            .lock()
            .expect("arrivals lock poisoned")
            .push(Instant::now());
        let template = ResponseTemplate::new(200).set_body_string(ANALYSIS_HANDLE_BODY);
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}
