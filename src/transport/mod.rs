//! HTTP transport for the threat-intelligence API
//!
//! The [`Transport`] trait is the only seam the rest of the crate needs:
//! send one request, get status, headers and the buffered body back.
//! [`HttpTransport`] implements it on top of `reqwest` with a fixed base
//! address and default headers set once at construction.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::classify::classify_failure;
use crate::config::ClientConfig;
use crate::error::{require_non_empty, ArgumentError, ClientError};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-apikey";

/// Default user agent: `threatscan/<version>`
pub fn default_user_agent() -> String {
    format!("threatscan/{}", env!("CARGO_PKG_VERSION"))
}

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// Path relative to the configured base address
    Path(String),
    /// Fully qualified URL (e.g. a one-time upload URL)
    Absolute(String),
}

/// Request body variants
#[derive(Debug, Default)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// Streamed body of known length
    Stream {
        /// Body stream
        body: reqwest::Body,
        /// Content-Type header value
        content_type: String,
        /// Exact number of bytes the stream yields
        content_length: u64,
    },
}

/// A request handed to the transport
#[derive(Debug)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Target path or URL
    pub target: RequestTarget,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Per-request headers, added on top of the transport defaults
    pub headers: HeaderMap,
    /// Request body
    pub body: RequestBody,
}

impl ApiRequest {
    /// Create a request against a path relative to the base address
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            target: RequestTarget::Path(path.into()),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// GET request for a relative path
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request for a relative path
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// POST request for an absolute URL
    pub fn post_absolute(url: impl Into<String>) -> Self {
        Self {
            target: RequestTarget::Absolute(url.into()),
            ..Self::post(String::new())
        }
    }

    /// Add a query parameter
    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a header; invalid values are rejected as invalid arguments
    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self, ClientError> {
        let value = HeaderValue::from_str(value).map_err(|e| ArgumentError::Invalid {
            name,
            reason: e.to_string(),
        })?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    /// Attach a streamed body
    pub fn with_stream(mut self, body: reqwest::Body, content_type: String, length: u64) -> Self {
        self.body = RequestBody::Stream {
            body,
            content_type,
            content_length: length,
        };
        self
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Turn a non-success response into a typed failure
    pub fn error_for_status(self) -> Result<Self, ClientError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(classify_failure(self.status, &self.headers, &self.body))
        }
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::InvalidResponse(format!("Failed to decode body: {}", e)))
    }
}

/// Send a request, get status/headers/body back
///
/// Implementations must race the request against `cancel` and return
/// [`ClientError::Cancelled`] when it fires. Non-success statuses are
/// returned as responses, not errors; classification is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request
    async fn send(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ClientError>;
}

/// `reqwest`-backed transport
///
/// Buffered requests carry a total deadline. Streamed bodies only get one
/// when an upload deadline is configured, so large uploads over slow links
/// are not cut off.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    request_timeout: Option<Duration>,
    upload_timeout: Option<Duration>,
}

impl HttpTransport {
    /// Create a transport from client configuration
    ///
    /// The API key is required; the user agent falls back to
    /// [`default_user_agent`].
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let api_key = require_non_empty(config.api_key.as_deref(), "api_key")?;

        let mut headers = HeaderMap::new();
        let mut key_value = HeaderValue::from_str(api_key).map_err(|e| ArgumentError::Invalid {
            name: "api_key",
            reason: e.to_string(),
        })?;
        key_value.set_sensitive(true);
        headers.insert(HeaderName::from_static(API_KEY_HEADER), key_value);

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(default_user_agent);

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .default_headers(headers)
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ClientError::Network(format!("Failed to create HTTP client: {}", e)))?;

        let mut transport = Self::with_client(client, &config.base_url)?;
        transport.request_timeout = Some(timeout);
        transport.upload_timeout = config.upload_timeout_secs.map(Duration::from_secs);
        Ok(transport)
    }

    /// Create a transport with a custom reqwest Client
    ///
    /// No per-request deadlines are added; the client's own settings apply.
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            request_timeout: None,
            upload_timeout: None,
        })
    }

    /// The base address every relative path is joined onto
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resolve(&self, target: &RequestTarget) -> Result<Url, ClientError> {
        let resolved = match target {
            RequestTarget::Path(path) => self.base_url.join(path.trim_start_matches('/')),
            RequestTarget::Absolute(url) => Url::parse(url),
        };
        resolved.map_err(|e| {
            ClientError::InvalidArgument(ArgumentError::Invalid {
                name: "url",
                reason: e.to_string(),
            })
        })
    }

    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let url = self.resolve(&request.target)?;
        let method = request.method.clone();

        let mut builder = self
            .client
            .request(request.method, url.clone())
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        let deadline = match request.body {
            RequestBody::Empty => self.request_timeout,
            RequestBody::Stream { .. } => self.upload_timeout,
        };
        if let Some(deadline) = deadline {
            builder = builder.timeout(deadline);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Stream {
                body,
                content_type,
                content_length,
            } => builder
                .header(CONTENT_TYPE, content_type)
                .header(CONTENT_LENGTH, content_length)
                .body(body),
        };

        debug!(method = %method, url = %url, "Sending API request");

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), body_size = body.len(), "Received response");
        } else {
            warn!(url = %url, status = status.as_u16(), "API returned failure status");
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.execute(request) => result,
        }
    }
}

/// Ensure the base URL ends with `/` so relative joins append instead of replace
fn normalize_base_url(base_url: &str) -> Result<Url, ClientError> {
    let mut base = base_url.trim().to_string();
    if base.is_empty() {
        return Err(ArgumentError::Empty("base_url").into());
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| {
        ClientError::InvalidArgument(ArgumentError::Invalid {
            name: "base_url",
            reason: e.to_string(),
        })
    })
}
