//! Failure classification
//!
//! Turns a non-success response into a typed [`ClientError`]: a plain
//! [`ApiError`] for most statuses, a [`RateLimitError`] carrying the
//! server's backoff hints for 429.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{ApiError, ClientError, RateLimitError};

/// Header reporting the remaining request quota
pub const REMAINING_QUOTA_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Classify a failed response
///
/// Reads only the already-buffered body; performs no I/O.
pub fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ClientError {
    let api = parse_api_error(status, body);

    if status == StatusCode::TOO_MANY_REQUESTS {
        ClientError::RateLimited(RateLimitError {
            api,
            retry_after: header_value(headers, RETRY_AFTER.as_str())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
            remaining_quota: header_value(headers, REMAINING_QUOTA_HEADER)
                .and_then(|v| v.parse::<i64>().ok()),
        })
    } else {
        ClientError::Api(api)
    }
}

fn parse_api_error(status: StatusCode, body: &[u8]) -> ApiError {
    let status_text = || {
        status
            .canonical_reason()
            .unwrap_or("Unknown Status")
            .to_string()
    };

    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => ApiError {
            status: status.as_u16(),
            code: envelope.error.code,
            message: envelope.error.message.unwrap_or_else(status_text),
        },
        Err(_) => ApiError {
            status: status.as_u16(),
            code: None,
            message: status_text(),
        },
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}
