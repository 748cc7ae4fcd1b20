//! Analysis descriptors and completion polling

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delay::sleep_or_cancel;
use crate::error::ClientError;

/// Descriptor returned when a file is submitted for scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisHandle {
    /// Analysis identifier
    pub id: String,
    /// Object type reported by the server, normally `analysis`
    #[serde(rename = "type")]
    pub kind: String,
}

/// Analysis lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AnalysisStatus {
    Queued,
    InProgress,
    Completed,
    Error,
    Cancelled,
    Timeout,
    /// Any state this client does not know about
    Unknown(String),
}

impl AnalysisStatus {
    /// True once the analysis will not change any more
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed
                | AnalysisStatus::Error
                | AnalysisStatus::Cancelled
                | AnalysisStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::InProgress => "in-progress",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Cancelled => "cancelled",
            AnalysisStatus::Timeout => "timeout",
            AnalysisStatus::Unknown(other) => other,
        }
    }
}

impl From<String> for AnalysisStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "queued" => AnalysisStatus::Queued,
            "in-progress" | "in_progress" | "inprogress" => AnalysisStatus::InProgress,
            "completed" => AnalysisStatus::Completed,
            "error" => AnalysisStatus::Error,
            "cancelled" | "canceled" => AnalysisStatus::Cancelled,
            "timeout" => AnalysisStatus::Timeout,
            _ => AnalysisStatus::Unknown(value),
        }
    }
}

impl From<AnalysisStatus> for String {
    fn from(status: AnalysisStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an analysis object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub id: String,
    pub status: AnalysisStatus,
    /// Engine verdict counters, present once results exist
    pub stats: Option<serde_json::Value>,
    pub date: Option<DateTime<Utc>>,
}

/// Wire shape of `GET analyses/{id}` `data`
#[derive(Debug, Deserialize)]
pub(crate) struct AnalysisObject {
    id: String,
    #[serde(default)]
    attributes: AnalysisAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisAttributes {
    #[serde(default)]
    status: Option<AnalysisStatus>,
    #[serde(default)]
    stats: Option<serde_json::Value>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    date: Option<DateTime<Utc>>,
}

impl From<AnalysisObject> for Analysis {
    fn from(object: AnalysisObject) -> Self {
        Analysis {
            id: object.id,
            status: object
                .attributes
                .status
                .unwrap_or(AnalysisStatus::Queued),
            stats: object.attributes.stats,
            date: object.attributes.date,
        }
    }
}

/// Poll `fetch` until the analysis reaches a terminal status
///
/// The whole loop, requests included, runs under a single `timeout` budget;
/// exceeding it returns [`ClientError::Timeout`]. Failures from `fetch`
/// and cancellation are returned unchanged.
pub async fn poll_until_terminal<F, Fut>(
    mut fetch: F,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Analysis, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Analysis, ClientError>>,
{
    let polling = async {
        let mut polls = 0u32;
        loop {
            let analysis = fetch().await?;
            polls += 1;
            if analysis.status.is_terminal() {
                debug!(id = %analysis.id, status = %analysis.status, polls = polls, "Analysis finished");
                return Ok(analysis);
            }
            debug!(id = %analysis.id, status = %analysis.status, "Analysis not finished yet");
            sleep_or_cancel(poll_interval, cancel).await?;
        }
    };

    match tokio::time::timeout(timeout, polling).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn analysis(status: AnalysisStatus) -> Analysis {
        Analysis {
            id: "an-1".to_string(),
            status,
            stats: None,
            date: None,
        }
    }

    // Test 1: Status strings map onto variants and back
    #[test]
    fn test_status_parsing() {
        assert_eq!(AnalysisStatus::from("queued".to_string()), AnalysisStatus::Queued);
        assert_eq!(
            AnalysisStatus::from("in-progress".to_string()),
            AnalysisStatus::InProgress
        );
        assert_eq!(
            AnalysisStatus::from("Completed".to_string()),
            AnalysisStatus::Completed
        );
        assert_eq!(
            AnalysisStatus::from("paused".to_string()),
            AnalysisStatus::Unknown("paused".to_string())
        );
        assert_eq!(AnalysisStatus::InProgress.to_string(), "in-progress");

        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(AnalysisStatus::Error.is_terminal());
        assert!(AnalysisStatus::Cancelled.is_terminal());
        assert!(AnalysisStatus::Timeout.is_terminal());
        assert!(!AnalysisStatus::Queued.is_terminal());
        assert!(!AnalysisStatus::Unknown("x".to_string()).is_terminal());
    }

    // Test 2: Analysis object decoding
    #[test]
    fn test_analysis_object_decoding() {
        let json = r#"{
            "id": "an-1",
            "type": "analysis",
            "attributes": {
                "status": "completed",
                "date": 1700000000,
                "stats": {"malicious": 2, "undetected": 60}
            }
        }"#;
        let object: AnalysisObject = serde_json::from_str(json).unwrap();
        let analysis = Analysis::from(object);

        assert_eq!(analysis.id, "an-1");
        assert_eq!(analysis.status, AnalysisStatus::Completed);
        assert_eq!(analysis.stats.unwrap()["malicious"], 2);
        assert_eq!(analysis.date.unwrap().timestamp(), 1_700_000_000);
    }

    // Test 3: Handle decoding uses the `type` field
    #[test]
    fn test_handle_decoding() {
        let handle: AnalysisHandle =
            serde_json::from_str(r#"{"type":"analysis","id":"abc=="}"#).unwrap();
        assert_eq!(handle.id, "abc==");
        assert_eq!(handle.kind, "analysis");
    }

    // Test 4: Polling stops at the first terminal status
    #[tokio::test]
    async fn test_poll_until_completed() {
        tokio::time::pause();
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let result = poll_until_terminal(
            || {
                let count = counter.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    Ok(analysis(if n < 2 {
                        AnalysisStatus::InProgress
                    } else {
                        AnalysisStatus::Completed
                    }))
                }
            },
            Duration::from_secs(5),
            Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.status, AnalysisStatus::Completed);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    // Test 5: Budget expiry raises Timeout
    #[tokio::test]
    async fn test_poll_times_out() {
        tokio::time::pause();

        let result = poll_until_terminal(
            || async { Ok(analysis(AnalysisStatus::Queued)) },
            Duration::from_secs(5),
            Duration::from_secs(12),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ClientError::Timeout(d)) if d == Duration::from_secs(12)));
    }

    // Test 6: Fetch failures propagate without further polling
    #[tokio::test]
    async fn test_poll_propagates_failure() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let result = poll_until_terminal(
            || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::Network("connection reset".to_string()))
                }
            },
            Duration::ZERO,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ClientError::Network(_))));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    // Test 7: Cancellation between polls
    #[tokio::test]
    async fn test_poll_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = poll_until_terminal(
            || async { Ok(analysis(AnalysisStatus::Queued)) },
            Duration::from_secs(5),
            Duration::from_secs(60),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(ClientError::Cancelled)));
    }
}
