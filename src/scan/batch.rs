//! One-shot scanning of a list of files with bounded concurrency

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{AnalysisHandle, FileUploader, UploadSource};
use crate::error::{ArgumentError, ClientError};

/// Result of scanning one file in a batch
#[derive(Debug)]
pub struct BatchScanOutcome {
    pub path: PathBuf,
    pub result: Result<AnalysisHandle, ClientError>,
}

impl BatchScanOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Submit every path, running at most `max_concurrency` uploads at once
///
/// Outcomes are returned in input order. A failing file is recorded in its
/// outcome and never stops the batch; only an invalid concurrency limit
/// fails the call as a whole.
pub async fn scan_files(
    uploader: Arc<FileUploader>,
    paths: Vec<PathBuf>,
    max_concurrency: usize,
    password: Option<String>,
    cancel: &CancellationToken,
) -> Result<Vec<BatchScanOutcome>, ClientError> {
    if max_concurrency == 0 {
        return Err(ArgumentError::Invalid {
            name: "max_concurrency",
            reason: "must be at least 1".to_string(),
        }
        .into());
    }

    let total = paths.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let password = password.as_deref();

    let scans = paths.into_iter().map(|path| {
        let uploader = Arc::clone(&uploader);
        let semaphore = Arc::clone(&semaphore);
        async move {
            let result = scan_one(&uploader, &semaphore, &path, password, cancel).await;
            match &result {
                Ok(handle) => debug!(path = %path.display(), analysis_id = %handle.id, "File submitted"),
                Err(e) => warn!(path = %path.display(), error = %e, "File scan failed"),
            }
            BatchScanOutcome { path, result }
        }
    });
    let outcomes = join_all(scans).await;

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    info!(
        total = total,
        succeeded = succeeded,
        failed = total - succeeded,
        "Batch scan finished"
    );
    Ok(outcomes)
}

async fn scan_one(
    uploader: &FileUploader,
    semaphore: &Semaphore,
    path: &std::path::Path,
    password: Option<&str>,
    cancel: &CancellationToken,
) -> Result<AnalysisHandle, ClientError> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        permit = semaphore.acquire() => permit
            .map_err(|_| ClientError::Cancelled)?,
    };

    let file = tokio::fs::File::open(path).await?;
    if !file.metadata().await?.is_file() {
        return Err(ArgumentError::Invalid {
            name: "path",
            reason: format!("{} is not a regular file", path.display()),
        }
        .into());
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    uploader
        .submit_file(UploadSource::Seekable(file), &file_name, password, cancel)
        .await
}
