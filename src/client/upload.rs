//! Streaming multipart file submission
//!
//! Files are posted as a single-part `multipart/form-data` body that is
//! streamed from disk in fixed-size chunks. Sources of unknown length are
//! first spooled to a temporary file so the size, and therefore the
//! endpoint choice and `Content-Length`, is known before the request starts.

use std::borrow::Cow;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::analysis::AnalysisHandle;
use super::retry::RetryExecutor;
use super::DataEnvelope;
use crate::config::UploadConfig;
use crate::error::{require_non_empty, ClientError};
use crate::transport::{ApiRequest, Transport};

/// Default upload endpoint
pub const FILES_PATH: &str = "files";

/// Endpoint returning a one-time URL for large uploads
pub const UPLOAD_URL_PATH: &str = "files/upload_url";

/// Request header carrying the archive password
pub const PASSWORD_HEADER: &str = "password";

const BOUNDARY_LENGTH: usize = 32;

/// Bytes to submit
pub enum UploadSource {
    /// A file whose remaining length is known from its metadata
    Seekable(tokio::fs::File),
    /// Any reader of unknown length; spooled to disk before upload
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl UploadSource {
    /// Wrap an arbitrary reader
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        UploadSource::Stream(Box::new(reader))
    }
}

impl From<tokio::fs::File> for UploadSource {
    fn from(file: tokio::fs::File) -> Self {
        UploadSource::Seekable(file)
    }
}

/// A file holding the payload at `start..start + size`
///
/// Holds the temp path guard when the payload was spooled, so the file is
/// removed when this value is dropped.
struct PreparedFile {
    file: tokio::fs::File,
    start: u64,
    size: u64,
    _spool: Option<TempPath>,
}

impl PreparedFile {
    /// A fresh handle positioned at the payload start
    async fn reader(&self) -> Result<tokio::io::Take<tokio::fs::File>, ClientError> {
        let mut file = self.file.try_clone().await?;
        file.seek(SeekFrom::Start(self.start)).await?;
        Ok(file.take(self.size))
    }
}

/// Submits files for scanning
pub struct FileUploader {
    transport: Arc<dyn Transport>,
    config: UploadConfig,
    retry: RetryExecutor,
}

impl FileUploader {
    pub fn new(transport: Arc<dyn Transport>, config: UploadConfig, retry: RetryExecutor) -> Self {
        Self {
            transport,
            config,
            retry,
        }
    }

    /// Payloads strictly larger than this go through an upload URL
    pub fn large_file_threshold(&self) -> u64 {
        self.config.large_file_threshold
    }

    /// Submit a file and return the analysis it was queued as
    ///
    /// The file name is validated before any I/O. Payloads above the
    /// large-file threshold are posted to a freshly requested upload URL,
    /// everything else to `files`. Rate-limited uploads are retried with the
    /// body re-read from the start of the payload.
    pub async fn submit_file(
        &self,
        source: UploadSource,
        file_name: &str,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisHandle, ClientError> {
        let file_name = require_non_empty(Some(file_name), "file_name")?;
        if let Some(password) = password {
            require_non_empty(Some(password), "password")?;
        }

        let prepared = self.prepare(source, cancel).await?;

        let upload_url = if prepared.size > self.config.large_file_threshold {
            let url = self.upload_url(cancel).await?;
            debug!(file_name = file_name, size = prepared.size, "Using upload URL for large file");
            Some(url)
        } else {
            None
        };

        let transport = &self.transport;
        let prepared = &prepared;
        let upload_url = upload_url.as_deref();
        let buffer_size = self.config.buffer_size;
        let envelope: DataEnvelope<AnalysisHandle> = self
            .retry
            .execute(
                || async move {
                    let request = match upload_url {
                        Some(url) => ApiRequest::post_absolute(url),
                        None => ApiRequest::post(FILES_PATH),
                    };
                    let request = match password {
                        Some(password) => request.with_header(PASSWORD_HEADER, password)?,
                        None => request,
                    };

                    let boundary = generate_boundary();
                    let body = multipart_body(prepared, file_name, &boundary, buffer_size).await?;
                    let request = request.with_stream(
                        reqwest::Body::wrap_stream(body.stream),
                        format!("multipart/form-data; boundary={}", boundary),
                        body.content_length,
                    );

                    transport
                        .send(request, cancel)
                        .await?
                        .error_for_status()?
                        .json()
                },
                cancel,
            )
            .await?;

        info!(
            file_name = file_name,
            size = prepared.size,
            analysis_id = %envelope.data.id,
            "File submitted for scanning"
        );
        Ok(envelope.data)
    }

    /// Request a one-time upload URL
    pub async fn upload_url(&self, cancel: &CancellationToken) -> Result<String, ClientError> {
        let transport = &self.transport;
        let envelope: DataEnvelope<String> = self
            .retry
            .execute(
                || async move {
                    transport
                        .send(ApiRequest::get(UPLOAD_URL_PATH), cancel)
                        .await?
                        .error_for_status()?
                        .json()
                },
                cancel,
            )
            .await?;

        if envelope.data.trim().is_empty() {
            return Err(ClientError::InvalidResponse(
                "Upload URL response contained an empty URL".to_string(),
            ));
        }
        Ok(envelope.data)
    }

    async fn prepare(
        &self,
        source: UploadSource,
        cancel: &CancellationToken,
    ) -> Result<PreparedFile, ClientError> {
        match source {
            UploadSource::Seekable(mut file) => {
                let len = file.metadata().await?.len();
                let position = file.stream_position().await?;
                Ok(PreparedFile {
                    file,
                    start: position,
                    size: len.saturating_sub(position),
                    _spool: None,
                })
            }
            UploadSource::Stream(reader) => {
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ClientError::Cancelled),
                    result = self.spool(reader) => result,
                }
            }
        }
    }

    /// Copy a reader into a temp file through a bounded buffer
    async fn spool(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<PreparedFile, ClientError> {
        let dir = self.spool_dir();
        let temp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(dir))
            .await
            .map_err(|e| ClientError::Io(std::io::Error::other(e)))??;
        let (std_file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut reader = BufReader::with_capacity(self.config.buffer_size, reader);
        let size = tokio::io::copy_buf(&mut reader, &mut file).await?;
        file.flush().await?;

        debug!(path = %path.display(), size = size, "Spooled upload stream to temp file");
        Ok(PreparedFile {
            file,
            start: 0,
            size,
            _spool: Some(path),
        })
    }

    fn spool_dir(&self) -> PathBuf {
        self.config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Streamed multipart body with its precomputed length
struct MultipartBody {
    stream: BoxStream<'static, std::io::Result<Bytes>>,
    content_length: u64,
}

/// Frame the payload, reading it in chunks of at most `buffer_size` bytes
async fn multipart_body(
    prepared: &PreparedFile,
    file_name: &str,
    boundary: &str,
    buffer_size: usize,
) -> Result<MultipartBody, ClientError> {
    let preamble = Bytes::from(multipart_preamble(boundary, file_name));
    let epilogue = Bytes::from(multipart_epilogue(boundary));
    let content_length = preamble.len() as u64 + prepared.size + epilogue.len() as u64;

    let content = ReaderStream::with_capacity(prepared.reader().await?, buffer_size.max(1));
    let stream = stream::once(async move { Ok::<_, std::io::Error>(preamble) })
        .chain(content)
        .chain(stream::once(async move { Ok(epilogue) }))
        .boxed();

    Ok(MultipartBody {
        stream,
        content_length,
    })
}

pub(crate) fn multipart_preamble(boundary: &str, file_name: &str) -> String {
    format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        escape_file_name(file_name)
    )
}

pub(crate) fn multipart_epilogue(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

fn generate_boundary() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BOUNDARY_LENGTH)
        .map(char::from)
        .collect();
    format!("----threatscan{}", token)
}

/// Percent-encode the characters that would break the quoted `filename`
fn escape_file_name(file_name: &str) -> Cow<'_, str> {
    if !file_name.contains(['"', '\r', '\n']) {
        return Cow::Borrowed(file_name);
    }
    let mut escaped = String::with_capacity(file_name.len() + 8);
    for c in file_name.chars() {
        match c {
            '"' => escaped.push_str("%22"),
            '\r' => escaped.push_str("%0D"),
            '\n' => escaped.push_str("%0A"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}
