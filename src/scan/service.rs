//! Directory scan service
//!
//! Watches one directory (non-recursively) and submits every newly created
//! file for scanning. Each file is handled by its own task:
//!
//! ```text
//! Created -> Ignored                        (exclusion filter matched)
//! Created -> Pending -> Opening -> Submitting -> Done | Failed
//! ```
//!
//! An open attempt only succeeds once the creator has finished writing: on
//! Linux the watcher reports the writer closing the file, on Windows the
//! file is opened without write sharing, elsewhere the size must hold still
//! across one retry interval.
//!
//! A file's failure never affects the watcher or other files. Shutdown
//! cancels all work, stops the watcher and waits for every tracked task.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::ExclusionFilter;
use crate::client::{AnalysisHandle, FileUploader, UploadSource};
use crate::config::ScanConfig;
use crate::delay::sleep_or_cancel;
use crate::error::{ArgumentError, ClientError};

/// Default number of open attempts for a freshly created file
pub const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 5;

/// Default wait between open attempts
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the watch backend reports a writer closing a file
const REPORTS_CLOSE_WRITE: bool = cfg!(any(target_os = "linux", target_os = "android"));

#[cfg(windows)]
const FILE_SHARE_READ: u32 = 0x0000_0001;

/// Callback observing per-file failures
///
/// Invoked from the file's own task; it must not block. Cancellation is
/// never reported.
pub type FailureHook = Arc<dyn Fn(&Path, &ClientError) + Send + Sync>;

/// Directory scan settings
#[derive(Clone)]
pub struct ScanOptions {
    pub directory_path: PathBuf,
    pub exclusion_filters: Vec<String>,
    /// Wait between the create event and the first open attempt
    pub scan_delay: Duration,
    pub lock_retry_attempts: u32,
    pub lock_retry_interval: Duration,
    /// Password forwarded with every submission
    pub password: Option<String>,
    pub on_failure: Option<FailureHook>,
}

impl ScanOptions {
    pub fn new(directory_path: impl Into<PathBuf>) -> Self {
        Self {
            directory_path: directory_path.into(),
            exclusion_filters: Vec::new(),
            scan_delay: Duration::ZERO,
            lock_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            password: None,
            on_failure: None,
        }
    }

    /// Build options from the `scan` configuration section
    pub fn from_config(config: &ScanConfig) -> Result<Self, ArgumentError> {
        let directory = config
            .directory
            .clone()
            .ok_or(ArgumentError::Missing("scan.directory"))?;
        Ok(Self {
            exclusion_filters: config.exclusion_filters.clone(),
            scan_delay: Duration::from_millis(config.scan_delay_ms),
            lock_retry_attempts: config.lock_retry_attempts,
            lock_retry_interval: Duration::from_millis(config.lock_retry_interval_ms),
            password: config.password.clone(),
            ..Self::new(directory)
        })
    }

    pub fn with_exclusion_filters<S: Into<String>>(
        mut self,
        filters: impl IntoIterator<Item = S>,
    ) -> Self {
        self.exclusion_filters = filters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    pub fn with_lock_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.lock_retry_attempts = attempts;
        self.lock_retry_interval = interval;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path, &ClientError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("directory_path", &self.directory_path)
            .field("exclusion_filters", &self.exclusion_filters)
            .field("scan_delay", &self.scan_delay)
            .field("lock_retry_attempts", &self.lock_retry_attempts)
            .field("lock_retry_interval", &self.lock_retry_interval)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Tracked per-file tasks
#[derive(Default)]
struct InFlight {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawn a task that untracks itself on completion
    ///
    /// The map lock is held across the spawn so the task's removal can never
    /// run before its insertion.
    fn spawn<F>(self: &Arc<Self>, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::clone(self);
        let mut handles = self.lock();
        let handle = tokio::spawn(async move {
            work.await;
            tracker.lock().remove(&id);
        });
        handles.insert(id, handle);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Await every task tracked at call time, ignoring panics
    async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        debug!(count = handles.len(), "Waiting for in-flight scans");
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Scan task ended abnormally");
            }
        }
    }
}

/// State shared by the event loop and every file task
struct ScanContext {
    uploader: Arc<FileUploader>,
    filter: ExclusionFilter,
    options: ScanOptions,
}

/// Background service submitting newly created files
pub struct DirectoryScanService {
    directory: PathBuf,
    cancel: CancellationToken,
    watcher: Option<RecommendedWatcher>,
    event_loop: Option<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl DirectoryScanService {
    /// Start watching `options.directory_path`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(uploader: Arc<FileUploader>, options: ScanOptions) -> Result<Self, ClientError> {
        let directory = options.directory_path.clone();
        if directory.as_os_str().is_empty() {
            return Err(ArgumentError::Empty("directory_path").into());
        }
        if !directory.is_dir() {
            return Err(ArgumentError::Invalid {
                name: "directory_path",
                reason: format!("{} is not a directory", directory.display()),
            }
            .into());
        }
        if options.lock_retry_attempts == 0 {
            return Err(ArgumentError::Invalid {
                name: "lock_retry_attempts",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        let filter = ExclusionFilter::new(options.exclusion_filters.as_slice())?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            if event_tx.send(event).is_err() {
                debug!("Watch event dropped because the event loop has stopped");
            }
        })
        .map_err(|e| watch_error(&directory, &e))?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&directory, &e))?;

        let cancel = CancellationToken::new();
        let in_flight = Arc::new(InFlight::default());
        let context = Arc::new(ScanContext {
            uploader,
            filter,
            options,
        });

        let event_loop = tokio::spawn(run_event_loop(
            event_rx,
            context,
            Arc::clone(&in_flight),
            cancel.clone(),
        ));

        info!(directory = %directory.display(), "Directory scan service started");

        Ok(Self {
            directory,
            cancel,
            watcher: Some(watcher),
            event_loop: Some(event_loop),
            in_flight,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of file tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop watching and wait for all in-flight work
    ///
    /// Cancels every task, releases the watcher, then waits for the event
    /// loop and each tracked task. Never fails.
    pub async fn shutdown(mut self) {
        info!(directory = %self.directory.display(), "Stopping directory scan service");
        self.cancel.cancel();

        // Dropping the watcher closes the event channel.
        drop(self.watcher.take());

        if let Some(event_loop) = self.event_loop.take() {
            if let Err(e) = event_loop.await {
                warn!(error = %e, "Scan event loop ended abnormally");
            }
        }

        self.in_flight.drain().await;
        info!(directory = %self.directory.display(), "Directory scan service stopped");
    }
}

impl Drop for DirectoryScanService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    context: Arc<ScanContext>,
    in_flight: Arc<InFlight>,
    cancel: CancellationToken,
) {
    let mut writers = Writers::default();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(Ok(event)) => handle_event(event, &context, &in_flight, &mut writers, &cancel),
            Some(Err(e)) => warn!(error = %e, "Watch backend error"),
            None => break,
        }
    }
    debug!("Scan event loop stopped");
}

/// Close notifications owed to file tasks, keyed by path
#[derive(Default)]
struct Writers {
    pending: HashMap<PathBuf, oneshot::Sender<()>>,
}

impl Writers {
    /// Track a created file and return how its task detects the writer finishing
    fn track(&mut self, path: &Path) -> WriteState {
        if !REPORTS_CLOSE_WRITE {
            return WriteState::for_platform();
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(path.to_path_buf(), tx);
        WriteState::CloseEvent(rx)
    }

    fn closed(&mut self, path: &Path) {
        if let Some(tx) = self.pending.remove(path) {
            // The task may already have finished
            let _ = tx.send(());
        }
    }

    /// Forget entries whose task is gone
    fn prune(&mut self) {
        self.pending.retain(|_, tx| !tx.is_closed());
    }
}

fn handle_event(
    event: Event,
    context: &Arc<ScanContext>,
    in_flight: &Arc<InFlight>,
    writers: &mut Writers,
    cancel: &CancellationToken,
) {
    writers.prune();
    match event.kind {
        EventKind::Create(_) => {}
        EventKind::Access(AccessKind::Close(AccessMode::Write)) | EventKind::Remove(_) => {
            for path in &event.paths {
                writers.closed(path);
            }
            return;
        }
        _ => return,
    }

    for path in event.paths {
        if context.filter.is_excluded(&path) {
            debug!(path = %path.display(), "Ignoring excluded file");
            continue;
        }
        let write_state = writers.track(&path);
        in_flight.spawn(process_file(
            Arc::clone(context),
            path,
            write_state,
            cancel.clone(),
        ));
    }
}

/// How an open attempt decides the creator has finished writing
pub(crate) enum WriteState {
    /// Finished once the watcher reports the writer closing the file
    CloseEvent(oneshot::Receiver<()>),
    /// Finished once the size is unchanged between two attempts
    StableSize(Option<u64>),
    /// Opening the file is proof enough
    Released,
}

impl WriteState {
    /// Detection used where the watcher reports no close events
    fn for_platform() -> Self {
        if cfg!(windows) {
            // The open itself fails while a writer holds the file
            WriteState::Released
        } else {
            WriteState::StableSize(None)
        }
    }

    fn is_released(&mut self, size: u64) -> bool {
        match self {
            WriteState::CloseEvent(rx) => !matches!(
                rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ),
            WriteState::StableSize(last) => {
                let stable = *last == Some(size);
                *last = Some(size);
                stable
            }
            WriteState::Released => true,
        }
    }
}

/// Run one file through its lifecycle, containing every failure
async fn process_file(
    context: Arc<ScanContext>,
    path: PathBuf,
    write_state: WriteState,
    cancel: CancellationToken,
) {
    match scan_file(&context, &path, write_state, &cancel).await {
        Ok(Some(handle)) => {
            debug!(path = %path.display(), analysis_id = %handle.id, "Created file submitted");
        }
        Ok(None) => debug!(path = %path.display(), "Skipping non-file entry"),
        Err(e) if e.is_cancelled() => {
            debug!(path = %path.display(), "Scan cancelled");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to scan created file");
            if let Some(hook) = &context.options.on_failure {
                hook(&path, &e);
            }
        }
    }
}

async fn scan_file(
    context: &ScanContext,
    path: &Path,
    write_state: WriteState,
    cancel: &CancellationToken,
) -> Result<Option<AnalysisHandle>, ClientError> {
    let options = &context.options;
    sleep_or_cancel(options.scan_delay, cancel).await?;

    let Some(file) = open_with_retry(
        path,
        options.lock_retry_attempts,
        options.lock_retry_interval,
        write_state,
        cancel,
    )
    .await?
    else {
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let handle = context
        .uploader
        .submit_file(
            UploadSource::Seekable(file),
            &file_name,
            options.password.as_deref(),
            cancel,
        )
        .await?;
    Ok(Some(handle))
}

/// Open a finished file for reading, retrying while the writer still holds it
///
/// Returns `None` for entries that are not regular files. The last attempt's
/// error is returned once every attempt has failed.
pub(crate) async fn open_with_retry(
    path: &Path,
    attempts: u32,
    interval: Duration,
    mut write_state: WriteState,
    cancel: &CancellationToken,
) -> Result<Option<tokio::fs::File>, ClientError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let error = match open_shared_read(path).await {
            Ok(file) => {
                let metadata = file.metadata().await?;
                if !metadata.is_file() {
                    return Ok(None);
                }
                if write_state.is_released(metadata.len()) {
                    return Ok(Some(file));
                }
                std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "file is still being written",
                )
            }
            Err(e) => e,
        };

        if attempt >= attempts {
            return Err(error.into());
        }
        debug!(
            path = %path.display(),
            attempt = attempt,
            error = %error,
            "File not readable yet, retrying"
        );
        sleep_or_cancel(interval, cancel).await?;
        attempt += 1;
    }
}

#[cfg(windows)]
async fn open_shared_read(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ)
        .open(path)
        .await
}

#[cfg(not(windows))]
async fn open_shared_read(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::File::open(path).await
}

fn watch_error(directory: &Path, error: &notify::Error) -> ClientError {
    ClientError::Watch(format!("{}: {}", directory.display(), error))
}
