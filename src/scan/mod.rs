//! Directory watching and batch file scanning

pub mod batch;
pub mod filter;
pub mod service;

pub use batch::{scan_files, BatchScanOutcome};
pub use filter::ExclusionFilter;
pub use service::{DirectoryScanService, FailureHook, ScanOptions};
