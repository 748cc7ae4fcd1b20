//! threatscan - client toolkit for a threat-intelligence REST API
//!
//! This crate provides rate-limit aware request execution, cursor paging,
//! streaming file submission and a service that scans files as they appear
//! in a watched directory.

pub mod client;
pub mod config;
pub mod delay;
pub mod error;
pub mod scan;
pub mod telemetry;
pub mod transport;

pub use client::ThreatIntelClient;
pub use error::{ApiError, ArgumentError, ClientError, RateLimitError};
