//! Configuration management for threatscan
//!
//! This module handles loading, parsing, and validating client configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default API base address
pub const DEFAULT_BASE_URL: &str = "https://www.virustotal.com/api/v3/";

/// Files larger than this are uploaded through a one-time upload URL
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// API connection configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Rate-limit retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// File upload configuration
    #[serde(default)]
    pub upload: UploadConfig,

    /// Directory scan configuration
    #[serde(default)]
    pub scan: ScanConfig,

    /// Analysis polling configuration
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml)?;
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix THREATSCAN_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("THREATSCAN_BASE_URL") {
            config.client.base_url = url;
        }
        if let Ok(key) = std::env::var("THREATSCAN_API_KEY") {
            config.client.api_key = Some(key);
        }
        if let Ok(agent) = std::env::var("THREATSCAN_USER_AGENT") {
            config.client.user_agent = Some(agent);
        }
        if let Ok(retries) = std::env::var("THREATSCAN_MAX_RETRIES") {
            config.retry.max_retries = retries
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid max retries".to_string()))?;
        }
        if let Ok(dir) = std::env::var("THREATSCAN_SCAN_DIRECTORY") {
            config.scan.directory = Some(PathBuf::from(dir));
        }
        if let Ok(delay) = std::env::var("THREATSCAN_SCAN_DELAY_MS") {
            config.scan.scan_delay_ms = delay
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid scan delay".to_string()))?;
        }
        if let Ok(level) = std::env::var("THREATSCAN_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Validate values that serde cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("client.base_url".to_string()));
        }
        if self.client.api_key.is_none() {
            return Err(ConfigError::MissingRequired("client.api_key".to_string()));
        }
        if self.upload.buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                "upload.buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.scan.lock_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "scan.lock_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.scan.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "scan.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// API connection configuration
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// API base address
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent in the `x-apikey` header
    #[serde(default)]
    pub api_key: Option<String>,

    /// User agent override; defaults to `threatscan/<version>`
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Total deadline in seconds for requests with a buffered body
    ///
    /// Also bounds connecting for every request. Streamed uploads are not
    /// held to this deadline; see `upload_timeout_secs`.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Total deadline in seconds for streamed uploads; unbounded when unset
    #[serde(default)]
    pub upload_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            user_agent: None,
            timeout_secs: default_request_timeout(),
            upload_timeout_secs: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("timeout_secs", &self.timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .finish()
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    300
}

/// Retry configuration for rate-limited API calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait used when the server gives no Retry-After hint (seconds)
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_secs: u64,
}

impl RetryConfig {
    /// Default retry delay as a Duration
    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_secs(self.default_retry_delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_retry_delay_secs: default_retry_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

/// File upload configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    /// Size above which the upload-URL indirection is used (bytes)
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Copy buffer size used when streaming file bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Directory for temporary copies of non-seekable streams
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            large_file_threshold: default_large_file_threshold(),
            buffer_size: default_buffer_size(),
            temp_dir: None,
        }
    }
}

fn default_large_file_threshold() -> u64 {
    DEFAULT_LARGE_FILE_THRESHOLD
}

fn default_buffer_size() -> usize {
    64 * 1024
}

/// Directory scan configuration
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Directory to watch
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Glob patterns of file names that are never submitted
    #[serde(default)]
    pub exclusion_filters: Vec<String>,

    /// Debounce delay between the create event and the upload (milliseconds)
    #[serde(default)]
    pub scan_delay_ms: u64,

    /// Attempts to open a newly created file before giving up
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    /// Wait between open attempts (milliseconds)
    #[serde(default = "default_lock_retry_interval")]
    pub lock_retry_interval_ms: u64,

    /// Maximum concurrent submissions for batch scans
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Password attached to every submission (archives)
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            directory: None,
            exclusion_filters: Vec::new(),
            scan_delay_ms: 0,
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_interval_ms: default_lock_retry_interval(),
            max_concurrency: default_max_concurrency(),
            password: None,
        }
    }
}

impl fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfig")
            .field("directory", &self.directory)
            .field("exclusion_filters", &self.exclusion_filters)
            .field("scan_delay_ms", &self.scan_delay_ms)
            .field("lock_retry_attempts", &self.lock_retry_attempts)
            .field("lock_retry_interval_ms", &self.lock_retry_interval_ms)
            .field("max_concurrency", &self.max_concurrency)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_lock_retry_attempts() -> u32 {
    5
}

fn default_lock_retry_interval() -> u64 {
    100
}

fn default_max_concurrency() -> usize {
    4
}

/// Analysis polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Interval between status polls (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Wall-clock budget for an analysis to complete (seconds)
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_analysis_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_analysis_timeout() -> u64 {
    600
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax. Unset variables are left untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid expansion pattern: {}", e)))?;

    Ok(re
        .replace_all(input, |caps: &regex_lite::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Parse complete configuration from YAML
    #[test]
    fn test_parse_complete_yaml_config() {
        let yaml = r#"
client:
  base_url: "http://localhost:8080/api/v3/"
  api_key: "secret"
  user_agent: "scanner/2.0"
  timeout_secs: 30
  upload_timeout_secs: 3600

retry:
  max_retries: 5
  default_retry_delay_secs: 10

upload:
  large_file_threshold: 1024
  buffer_size: 4096
  temp_dir: "/tmp/threatscan"

scan:
  directory: "/srv/incoming"
  exclusion_filters: ["*.tmp", "~*"]
  scan_delay_ms: 300
  lock_retry_attempts: 3
  lock_retry_interval_ms: 50
  max_concurrency: 8
  password: "infected"

analysis:
  poll_interval_secs: 2
  timeout_secs: 120

logging:
  level: "debug"
  format: "json"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.client.base_url, "http://localhost:8080/api/v3/");
        assert_eq!(config.client.api_key, Some("secret".to_string()));
        assert_eq!(config.client.user_agent, Some("scanner/2.0".to_string()));
        assert_eq!(config.client.timeout_secs, 30);
        assert_eq!(config.client.upload_timeout_secs, Some(3600));

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.default_retry_delay(), Duration::from_secs(10));

        assert_eq!(config.upload.large_file_threshold, 1024);
        assert_eq!(config.upload.buffer_size, 4096);
        assert_eq!(
            config.upload.temp_dir,
            Some(PathBuf::from("/tmp/threatscan"))
        );

        assert_eq!(config.scan.directory, Some(PathBuf::from("/srv/incoming")));
        assert_eq!(config.scan.exclusion_filters, vec!["*.tmp", "~*"]);
        assert_eq!(config.scan.scan_delay_ms, 300);
        assert_eq!(config.scan.lock_retry_attempts, 3);
        assert_eq!(config.scan.lock_retry_interval_ms, 50);
        assert_eq!(config.scan.max_concurrency, 8);
        assert_eq!(config.scan.password, Some("infected".to_string()));

        assert_eq!(config.analysis.poll_interval_secs, 2);
        assert_eq!(config.analysis.timeout_secs, 120);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    // Test 2: Default values are applied for missing fields
    #[test]
    fn test_default_values_applied() {
        let yaml = r#"
client:
  api_key: "k"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.client.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.client.user_agent, None);
        assert_eq!(config.client.timeout_secs, 300);
        assert_eq!(config.client.upload_timeout_secs, None);

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.default_retry_delay_secs, 60);

        assert_eq!(config.upload.large_file_threshold, 33_554_432);
        assert_eq!(config.upload.buffer_size, 65_536);
        assert_eq!(config.upload.temp_dir, None);

        assert_eq!(config.scan.directory, None);
        assert!(config.scan.exclusion_filters.is_empty());
        assert_eq!(config.scan.scan_delay_ms, 0);
        assert_eq!(config.scan.lock_retry_attempts, 5);
        assert_eq!(config.scan.lock_retry_interval_ms, 100);
        assert_eq!(config.scan.max_concurrency, 4);

        assert_eq!(config.analysis.poll_interval_secs, 5);
        assert_eq!(config.analysis.timeout_secs, 600);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
    }

    // Test 3: Environment variable expansion
    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_THREATSCAN_KEY", "env_secret");
        std::env::set_var("TEST_THREATSCAN_DIR", "/var/incoming");

        let yaml = r#"
client:
  api_key: "${TEST_THREATSCAN_KEY}"

scan:
  directory: "${TEST_THREATSCAN_DIR}"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.client.api_key, Some("env_secret".to_string()));
        assert_eq!(config.scan.directory, Some(PathBuf::from("/var/incoming")));

        std::env::remove_var("TEST_THREATSCAN_KEY");
        std::env::remove_var("TEST_THREATSCAN_DIR");
    }

    // Test 4: Unset variables are left as-is
    #[test]
    fn test_unset_env_var_left_untouched() {
        let yaml = r#"
client:
  api_key: "${THREATSCAN_SURELY_UNSET_VARIABLE}"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.client.api_key,
            Some("${THREATSCAN_SURELY_UNSET_VARIABLE}".to_string())
        );
    }

    // Test 5: from_env loads config from environment variables
    #[test]
    fn test_from_env() {
        std::env::set_var("THREATSCAN_BASE_URL", "http://intel.local/");
        std::env::set_var("THREATSCAN_API_KEY", "abc123");
        std::env::set_var("THREATSCAN_MAX_RETRIES", "7");
        std::env::set_var("THREATSCAN_SCAN_DIRECTORY", "/drop");
        std::env::set_var("THREATSCAN_SCAN_DELAY_MS", "250");

        let config = Config::from_env().unwrap();

        assert_eq!(config.client.base_url, "http://intel.local/");
        assert_eq!(config.client.api_key, Some("abc123".to_string()));
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.scan.directory, Some(PathBuf::from("/drop")));
        assert_eq!(config.scan.scan_delay_ms, 250);

        std::env::remove_var("THREATSCAN_BASE_URL");
        std::env::remove_var("THREATSCAN_API_KEY");
        std::env::remove_var("THREATSCAN_MAX_RETRIES");
        std::env::remove_var("THREATSCAN_SCAN_DIRECTORY");
        std::env::remove_var("THREATSCAN_SCAN_DELAY_MS");
    }

    // Test 6: Parse error for invalid YAML
    #[test]
    fn test_parse_error_invalid_yaml() {
        let yaml = r#"
retry:
  max_retries: "many"
"#;

        match Config::from_yaml(yaml) {
            Err(ConfigError::Parse(msg)) => assert!(msg.contains("Failed to parse YAML")),
            other => panic!("Expected ConfigError::Parse, got {:?}", other),
        }
    }

    // Test 7: Empty YAML results in defaults
    #[test]
    fn test_empty_yaml_defaults() {
        let mut config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingRequired("client.api_key".to_string()))
        );

        config.client.api_key = Some("k".to_string());
        assert!(config.validate().is_ok());

        config.client.base_url = "  ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingRequired("client.base_url".to_string()))
        );
    }

    // Test 8: Validation rejects zero-valued limits
    #[test]
    fn test_validate_rejects_zero_limits() {
        let keyed = || {
            let mut config = Config::default();
            config.client.api_key = Some("k".to_string());
            config
        };

        let mut config = keyed();
        config.scan.max_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("max_concurrency")
        ));

        let mut config = keyed();
        config.upload.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = keyed();
        config.scan.lock_retry_attempts = 0;
        assert!(config.validate().is_err());
    }

    // Test 9: Config serialization round-trip
    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(config, parsed);
    }

    // Test 10: Debug output never shows secrets
    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = Config::default();
        config.client.api_key = Some("super-secret-key".to_string());
        config.scan.password = Some("archive-pass".to_string());

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret-key"));
        assert!(!rendered.contains("archive-pass"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains(DEFAULT_BASE_URL));
    }
}
