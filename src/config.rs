//! Engine configuration.
//!
//! The engine only ever reads configuration. Values come from defaults, the
//! `with_*` setters, or a TOML document loaded with [`EngineConfig::load`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration shared by the crawler, the size calculator and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of transfers allowed to run at the same time.
    pub max_concurrent_downloads: usize,
    /// Maximum recursion depth of a directory crawl.
    pub listing_depth: usize,
    /// Size of each chunk written to disk during a transfer.
    pub chunk_size_bytes: usize,
    /// Timeout applied to every network operation.
    pub request_timeout_secs: u64,
    /// Attempts per transfer before it is marked failed.
    pub retry_attempts: u32,
    /// Delay between transfer attempts.
    pub retry_delay_secs: u64,
    /// Directory holding the on-disk listing cache.
    pub cache_directory: PathBuf,
    /// Lifetime of a cached listing.
    pub cache_expiry_hours: u64,
    /// Number of listings kept in the in-memory cache tier.
    pub memory_cache_capacity: usize,
    /// Optional cap on items emitted per listing or replayed from cache.
    pub page_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            listing_depth: 3,
            chunk_size_bytes: 8192,
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
            cache_directory: Self::default_cache_dir(),
            cache_expiry_hours: 24,
            memory_cache_capacity: 50,
            page_size: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the platform cache directory used for listings by default.
    #[must_use]
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("treefetch")
            .join("listings")
    }

    /// Returns the default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("treefetch")
            .join("config.toml")
    }

    /// Parses a TOML document. Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is not valid TOML or a value
    /// has the wrong type.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from `path`, falling back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            log::info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Sets the number of concurrent transfers.
    #[must_use]
    pub const fn with_max_concurrent_downloads(mut self, n: usize) -> Self {
        self.max_concurrent_downloads = n;
        self
    }

    /// Sets the crawl depth.
    #[must_use]
    pub const fn with_listing_depth(mut self, depth: usize) -> Self {
        self.listing_depth = depth;
        self
    }

    /// Sets the transfer chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    /// Sets the network timeout in seconds.
    #[must_use]
    pub const fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, delay_secs: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_secs = delay_secs;
        self
    }

    /// Sets the on-disk cache directory.
    #[must_use]
    pub fn with_cache_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_directory = dir.into();
        self
    }

    /// Sets the cache lifetime in hours.
    #[must_use]
    pub const fn with_cache_expiry_hours(mut self, hours: u64) -> Self {
        self.cache_expiry_hours = hours;
        self
    }

    /// Sets the in-memory cache capacity.
    #[must_use]
    pub const fn with_memory_cache_capacity(mut self, capacity: usize) -> Self {
        self.memory_cache_capacity = capacity;
        self
    }

    /// Sets the per-listing item cap.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        self.page_size = page_size;
        self
    }

    /// Network timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay between transfer attempts as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Cache lifetime as a [`Duration`].
    #[must_use]
    pub const fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_hours * 3600)
    }

    /// Chunk size, never zero.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size_bytes.max(1)
    }

    /// Concurrency cap, never zero.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    /// Number of transfer attempts, never zero.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    /// Builds the HTTP client shared by crawls, size checks and transfers.
    ///
    /// Redirects are followed and connecting is bounded by the request
    /// timeout. Transfers bound each body read separately.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("treefetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.request_timeout())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.listing_depth, 3);
        assert_eq!(config.chunk_size_bytes, 8192);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.cache_expiry(), Duration::from_secs(24 * 3600));
        assert_eq!(config.memory_cache_capacity, 50);
        assert!(config.page_size.is_none());
        assert!(config.cache_directory.to_string_lossy().contains("treefetch"));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .with_max_concurrent_downloads(2)
            .with_listing_depth(1)
            .with_chunk_size(1024)
            .with_retry(5, 0)
            .with_page_size(Some(10))
            .with_cache_directory("/tmp/lists");

        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.listing_depth, 1);
        assert_eq!(config.chunk_size(), 1024);
        assert_eq!(config.attempts(), 5);
        assert_eq!(config.retry_delay(), Duration::ZERO);
        assert_eq!(config.page_size, Some(10));
        assert_eq!(config.cache_directory, PathBuf::from("/tmp/lists"));
    }

    #[test]
    fn zero_values_are_clamped() {
        let config = EngineConfig::new()
            .with_max_concurrent_downloads(0)
            .with_chunk_size(0)
            .with_retry(0, 1);
        assert_eq!(config.concurrency(), 1);
        assert_eq!(config.chunk_size(), 1);
        assert_eq!(config.attempts(), 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            "max_concurrent_downloads = 8\npage_size = 25\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrent_downloads, 8);
        assert_eq!(config.page_size, Some(25));
        assert_eq!(config.listing_depth, 3);
        assert_eq!(config.chunk_size_bytes, 8192);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("listing_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retry_attempts = 7\ncache_expiry_hours = 1\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.retry_attempts, 7);
        assert_eq!(config.cache_expiry(), Duration::from_secs(3600));
    }
}
