//! Two-tier cache of directory listings.
//!
//! A bounded in-memory LRU map sits in front of one JSON file per listing URL.
//! File names are `cache_<sha256(url)>.json`, so no URL character ever reaches
//! the file system. Entries expire a fixed time after they were written; expired
//! and corrupt entries are deleted the next time they are looked at.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::listing::ListingItem;

const FILE_PREFIX: &str = "cache_";
const FILE_SUFFIX: &str = ".json";

/// A cached listing as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// When the listing was fetched (ISO-8601 on disk).
    pub timestamp: DateTime<Utc>,
    /// Listing URL the entry belongs to.
    pub url: String,
    /// The listed items.
    pub content: Vec<ListingItem>,
}

/// Summary of the disk tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache files.
    pub count: usize,
    /// Files that are readable and not yet expired.
    pub valid_count: usize,
    /// Files that are expired or unreadable.
    pub expired_count: usize,
    /// Combined size of all cache files.
    pub total_bytes: u64,
}

/// LRU map of URL to entry. `order` runs from least to most recently used.
#[derive(Default)]
struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl MemoryTier {
    fn touch(&mut self, url: &str) {
        if let Some(pos) = self.order.iter().position(|u| u == url)
            && let Some(key) = self.order.remove(pos)
        {
            self.order.push_back(key);
        }
    }

    fn get(&mut self, url: &str) -> Option<&CacheEntry> {
        if self.entries.contains_key(url) {
            self.touch(url);
        }
        self.entries.get(url)
    }

    fn insert(&mut self, entry: CacheEntry, capacity: usize) {
        let url = entry.url.clone();
        if self.entries.insert(url.clone(), entry).is_some() {
            self.touch(&url);
        } else {
            self.order.push_back(url);
        }
        while self.entries.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            log::debug!("Evicted {oldest} from memory cache");
        }
    }

    fn remove(&mut self, url: &str) {
        if self.entries.remove(url).is_some() {
            self.order.retain(|u| u != url);
        }
    }

    fn retain(&mut self, keep: impl Fn(&CacheEntry) -> bool) {
        self.entries.retain(|_, e| keep(e));
        let entries = &self.entries;
        self.order.retain(|u| entries.contains_key(u));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Listing cache shared by every crawl of an engine.
pub struct DirectoryCache {
    directory: PathBuf,
    expiry: TimeDelta,
    capacity: usize,
    memory: Mutex<MemoryTier>,
}

impl DirectoryCache {
    /// Creates a cache using the directory, expiry and capacity from `config`.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_settings(
            config.cache_directory.clone(),
            config.cache_expiry(),
            config.memory_cache_capacity,
        )
    }

    /// Creates a cache with explicit settings.
    #[must_use]
    pub fn with_settings(directory: PathBuf, expiry: Duration, capacity: usize) -> Self {
        Self {
            directory,
            expiry: TimeDelta::from_std(expiry).unwrap_or(TimeDelta::MAX),
            capacity: capacity.max(1),
            memory: Mutex::new(MemoryTier::default()),
        }
    }

    /// Directory holding the cache files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the cache file for `url`.
    #[must_use]
    pub fn file_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.directory
            .join(format!("{FILE_PREFIX}{digest:x}{FILE_SUFFIX}"))
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_valid(&self, entry: &CacheEntry) -> bool {
        Utc::now().signed_duration_since(entry.timestamp) < self.expiry
    }

    /// Looks up the listing for `url`.
    ///
    /// Checks memory first, then disk; a disk hit is copied back into memory.
    /// Expired or corrupt entries are deleted and reported as a miss.
    pub async fn get(&self, url: &str) -> Option<Vec<ListingItem>> {
        {
            let mut memory = self.memory();
            match memory.get(url).map(|e| (self.is_valid(e), e.content.clone())) {
                Some((true, content)) => {
                    log::info!("Memory cache hit for {url}");
                    return Some(content);
                }
                Some((false, _)) => {
                    log::debug!("Memory cache entry for {url} expired");
                    memory.remove(url);
                }
                None => {}
            }
        }

        let path = self.file_for(url);
        let entry = self.read_file(&path).await?;
        if entry.url != url {
            log::warn!("Cache file {} belongs to {}, not {url}", path.display(), entry.url);
            return None;
        }
        if !self.is_valid(&entry) {
            log::info!("Disk cache entry for {url} expired");
            remove_quietly(&path).await;
            return None;
        }

        log::info!("Disk cache hit for {url}");
        let content = entry.content.clone();
        self.memory().insert(entry, self.capacity);
        Some(content)
    }

    /// Reads and parses a cache file. Unreadable or malformed files are removed.
    async fn read_file(&self, path: &Path) -> Option<CacheEntry> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Unreadable cache file {}: {e}", path.display());
                remove_quietly(path).await;
                return None;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Corrupt cache file {}: {e}", path.display());
                remove_quietly(path).await;
                None
            }
        }
    }

    /// Stores the listing for `url` in both tiers, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory or file cannot be written. The
    /// memory tier is updated regardless.
    pub async fn set(&self, url: &str, items: Vec<ListingItem>) -> Result<()> {
        let entry = CacheEntry {
            timestamp: Utc::now(),
            url: url.to_string(),
            content: items,
        };
        let json = serde_json::to_vec_pretty(&entry)?;
        self.memory().insert(entry, self.capacity);

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| Error::disk(&self.directory, e))?;
        let path = self.file_for(url);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Error::disk(&path, e))?;
        log::debug!("Cached listing of {url} in {}", path.display());
        Ok(())
    }

    /// Drops the entry for `url` from both tiers.
    pub async fn remove(&self, url: &str) {
        self.memory().remove(url);
        remove_quietly(&self.file_for(url)).await;
    }

    /// Deletes expired and corrupt entries and returns how many files were removed.
    pub async fn clear_expired(&self) -> usize {
        self.memory().retain(|e| self.is_valid(e));

        let mut removed = 0;
        for path in self.cache_files().await {
            let keep = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
                    .is_ok_and(|entry| self.is_valid(&entry)),
                Err(_) => false,
            };
            if !keep && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        log::info!("Removed {removed} expired cache file(s)");
        removed
    }

    /// Empties both tiers and returns how many files were removed.
    pub async fn clear_all(&self) -> usize {
        self.memory().clear();

        let mut removed = 0;
        for path in self.cache_files().await {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        log::info!("Removed {removed} cache file(s)");
        removed
    }

    /// Counts the disk tier's files by validity and sums their sizes.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for path in self.cache_files().await {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            stats.count += 1;
            stats.total_bytes += bytes.len() as u64;
            let valid = serde_json::from_slice::<CacheEntry>(&bytes)
                .is_ok_and(|entry| self.is_valid(&entry));
            if valid {
                stats.valid_count += 1;
            } else {
                stats.expired_count += 1;
            }
        }
        stats
    }

    /// Number of entries currently held in memory.
    #[must_use]
    pub fn len_in_memory(&self) -> usize {
        self.memory().entries.len()
    }

    async fn cache_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.directory).await else {
            return files;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        files
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!("Could not remove cache file {}: {e}", path.display());
    }
}
