//! treefetch - crawl FTP/HTTP directory trees and download what you pick.
//!
//! The engine is split into independent pieces that share one
//! [`EngineConfig`] and one `reqwest::Client`:
//!
//! - [`DirectoryCrawler`] lists a remote tree, consulting the
//!   [`DirectoryCache`] first.
//! - [`SizeCalculator`] sizes the files the caller selects.
//! - [`TransferScheduler`] queues them and runs [`TransferWorker`]s with
//!   resume, pause, cancel and retry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treefetch::{
//!     DirectoryCache, DirectoryCrawler, EngineConfig, NoObserver, Selection,
//!     TransferScheduler,
//! };
//!
//! # async fn example() -> treefetch::Result<()> {
//! let config = EngineConfig::default();
//! let http = config.http_client()?;
//! let cache = Arc::new(DirectoryCache::new(&config));
//!
//! let crawler = DirectoryCrawler::new(config.clone(), cache, http.clone());
//! let root = "https://mirror.example.org/pub/";
//! let items = crawler.crawl(root).collect().await?;
//!
//! let selections = items
//!     .iter()
//!     .filter(|item| !item.is_dir())
//!     .map(|item| Selection::new(item.url_under(root), item.path.clone()))
//!     .collect();
//!
//! let scheduler = TransferScheduler::new(config, http, Arc::new(NoObserver));
//! scheduler.enqueue(selections, "downloads").await?;
//! scheduler.wait_idle().await;
//! println!("Downloaded {} bytes", scheduler.total_downloaded());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod config;
pub mod crawler;
pub mod error;
pub mod fs;
pub mod ftp;
pub mod listing;
pub mod scheduler;
pub mod size;
pub mod url;
pub mod worker;

#[cfg(feature = "cli")]
pub mod cli;

pub use cache::{CacheEntry, CacheStats, DirectoryCache};
pub use config::EngineConfig;
pub use crawler::{CrawlEvent, CrawlHandle, DirectoryCrawler};
pub use error::{Error, Result};
pub use fs::{FileSystem, TokioFileSystem};
pub use listing::{ItemKind, ListingItem};
pub use scheduler::{
    NoObserver, OverallProgress, Selection, Task, TaskKey, TaskStatus, TasksByStatus,
    TransferObserver, TransferScheduler,
};
pub use size::{SizeCalculator, SizeJob, SizeReport};
pub use crate::url::{StandardValidator, UrlValidator};
pub use worker::{TransferJob, TransferWorker, WorkerEvent, WorkerEventKind, WorkerHandle};
