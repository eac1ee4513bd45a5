//! Remote file sizes without downloading content.
//!
//! HTTP URLs are sized with a `HEAD` request, FTP URLs with `SIZE` on a fresh
//! anonymous session. A URL whose size cannot be determined is left out of the
//! report; callers treat such files as unschedulable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ftp::FtpSession;
use crate::url::{FtpLocation, Scheme};

/// Size lookups in flight at once.
const LOOKUP_CONCURRENCY: usize = 4;

/// Sizes of every URL that could be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeReport {
    /// Sum of all resolved sizes.
    pub total_bytes: u64,
    /// Size per resolved URL. Unresolvable URLs are absent.
    pub sizes: HashMap<String, u64>,
}

/// Looks up remote file sizes.
#[derive(Clone)]
pub struct SizeCalculator {
    http: reqwest::Client,
    timeout: Duration,
}

impl SizeCalculator {
    /// Creates a calculator sharing the engine's HTTP client.
    #[must_use]
    pub fn new(config: &EngineConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: config.request_timeout(),
        }
    }

    /// Sizes every URL in `urls`, calling `on_progress(processed, total)` after
    /// each lookup.
    ///
    /// Returns `None` if `cancel` was raised before the batch finished.
    pub async fn compute<P>(
        &self,
        urls: &[String],
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Option<SizeReport>
    where
        P: Fn(usize, usize) + Send + Sync,
    {
        let total = urls.len();
        let processed = AtomicUsize::new(0);

        let results: Vec<(String, Option<u64>)> = stream::iter(urls.iter().cloned())
            .map(|url: String| {
                let processed = &processed;
                let on_progress = &on_progress;
                async move {
                    if cancel.is_cancelled() {
                        return (url, None);
                    }
                    let size = match self.size_of(&url).await {
                        Ok(size) => Some(size),
                        Err(e) => {
                            log::warn!("Size check failed for {url}: {e}");
                            None
                        }
                    };
                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    on_progress(done, total);
                    (url, size)
                }
            })
            .buffer_unordered(LOOKUP_CONCURRENCY)
            .collect()
            .await;

        if cancel.is_cancelled() {
            log::info!("Size calculation stopped");
            return None;
        }

        let sizes: HashMap<String, u64> = results
            .into_iter()
            .filter_map(|(url, size)| size.map(|s| (url, s)))
            .collect();
        let total_bytes = sizes.values().sum();
        log::info!(
            "Sized {} of {total} file(s): {total_bytes} bytes",
            sizes.len()
        );
        Some(SizeReport { total_bytes, sizes })
    }

    /// Runs [`compute`](Self::compute) on its own task.
    #[must_use]
    pub fn spawn(&self, urls: Vec<String>) -> SizeJob {
        let (tx, progress) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let calc = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            calc.compute(
                &urls,
                move |done, total| {
                    let _ = tx.send((done, total));
                },
                &token,
            )
            .await
        });
        SizeJob {
            progress,
            cancel,
            handle,
        }
    }

    /// Size of a single remote file.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is unsupported or the server cannot be
    /// queried.
    pub async fn size_of(&self, url: &str) -> Result<u64> {
        match Scheme::of(url)? {
            Scheme::Http | Scheme::Https => self.http_size(url).await,
            Scheme::Ftp => self.ftp_size(url).await,
        }
    }

    async fn http_size(&self, url: &str) -> Result<u64> {
        let response = self.http.head(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        // `content_length()` reports the (empty) HEAD body, so read the header.
        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn ftp_size(&self, url: &str) -> Result<u64> {
        let loc = FtpLocation::parse(url)?;
        let mut session = FtpSession::connect(&loc.host, loc.port, self.timeout).await?;
        let size = session.size(&loc.path).await;
        session.quit().await;
        Ok(size?)
    }
}

/// A size calculation running on its own task.
pub struct SizeJob {
    /// `(processed, total)` after each lookup.
    pub progress: mpsc::UnboundedReceiver<(usize, usize)>,
    cancel: CancellationToken,
    handle: JoinHandle<Option<SizeReport>>,
}

impl SizeJob {
    /// Raises the stop flag. Lookups already issued may still finish.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the job. `None` if it was stopped or panicked.
    pub async fn join(self) -> Option<SizeReport> {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Size calculation task failed: {e}");
                None
            }
        }
    }
}
