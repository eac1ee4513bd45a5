//! Depth-bounded, cache-aware directory crawling over HTTP(S) and FTP.
//!
//! A crawl runs on its own task and streams [`CrawlEvent`]s: one
//! [`CrawlEvent::Item`] per discovered entry, any number of
//! [`CrawlEvent::SubtreeError`]s, then exactly one terminal event.
//!
//! A subdirectory that cannot be listed is reported and skipped; the walk
//! continues with its siblings. Only a failure at the crawl root fails the
//! crawl. Listings are written to the [`DirectoryCache`] only after a clean,
//! uncancelled walk that found at least one entry.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use scraper::{Html, Selector};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::DirectoryCache;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ftp::{FtpErrorKind, FtpSession, parse_listing};
use crate::listing::{ItemKind, ListingItem};
use crate::url::{FtpLocation, Scheme, StandardValidator, UrlValidator, decode_path, directory_url};

/// What a running crawl reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlEvent {
    /// A file or directory was found (or replayed from the cache).
    Item(ListingItem),
    /// A subdirectory could not be listed; its siblings are still visited.
    SubtreeError {
        /// Path of the subdirectory relative to the crawl root.
        path: String,
        /// What went wrong.
        message: String,
    },
    /// The crawl finished.
    Completed {
        /// Number of items emitted.
        items: usize,
        /// Whether the items were replayed from the cache.
        from_cache: bool,
    },
    /// The crawl was cancelled after emitting `items` items.
    Canceled {
        /// Number of items emitted before cancellation.
        items: usize,
    },
    /// The crawl root could not be listed.
    Failed(String),
}

impl CrawlEvent {
    /// Returns true for the event that ends a crawl.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Canceled { .. } | Self::Failed(_)
        )
    }
}

/// A crawl running on its own task.
pub struct CrawlHandle {
    /// Event stream; closes after the terminal event.
    pub events: mpsc::UnboundedReceiver<CrawlEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CrawlHandle {
    /// Asks the crawl to stop before its next item or descent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the crawl task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Drains the event stream and returns every item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crawl`] if the root could not be listed and
    /// [`Error::Cancelled`] if the crawl was cancelled.
    pub async fn collect(mut self) -> Result<Vec<ListingItem>> {
        let mut items = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                CrawlEvent::Item(item) => items.push(item),
                CrawlEvent::SubtreeError { path, message } => {
                    log::warn!("Skipped {path}: {message}");
                }
                CrawlEvent::Completed { .. } => return Ok(items),
                CrawlEvent::Canceled { .. } => return Err(Error::Cancelled),
                CrawlEvent::Failed(message) => return Err(Error::Crawl(message)),
            }
        }
        Err(Error::Crawl("crawl ended without a result".to_string()))
    }
}

/// Per-crawl bookkeeping shared by the recursive walk.
struct Walk {
    tx: mpsc::UnboundedSender<CrawlEvent>,
    cancel: CancellationToken,
    depth_limit: usize,
    page_size: usize,
    items: Vec<ListingItem>,
    subtree_errors: usize,
}

impl Walk {
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, item: ListingItem) -> Result<()> {
        self.check_cancel()?;
        let _ = self.tx.send(CrawlEvent::Item(item.clone()));
        self.items.push(item);
        Ok(())
    }

    fn subtree_failed(&mut self, path: &str, error: &Error) {
        log::warn!("Cannot list {path}: {error}");
        self.subtree_errors += 1;
        let _ = self.tx.send(CrawlEvent::SubtreeError {
            path: path.to_string(),
            message: error.to_string(),
        });
    }
}

/// Lists remote directory trees.
#[derive(Clone)]
pub struct DirectoryCrawler {
    config: EngineConfig,
    cache: Arc<DirectoryCache>,
    http: reqwest::Client,
    validator: Arc<dyn UrlValidator>,
}

impl DirectoryCrawler {
    /// Creates a crawler that validates URLs with [`StandardValidator`].
    #[must_use]
    pub fn new(config: EngineConfig, cache: Arc<DirectoryCache>, http: reqwest::Client) -> Self {
        Self::with_validator(config, cache, http, Arc::new(StandardValidator))
    }

    /// Creates a crawler with a custom URL validator.
    #[must_use]
    pub fn with_validator(
        config: EngineConfig,
        cache: Arc<DirectoryCache>,
        http: reqwest::Client,
        validator: Arc<dyn UrlValidator>,
    ) -> Self {
        Self {
            config,
            cache,
            http,
            validator,
        }
    }

    /// Starts crawling `root` on a new task.
    #[must_use]
    pub fn crawl(&self, root: &str) -> CrawlHandle {
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let crawler = self.clone();
        let root = root.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move { crawler.run(root, tx, token).await });
        CrawlHandle {
            events,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        raw_root: String,
        tx: mpsc::UnboundedSender<CrawlEvent>,
        cancel: CancellationToken,
    ) {
        let (root, scheme) = match self
            .validator
            .validate(&raw_root)
            .and_then(|url| Scheme::of(&url).map(|scheme| (url, scheme)))
        {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Cannot crawl {raw_root}: {e}");
                let _ = tx.send(CrawlEvent::Failed(e.to_string()));
                return;
            }
        };
        let page_size = self.config.page_size.unwrap_or(usize::MAX);

        if let Some(cached) = self.cache.get(&root).await {
            let mut items = 0;
            for item in cached.into_iter().take(page_size) {
                if cancel.is_cancelled() {
                    let _ = tx.send(CrawlEvent::Canceled { items });
                    return;
                }
                let _ = tx.send(CrawlEvent::Item(item));
                items += 1;
            }
            let _ = tx.send(CrawlEvent::Completed {
                items,
                from_cache: true,
            });
            return;
        }

        log::info!("Crawling {root} (depth {})", self.config.listing_depth);
        let mut walk = Walk {
            tx: tx.clone(),
            cancel: cancel.clone(),
            depth_limit: self.config.listing_depth,
            page_size,
            items: Vec::new(),
            subtree_errors: 0,
        };
        let result = if scheme.is_http() {
            let base = directory_url(&root);
            self.walk_http(&mut walk, &base, base.clone(), 0).await
        } else {
            self.crawl_ftp(&mut walk, &root).await
        };

        let items = walk.items.len();
        let event = match result {
            _ if cancel.is_cancelled() => {
                log::info!("Crawl of {root} cancelled after {items} item(s)");
                CrawlEvent::Canceled { items }
            }
            Ok(()) => {
                log::info!(
                    "Crawled {root}: {items} item(s), {} unreadable subdirectories",
                    walk.subtree_errors
                );
                if walk.subtree_errors == 0
                    && items > 0
                    && let Err(e) = self.cache.set(&root, walk.items).await
                {
                    log::warn!("Could not cache listing of {root}: {e}");
                }
                CrawlEvent::Completed {
                    items,
                    from_cache: false,
                }
            }
            Err(e) => {
                log::error!("Crawl of {root} failed: {e}");
                CrawlEvent::Failed(e.to_string())
            }
        };
        let _ = tx.send(event);
    }

    /// Races a network future against the request timeout and cancellation.
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        fut: impl Future<Output = T>,
    ) -> Result<T> {
        tokio::select! {
            out = tokio::time::timeout(self.config.request_timeout(), fut) => {
                out.map_err(|_| Error::Timeout(what.to_string()))
            }
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn fetch_page(&self, cancel: &CancellationToken, url: &str) -> Result<String> {
        let response = self
            .guarded(cancel, url, self.http.get(url).send())
            .await??;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = self.guarded(cancel, url, response.text()).await??;
        Ok(body)
    }

    fn walk_http<'a>(
        &'a self,
        walk: &'a mut Walk,
        base: &'a str,
        dir_url: String,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth >= walk.depth_limit {
                return Ok(());
            }
            walk.check_cancel()?;
            log::debug!("Listing {dir_url} at depth {depth}");
            let body = self.fetch_page(&walk.cancel, &dir_url).await?;
            let entries = parse_index(&body, &dir_url, base);

            for entry in entries.into_iter().take(walk.page_size) {
                let is_dir = entry.is_dir();
                let path = entry.path.clone();
                let sub_url = entry.resolved_url.clone();
                walk.emit(entry)?;

                if let (true, Some(sub_url)) = (is_dir, sub_url) {
                    walk.check_cancel()?;
                    match self.walk_http(walk, base, sub_url, depth + 1).await {
                        Ok(()) => {}
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => walk.subtree_failed(&path, &e),
                    }
                }
            }
            Ok(())
        })
    }

    async fn connect_ftp(&self, cancel: &CancellationToken, loc: &FtpLocation) -> Result<FtpSession> {
        let timeout = self.config.request_timeout();
        let session = self
            .guarded(
                cancel,
                "FTP connect",
                FtpSession::connect(&loc.host, loc.port, timeout),
            )
            .await??;
        Ok(session)
    }

    async fn crawl_ftp(&self, walk: &mut Walk, root: &str) -> Result<()> {
        let loc = FtpLocation::parse(root)?;
        let mut session = self.connect_ftp(&walk.cancel, &loc).await?;
        let result = self
            .walk_ftp(walk, &loc, &mut session, String::new(), 0)
            .await;
        session.quit().await;
        result
    }

    fn walk_ftp<'a>(
        &'a self,
        walk: &'a mut Walk,
        loc: &'a FtpLocation,
        session: &'a mut FtpSession,
        rel: String,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth >= walk.depth_limit {
                return Ok(());
            }
            walk.check_cancel()?;
            let dir = ftp_dir(&loc.path, &rel);
            log::debug!("Listing ftp://{}{dir} at depth {depth}", loc.host);

            let cancel = walk.cancel.clone();
            self.guarded(&cancel, "CWD", session.cwd(&dir)).await??;
            let raw = self.guarded(&cancel, "LIST", session.list()).await??;

            for entry in parse_listing(&raw).into_iter().take(walk.page_size) {
                let path = if rel.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{rel}/{}", entry.name)
                };
                let is_dir = entry.kind == ItemKind::Directory;
                walk.emit(ListingItem {
                    name: entry.name,
                    size_raw: entry.size_raw,
                    kind: entry.kind,
                    modified: entry.modified,
                    path: path.clone(),
                    resolved_url: None,
                })?;

                if is_dir {
                    walk.check_cancel()?;
                    match self
                        .walk_ftp(walk, loc, session, path.clone(), depth + 1)
                        .await
                    {
                        Ok(()) => {}
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            walk.subtree_failed(&path, &e);
                            if connection_lost(&e) {
                                *session = self.connect_ftp(&cancel, loc).await?;
                            }
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

/// True when an FTP failure left the control connection unusable.
fn connection_lost(error: &Error) -> bool {
    match error {
        Error::Ftp(e) => e.kind != FtpErrorKind::CommandRejected,
        Error::Timeout(_) | Error::Io(_) => true,
        _ => false,
    }
}

/// Server path of `rel` below the crawl root path.
fn ftp_dir(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    match (root.is_empty(), rel.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => root.to_string(),
        (_, false) => format!("{root}/{rel}"),
    }
}

/// Extracts listing entries from an HTML index page at `page_url`.
///
/// Only links that resolve strictly below `base` are kept. Query and
/// fragment links, "Parent Directory" links and duplicates are skipped.
fn parse_index(body: &str, page_url: &str, base: &str) -> Vec<ListingItem> {
    let Ok(page) = Url::parse(page_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(body);
    let anchors = Selector::parse("a[href]").expect("valid anchor selector");
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        let text = anchor.text().collect::<String>().trim().to_string();

        if href.is_empty()
            || href.starts_with('?')
            || href.starts_with('#')
            || text.eq_ignore_ascii_case("parent directory")
        {
            continue;
        }
        let Ok(mut full) = page.join(href) else {
            continue;
        };
        full.set_fragment(None);
        let full_url = full.to_string();
        let Some(rel) = full_url.strip_prefix(base) else {
            continue;
        };
        let rel = rel.trim_end_matches('/');
        if rel.is_empty() || full.query().is_some() || !seen.insert(full_url.clone()) {
            continue;
        }

        let path = decode_path(rel);
        let name = if text.is_empty() || text.ends_with("..>") {
            path.rsplit('/').next().unwrap_or(&path).to_string()
        } else {
            text
        };
        let kind = if href.ends_with('/') {
            ItemKind::Directory
        } else {
            ItemKind::File
        };
        items.push(ListingItem {
            name,
            size_raw: "-".to_string(),
            kind,
            modified: "-".to_string(),
            path,
            resolved_url: Some(full_url),
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://h/pub/";

    const APACHE_INDEX: &str = r##"<html><body><h1>Index of /pub</h1><pre>
<a href="?C=N;O=D">Name</a> <a href="?C=M;O=A">Last modified</a>
<a href="/">Parent Directory</a>
<a href="docs/"><img src="/icons/folder.gif"></a> <a href="docs/">docs/</a>  01-Jan-2025 12:00  -
<a href="My%20File.txt">My File.txt</a>  01-Jan-2025 12:00  12K
<a href="#top">top</a>
<a href='../'>up</a>
<a href="http://elsewhere/x">elsewhere</a>
<a href=release-1.0.tar.gz>release-1.0.tar.gz</a>
<a href="a&amp;b.bin">a&amp;b.bin</a>
</pre></body></html>"##;

    #[test]
    fn parses_apache_index() {
        let items = parse_index(APACHE_INDEX, BASE, BASE);
        let paths: Vec<_> = items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["docs", "My File.txt", "release-1.0.tar.gz", "a&b.bin"]
        );

        assert_eq!(items[0].kind, ItemKind::Directory);
        assert_eq!(items[0].name, "docs");
        assert_eq!(items[0].resolved_url.as_deref(), Some("http://h/pub/docs/"));
        assert_eq!(items[1].kind, ItemKind::File);
        assert_eq!(items[1].name, "My File.txt");
        assert_eq!(
            items[1].resolved_url.as_deref(),
            Some("http://h/pub/My%20File.txt")
        );
        assert_eq!(items[1].size_raw, "-");
    }

    #[test]
    fn nested_paths_are_relative_to_base() {
        let body = r#"<a href="inner.bin">inner.bin</a><a href="/pub/docs/deeper/">deeper/</a>"#;
        let items = parse_index(body, "http://h/pub/docs/", BASE);
        assert_eq!(items[0].path, "docs/inner.bin");
        assert_eq!(items[1].path, "docs/deeper");
        assert!(items[1].is_dir());
    }

    #[test]
    fn numeric_entities_in_href_are_decoded() {
        let items = parse_index(r#"<a href="a&#38;b.bin">a&#38;b.bin</a>"#, BASE, BASE);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "a&b.bin");
        assert_eq!(items[0].name, "a&b.bin");
        assert_eq!(items[0].resolved_url.as_deref(), Some("http://h/pub/a&b.bin"));
    }

    #[test]
    fn hex_entities_in_link_text_are_decoded() {
        let items = parse_index(r#"<a href="it%27s.txt">it&#x27;s.txt</a>"#, BASE, BASE);
        assert_eq!(items[0].name, "it's.txt");
        assert_eq!(items[0].path, "it's.txt");
        assert_eq!(items[0].resolved_url.as_deref(), Some("http://h/pub/it%27s.txt"));
    }

    #[test]
    fn only_the_href_attribute_is_read() {
        let body = r#"<a data-href="wrong.bin" href="right.bin" title="x">right.bin</a>"#;
        let items = parse_index(body, BASE, BASE);
        let paths: Vec<_> = items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["right.bin"]);
    }

    #[test]
    fn anchors_without_href_are_ignored() {
        let body = r#"<a name="top">top</a><a href="x.bin"><b>x</b>.bin</a>"#;
        let items = parse_index(body, BASE, BASE);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "x.bin");
    }

    #[test]
    fn ftp_dir_joins() {
        assert_eq!(ftp_dir("/", ""), "/");
        assert_eq!(ftp_dir("/pub/", ""), "/pub");
        assert_eq!(ftp_dir("/pub", "a b/c"), "/pub/a b/c");
        assert_eq!(ftp_dir("", "x"), "/x");
    }

    #[test]
    fn lost_connections() {
        use crate::ftp::FtpError;
        assert!(!connection_lost(&Error::Ftp(FtpError::rejected(550, "nope"))));
        assert!(connection_lost(&Error::Ftp(FtpError::disconnected("bye"))));
        assert!(connection_lost(&Error::Timeout("LIST".into())));
        assert!(!connection_lost(&Error::Cancelled));
    }
}
