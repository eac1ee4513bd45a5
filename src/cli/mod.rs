//! CLI mode for treefetch: list remote trees, download them, manage the cache.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    CrawlEvent, DirectoryCache, DirectoryCrawler, EngineConfig, Error, ListingItem, Result,
    Selection, TransferObserver, TransferScheduler,
};

use progress::{
    CliObserver, print_cache_stats, print_file_list, print_listing, print_summary, spinner,
};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Crawl `url` and print the tree.
    List {
        /// Crawl root.
        url: String,
    },
    /// Crawl `url` and download every file whose path contains `filter`.
    Get {
        /// Crawl root.
        url: String,
        /// Destination root.
        output: PathBuf,
        /// Substring a file path must contain to be selected.
        filter: Option<String>,
    },
    /// Print cache statistics.
    CacheStats,
    /// Remove every cache file.
    CacheClear,
    /// Remove expired and unreadable cache files.
    CachePrune,
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Configuration file to read instead of the default location.
    pub config: Option<PathBuf>,
    /// Overrides `max_concurrent_downloads`.
    pub jobs: Option<usize>,
    /// Overrides `listing_depth`.
    pub depth: Option<usize>,
    /// Subcommand.
    pub command: Command,
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: treefetch [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  list <url>                 Crawl a remote directory and print it");
    eprintln!("  get <url>                  Crawl a remote directory and download its files");
    eprintln!("  cache stats|clear|prune    Inspect or empty the listing cache");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -o, --output <DIR>         Destination folder for 'get' (default: .)");
    eprintln!("  -j, --jobs <N>             Concurrent transfers");
    eprintln!("  -d, --depth <N>            Crawl depth");
    eprintln!("  -f, --filter <TEXT>        Only download paths containing TEXT");
    eprintln!("  -c, --config <PATH>        Configuration file");
    eprintln!("  -h, --help                 Show this help");
}

fn value<'a>(flag: &str, it: &mut impl Iterator<Item = &'a String>) -> std::result::Result<String, String> {
    it.next()
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number(flag: &str, raw: &str) -> std::result::Result<usize, String> {
    raw.parse()
        .map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

/// Parses the arguments following the program name.
///
/// Returns `Ok(None)` when help was requested.
///
/// # Errors
///
/// Returns a message describing the first unusable argument.
pub fn parse_args(args: &[String]) -> std::result::Result<Option<Invocation>, String> {
    let mut config = None;
    let mut jobs = None;
    let mut depth = None;
    let mut output = None;
    let mut filter = None;
    let mut positional = Vec::new();

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-c" | "--config" => config = Some(PathBuf::from(value(arg, &mut it)?)),
            "-o" | "--output" => output = Some(PathBuf::from(value(arg, &mut it)?)),
            "-f" | "--filter" => filter = Some(value(arg, &mut it)?),
            "-j" | "--jobs" => jobs = Some(number(arg, &value(arg, &mut it)?)?),
            "-d" | "--depth" => depth = Some(number(arg, &value(arg, &mut it)?)?),
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            _ => positional.push(arg.clone()),
        }
    }

    let command = match positional.iter().map(String::as_str).collect::<Vec<_>>()[..] {
        ["list", url] => Command::List {
            url: url.to_string(),
        },
        ["get", url] => Command::Get {
            url: url.to_string(),
            output: output.unwrap_or_else(|| PathBuf::from(".")),
            filter,
        },
        ["cache", "stats"] => Command::CacheStats,
        ["cache", "clear"] => Command::CacheClear,
        ["cache", "prune"] => Command::CachePrune,
        [] => return Ok(None),
        _ => return Err(format!("unrecognised command '{}'", positional.join(" "))),
    };

    Ok(Some(Invocation {
        config,
        jobs,
        depth,
        command,
    }))
}

fn load_config(invocation: &Invocation) -> Result<EngineConfig> {
    let path = invocation
        .config
        .clone()
        .unwrap_or_else(EngineConfig::default_path);
    let mut config = EngineConfig::load_or_default(&path)?;
    if let Some(jobs) = invocation.jobs {
        config = config.with_max_concurrent_downloads(jobs);
    }
    if let Some(depth) = invocation.depth {
        config = config.with_listing_depth(depth);
    }
    Ok(config)
}

/// Crawls `url` with a spinner, printing subtree errors as they happen.
async fn crawl(crawler: &DirectoryCrawler, url: &str) -> Result<Vec<ListingItem>> {
    let mut handle = crawler.crawl(url);
    let bar = spinner(&format!("Listing {url}"));
    let mut items = Vec::new();

    let outcome = loop {
        let event = tokio::select! {
            event = handle.events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                continue;
            }
        };
        match event {
            Some(CrawlEvent::Item(item)) => {
                bar.inc(1);
                items.push(item);
            }
            Some(CrawlEvent::SubtreeError { path, message }) => {
                bar.println(format!("  {path}: {message}"));
            }
            Some(CrawlEvent::Completed { from_cache, .. }) => {
                if from_cache {
                    log::info!("Listing of {url} served from cache");
                }
                break Ok(items);
            }
            Some(CrawlEvent::Canceled { .. }) => break Err(Error::Cancelled),
            Some(CrawlEvent::Failed(message)) => break Err(Error::Crawl(message)),
            None => break Err(Error::Crawl("crawl ended without a result".to_string())),
        }
    };
    bar.finish_and_clear();
    outcome
}

async fn get(
    config: EngineConfig,
    crawler: &DirectoryCrawler,
    http: reqwest::Client,
    url: &str,
    output: PathBuf,
    filter: Option<&str>,
) -> Result<()> {
    let items = crawl(crawler, url).await?;
    let files: Vec<&ListingItem> = items
        .iter()
        .filter(|item| !item.is_dir())
        .filter(|item| filter.is_none_or(|f| item.path.contains(f)))
        .collect();
    print_file_list(&files);
    if files.is_empty() {
        return Ok(());
    }

    let selections = files
        .iter()
        .map(|item| Selection::new(item.url_under(url), item.path.clone()))
        .collect();

    let observer = Arc::new(CliObserver::new());
    let scheduler = TransferScheduler::new(
        config,
        http,
        Arc::clone(&observer) as Arc<dyn TransferObserver>,
    );
    let started = Instant::now();

    let queued = tokio::select! {
        queued = scheduler.enqueue(selections, output) => queued,
        _ = tokio::signal::ctrl_c() => {
            scheduler.cancel_all();
            Err(Error::Cancelled)
        }
    };
    match queued {
        Ok(0) => log::warn!("No file could be sized; nothing to download"),
        Ok(n) => log::info!("Downloading {n} file(s)"),
        Err(e) => {
            observer.clear();
            return Err(e);
        }
    }

    tokio::select! {
        () = scheduler.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            let canceled = scheduler.cancel_all();
            log::info!("Interrupted, canceled {canceled} transfer(s)");
            scheduler.wait_idle().await;
        }
    }

    observer.clear();
    print_summary(
        &scheduler.tasks_by_status(),
        scheduler.total_downloaded(),
        started.elapsed(),
    );
    Ok(())
}

/// Runs a parsed command line.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded, the crawl root cannot
/// be listed, or the run was interrupted before transfers started.
pub async fn run(invocation: Invocation) -> Result<()> {
    let config = load_config(&invocation)?;
    let cache = Arc::new(DirectoryCache::new(&config));

    match invocation.command {
        Command::CacheStats => {
            print_cache_stats(&cache.stats().await, cache.directory());
            Ok(())
        }
        Command::CacheClear => {
            println!("Removed {} cache file(s)", cache.clear_all().await);
            Ok(())
        }
        Command::CachePrune => {
            println!("Removed {} expired cache file(s)", cache.clear_expired().await);
            Ok(())
        }
        Command::List { url } => {
            let http = config.http_client()?;
            let crawler = DirectoryCrawler::new(config, cache, http);
            let items = crawl(&crawler, &url).await?;
            print_listing(&items);
            Ok(())
        }
        Command::Get {
            url,
            output,
            filter,
        } => {
            let http = config.http_client()?;
            let crawler = DirectoryCrawler::new(config.clone(), cache, http.clone());
            get(config, &crawler, http, &url, output, filter.as_deref()).await
        }
    }
}
