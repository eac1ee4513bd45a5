//! Progress bars and summaries for CLI transfers.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use console::style;
use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};

use crate::{CacheStats, ListingItem, Task, TaskKey, TaskStatus, TasksByStatus, TransferObserver};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";
const TICK: Duration = Duration::from_millis(250);

fn file_bar(size: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("━━╌"),
    );
    bar.set_message(name.to_string());
    bar
}

fn total_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "Total [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec} {msg}",
        )
        .expect("template valid")
        .progress_chars("━━╌"),
    );
    bar
}

/// Spinner shown while a crawl or size check runs.
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} ({pos})").expect("template valid"),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(TICK);
    bar
}

struct FileBar {
    bar: ProgressBar,
    position: u64,
}

/// Draws one bar per running transfer plus a total bar.
pub struct CliObserver {
    multi: MultiProgress,
    total: ProgressBar,
    bars: Mutex<HashMap<TaskKey, FileBar>>,
}

impl CliObserver {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let total = multi.add(total_bar());
        total.enable_steady_tick(TICK);
        Self {
            multi,
            total,
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Removes every bar from the terminal.
    pub fn clear(&self) {
        self.total.finish_and_clear();
        for (_, entry) in self.bars().drain() {
            entry.bar.finish_and_clear();
        }
        self.multi.clear().ok();
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, FileBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }

    /// Moves the task's bar (and the total) to its reported position.
    fn advance(&self, task: &Task) {
        let mut bars = self.bars();
        let entry = bars.entry(task.key()).or_insert_with(|| {
            let bar = self
                .multi
                .insert_before(&self.total, file_bar(task.size_bytes, &task.relative_path));
            bar.enable_steady_tick(TICK);
            FileBar { bar, position: 0 }
        });
        if task.size_bytes > 0 {
            entry.bar.set_length(task.size_bytes);
        }
        if task.downloaded_bytes > entry.position {
            self.total.inc(task.downloaded_bytes - entry.position);
            entry.position = task.downloaded_bytes;
            entry.bar.set_position(entry.position);
        }
    }

    fn retire(&self, task: &Task) -> Option<FileBar> {
        self.bars().remove(&task.key())
    }
}

impl TransferObserver for CliObserver {
    fn on_size_progress(&self, processed: usize, total: usize) {
        self.total.set_message(format!("(sizing {processed}/{total})"));
    }

    fn on_task_added(&self, task: &Task) {
        self.total.inc_length(task.size_bytes);
        self.total.set_message(String::new());
    }

    fn on_status_changed(&self, task: &Task) {
        match task.status {
            TaskStatus::Downloading => self.advance(task),
            TaskStatus::Completed => {
                self.advance(task);
                if let Some(entry) = self.retire(task) {
                    entry.bar.finish_and_clear();
                }
                self.println(format!(
                    "  {} - {}",
                    task.relative_path,
                    HumanBytes(task.downloaded_bytes)
                ));
            }
            TaskStatus::Canceled => {
                if let Some(entry) = self.retire(task) {
                    entry.bar.abandon_with_message(format!("{} (canceled)", task.relative_path));
                }
            }
            TaskStatus::Failed => {
                if let Some(entry) = self.retire(task) {
                    entry.bar.abandon();
                }
            }
            TaskStatus::Queued | TaskStatus::Paused => {}
        }
    }

    fn on_progress(&self, task: &Task) {
        self.advance(task);
    }

    fn on_retrying(&self, task: &Task, attempt: u32) {
        self.println(format!(
            "  {} - {}",
            task.relative_path,
            style(format!("retrying (attempt {attempt})")).yellow()
        ));
    }

    fn on_task_failed(&self, task: &Task, message: &str) {
        self.println(format!(
            "  {} - {} {message}",
            task.relative_path,
            style("FAILED:").red().bold()
        ));
    }
}

/// Prints a crawl result as an indented tree.
pub fn print_listing(items: &[ListingItem]) {
    if items.is_empty() {
        println!("No entries found.");
        return;
    }
    for item in items {
        let depth = item.path.matches('/').count();
        let indent = "  ".repeat(depth + 1);
        if item.is_dir() {
            println!("{indent}{}/", item.name.trim_end_matches('/'));
        } else {
            println!("{indent}{} ({}, {})", item.name, item.size_raw, item.modified);
        }
    }
    let dirs = items.iter().filter(|i| i.is_dir()).count();
    println!("{SEPARATOR}");
    println!("  {} file(s), {dirs} directory(ies)", items.len() - dirs);
}

/// Prints the files about to be transferred.
pub fn print_file_list(files: &[&ListingItem]) {
    if files.is_empty() {
        println!("No files selected.");
        return;
    }
    println!("\n{SEPARATOR}");
    println!("Files to download:");
    println!("{SEPARATOR}");
    for item in files {
        println!("  {} ({})", item.path, item.size_raw);
    }
    println!("{SEPARATOR}");
    println!("  {} file(s)", files.len());
    println!("{SEPARATOR}\n");
}

/// Prints the outcome of a `get` run.
pub fn print_summary(groups: &TasksByStatus, downloaded: u64, elapsed: Duration) {
    println!("\n{SEPARATOR}");
    println!("{}", style("Download Summary").bold());
    println!("{SEPARATOR}");
    println!("  Completed:         {}", groups.completed.len());
    println!("  Transferred:       {}", HumanBytes(downloaded));
    println!("  Total time:        {}", HumanDuration(elapsed));
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let rate = (downloaded as f64 / secs) as u64;
        println!("  Average speed:     {}/s", HumanBytes(rate));
    }
    if !groups.failed.is_empty() {
        println!("  Failed:            {}", style(groups.failed.len()).red());
        for task in &groups.failed {
            println!(
                "    {} ({})",
                task.relative_path,
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if !groups.canceled.is_empty() {
        println!("  Canceled:          {}", groups.canceled.len());
    }
    println!("{SEPARATOR}");
}

/// Prints listing cache statistics.
pub fn print_cache_stats(stats: &CacheStats, directory: &std::path::Path) {
    println!("Cache directory:     {}", directory.display());
    println!("  Entries:           {}", stats.count);
    println!("  Valid:             {}", stats.valid_count);
    println!("  Expired:           {}", stats.expired_count);
    println!("  Size on disk:      {}", HumanBytes(stats.total_bytes));
}
