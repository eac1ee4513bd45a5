//! Transfer queue, worker pool and task bookkeeping.
//!
//! All task state lives in one [`SchedulerState`] behind a single mutex. The
//! lock is taken for every mutation and never held across an `.await`:
//! caller operations and the event pump (the one task that applies worker
//! events) both mutate under it, dispatch under it, and only notify the
//! [`TransferObserver`] after releasing it.
//!
//! A worker slot is freed only when the worker reports its exit, and the
//! freed slot is refilled in the same critical section.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::size::SizeCalculator;
use crate::url::{StandardValidator, UrlValidator};
use crate::worker::{
    TransferJob, TransferWorker, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId,
    WorkerStatus, destination_path,
};

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting for a free worker slot.
    Queued,
    /// A worker is transferring the file.
    Downloading,
    /// The worker is parked with its connection open.
    Paused,
    /// The file is complete on disk.
    Completed,
    /// The transfer gave up; see [`Task::error`].
    Failed,
    /// Cancelled by the caller. The partial file is kept.
    Canceled,
}

impl TaskStatus {
    /// Queued, Downloading or Paused.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading | Self::Paused)
    }

    /// Completed, Failed or Canceled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        };
        f.write_str(label)
    }
}

/// Identity of a task: one per (url, relative path) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    /// Canonical source URL.
    pub url: String,
    /// Destination path relative to the task's destination root.
    pub relative_path: String,
}

/// A file the caller picked for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Source URL (validated before use).
    pub url: String,
    /// Where below the destination root the file goes.
    pub relative_path: String,
}

impl Selection {
    /// Creates a selection.
    pub fn new(url: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            relative_path: relative_path.into(),
        }
    }
}

/// One queued, running or finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Canonical source URL.
    pub url: String,
    /// Destination path relative to `destination_root`.
    pub relative_path: String,
    /// Base folder fixed at enqueue time.
    pub destination_root: PathBuf,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Expected size, 0 while unknown.
    pub size_bytes: u64,
    /// 0 to 100, derived from the last reported byte counts.
    pub progress_percent: u8,
    /// Bytes on disk according to the last report.
    pub downloaded_bytes: u64,
    /// Reason for the last failure.
    pub error: Option<String>,
    worker: Option<WorkerId>,
    period: u64,
}

impl Task {
    /// The task's identity.
    #[must_use]
    pub fn key(&self) -> TaskKey {
        TaskKey {
            url: self.url.clone(),
            relative_path: self.relative_path.clone(),
        }
    }

    /// Local file the task writes.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        destination_path(&self.destination_root, &self.relative_path)
    }

    fn record_progress(&mut self, downloaded: u64, total: u64) {
        self.downloaded_bytes = self.downloaded_bytes.max(downloaded);
        if self.size_bytes == 0 && total > 0 {
            self.size_bytes = total;
        }
        self.progress_percent = percent(self.downloaded_bytes, self.size_bytes);
    }
}

/// Byte-weighted completion, 0 when `total` is unknown.
#[must_use]
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u128::from(done.min(total)) * 100 / u128::from(total);
    u8::try_from(pct).unwrap_or(100)
}

/// Tasks grouped for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TasksByStatus {
    /// Queued, Downloading or Paused.
    pub active: Vec<Task>,
    /// Completed.
    pub completed: Vec<Task>,
    /// Failed.
    pub failed: Vec<Task>,
    /// Canceled.
    pub canceled: Vec<Task>,
}

/// Byte totals across every task that was not cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverallProgress {
    /// Bytes on disk.
    pub downloaded_bytes: u64,
    /// Expected bytes.
    pub total_bytes: u64,
    /// `downloaded_bytes` as a percentage of `total_bytes`.
    pub percent: u8,
}

/// Receives task changes from a [`TransferScheduler`].
///
/// Every method has a no-op default. Callbacks run after the scheduler's lock
/// is released, on whichever task caused the change.
pub trait TransferObserver: Send + Sync {
    /// Size lookups for an `enqueue` call are progressing.
    fn on_size_progress(&self, _processed: usize, _total: usize) {}

    /// A task was created.
    fn on_task_added(&self, _task: &Task) {}

    /// A task changed status.
    fn on_status_changed(&self, _task: &Task) {}

    /// A task reported new byte counts.
    fn on_progress(&self, _task: &Task) {}

    /// A task's worker is about to retry.
    fn on_retrying(&self, _task: &Task, _attempt: u32) {}

    /// A task failed.
    fn on_task_failed(&self, _task: &Task, _message: &str) {}

    /// Every queued transfer settled and the byte total was reached.
    fn on_all_finished(&self, _downloaded_bytes: u64) {}
}

/// An observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl TransferObserver for NoObserver {}

/// Observer calls collected under the lock, delivered after it.
enum Notice {
    Added(Task),
    Status(Task),
    Progress(Task),
    Retrying(Task, u32),
    Failed(Task, String),
    AllFinished(u64),
    Idle { seq: u64, idle: bool },
}

struct ActiveWorker {
    key: TaskKey,
    handle: WorkerHandle,
}

struct SchedulerState {
    tasks: Vec<Task>,
    index: HashMap<TaskKey, usize>,
    queue: VecDeque<TaskKey>,
    workers: HashMap<WorkerId, ActiveWorker>,
    next_worker: WorkerId,
    total_downloaded: u64,
    /// Settling period new tasks join; bumped when all-finished fires.
    period: u64,
    idle_seq: u64,
    sizing: CancellationToken,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            index: HashMap::new(),
            queue: VecDeque::new(),
            workers: HashMap::new(),
            next_worker: 1,
            total_downloaded: 0,
            period: 0,
            idle_seq: 0,
            sizing: CancellationToken::new(),
        }
    }

    fn worker_handle(&self, task: usize) -> Option<&WorkerHandle> {
        self.tasks[task]
            .worker
            .and_then(|id| self.workers.get(&id))
            .map(|w| &w.handle)
    }
}

struct Shared {
    config: EngineConfig,
    http: reqwest::Client,
    sizes: SizeCalculator,
    validator: Arc<dyn UrlValidator>,
    observer: Arc<dyn TransferObserver>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    idle: watch::Sender<(u64, bool)>,
    state: Mutex<SchedulerState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for worker in state.workers.values() {
            worker.handle.cancel();
        }
    }
}

/// Runs queued transfers with a bounded number of concurrent workers.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct TransferScheduler {
    shared: Arc<Shared>,
}

impl TransferScheduler {
    /// Creates a scheduler that validates URLs with [`StandardValidator`].
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        http: reqwest::Client,
        observer: Arc<dyn TransferObserver>,
    ) -> Self {
        Self::with_validator(config, http, observer, Arc::new(StandardValidator))
    }

    /// Creates a scheduler with a custom URL validator.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_validator(
        config: EngineConfig,
        http: reqwest::Client,
        observer: Arc<dyn TransferObserver>,
        validator: Arc<dyn UrlValidator>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (idle, _) = watch::channel((0, true));
        let shared = Arc::new(Shared {
            sizes: SizeCalculator::new(&config, http.clone()),
            config,
            http,
            validator,
            observer,
            events,
            idle,
            state: Mutex::new(SchedulerState::new()),
        });
        tokio::spawn(pump(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    /// Sizes the new selections and queues every one whose size is known.
    ///
    /// Selections whose URL is rejected, whose (url, path) pair already has a
    /// task, or whose size cannot be determined are skipped. Returns how many
    /// tasks were added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if [`cancel_all`](Self::cancel_all) stopped
    /// the size calculation.
    pub async fn enqueue(
        &self,
        selections: Vec<Selection>,
        destination_root: impl Into<PathBuf>,
    ) -> Result<usize> {
        let root = destination_root.into();
        let (fresh, sizing) = {
            let state = self.shared.lock();
            let mut seen = HashSet::new();
            let mut fresh = Vec::new();
            for sel in selections {
                let url = match self.shared.validator.validate(&sel.url) {
                    Ok(url) => url,
                    Err(e) => {
                        log::warn!("Skipping {}: {e}", sel.url);
                        continue;
                    }
                };
                let key = TaskKey {
                    url,
                    relative_path: sel.relative_path,
                };
                if !state.index.contains_key(&key) && seen.insert(key.clone()) {
                    fresh.push(key);
                }
            }
            (fresh, state.sizing.clone())
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut urls: Vec<String> = fresh.iter().map(|k| k.url.clone()).collect();
        urls.sort_unstable();
        urls.dedup();
        let observer = Arc::clone(&self.shared.observer);
        let report = self
            .shared
            .sizes
            .compute(
                &urls,
                move |done, total| observer.on_size_progress(done, total),
                &sizing,
            )
            .await
            .ok_or(Error::Cancelled)?;

        let mut notices = Vec::new();
        let added = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let mut added = 0;
            for key in fresh {
                let Some(&size) = report.sizes.get(&key.url) else {
                    log::warn!("Not queueing {}: size unknown", key.url);
                    continue;
                };
                if state.index.contains_key(&key) {
                    continue;
                }
                let task = Task {
                    url: key.url.clone(),
                    relative_path: key.relative_path.clone(),
                    destination_root: root.clone(),
                    status: TaskStatus::Queued,
                    size_bytes: size,
                    progress_percent: 0,
                    downloaded_bytes: 0,
                    error: None,
                    worker: None,
                    period: state.period,
                };
                notices.push(Notice::Added(task.clone()));
                state.index.insert(key.clone(), state.tasks.len());
                state.tasks.push(task);
                state.queue.push_back(key);
                added += 1;
            }
            if added > 0 {
                log::info!("Queued {added} transfer(s) into {}", root.display());
                self.shared.dispatch(state, &mut notices);
            }
            added
        };
        self.shared.deliver(notices);
        Ok(added)
    }

    /// Pauses the running transfer(s) of `url`. Returns true if any changed.
    pub fn pause(&self, url: &str) -> bool {
        self.shared.transition(Some(url), pause_task) > 0
    }

    /// Resumes the paused transfer(s) of `url`. Returns true if any changed.
    pub fn resume(&self, url: &str) -> bool {
        self.shared.transition(Some(url), resume_task) > 0
    }

    /// Cancels the queued, running or paused transfer(s) of `url`.
    /// Returns true if any changed.
    pub fn cancel(&self, url: &str) -> bool {
        self.shared.transition(Some(url), cancel_task) > 0
    }

    /// Re-queues the failed or cancelled transfer(s) of `url`.
    /// Returns true if any changed.
    pub fn retry(&self, url: &str) -> bool {
        self.shared.transition(Some(url), retry_task) > 0
    }

    /// Pauses every running transfer and returns how many were paused.
    pub fn pause_all(&self) -> usize {
        self.shared.transition(None, pause_task)
    }

    /// Resumes every paused transfer and returns how many were resumed.
    pub fn resume_all(&self) -> usize {
        self.shared.transition(None, resume_task)
    }

    /// Cancels every queued, running and paused transfer, plus any size
    /// calculation in progress. Returns how many tasks were cancelled.
    pub fn cancel_all(&self) -> usize {
        {
            let mut state = self.shared.lock();
            state.sizing.cancel();
            state.sizing = CancellationToken::new();
        }
        self.shared.transition(None, cancel_task)
    }

    /// Every task in creation order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.shared.lock().tasks.clone()
    }

    /// The first task for `url`.
    #[must_use]
    pub fn task(&self, url: &str) -> Option<Task> {
        let url = self.shared.canonical(url);
        self.shared
            .lock()
            .tasks
            .iter()
            .find(|t| t.url == url)
            .cloned()
    }

    /// Tasks grouped into active, completed, failed and canceled.
    #[must_use]
    pub fn tasks_by_status(&self) -> TasksByStatus {
        let mut groups = TasksByStatus::default();
        for task in self.tasks() {
            match task.status {
                TaskStatus::Completed => groups.completed.push(task),
                TaskStatus::Failed => groups.failed.push(task),
                TaskStatus::Canceled => groups.canceled.push(task),
                _ => groups.active.push(task),
            }
        }
        groups
    }

    /// Byte progress across all tasks that were not cancelled.
    #[must_use]
    pub fn overall_progress(&self) -> OverallProgress {
        let state = self.shared.lock();
        let (downloaded_bytes, total_bytes) = state
            .tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Canceled)
            .fold((0, 0), |(d, t), task| {
                (d + task.downloaded_bytes, t + task.size_bytes)
            });
        OverallProgress {
            downloaded_bytes,
            total_bytes,
            percent: percent(downloaded_bytes, total_bytes),
        }
    }

    /// Number of tasks currently Downloading.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared
            .lock()
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Downloading)
            .count()
    }

    /// Bytes accounted to completed transfers, resumed prefixes included.
    #[must_use]
    pub fn total_downloaded(&self) -> u64 {
        self.shared.lock().total_downloaded
    }

    /// Waits until the queue is empty and no worker is alive.
    ///
    /// Returns immediately when nothing has been queued. Call it after
    /// [`enqueue`](Self::enqueue) has returned.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.idle.subscribe();
        let _ = rx.wait_for(|(_, idle)| *idle).await;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn canonical(&self, url: &str) -> String {
        self.validator
            .validate(url)
            .unwrap_or_else(|_| url.to_string())
    }

    /// Applies `apply` to every task of `url` (every task when `None`) and
    /// dispatches if anything changed.
    fn transition(
        &self,
        url: Option<&str>,
        apply: fn(&mut SchedulerState, usize) -> bool,
    ) -> usize {
        let url = url.map(|u| self.canonical(u));
        let mut notices = Vec::new();
        let changed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut changed = 0;
            for i in 0..state.tasks.len() {
                if url.as_ref().is_some_and(|u| *u != state.tasks[i].url) {
                    continue;
                }
                if apply(state, i) {
                    changed += 1;
                    notices.push(Notice::Status(state.tasks[i].clone()));
                }
            }
            if changed > 0 {
                self.dispatch(state, &mut notices);
            }
            changed
        };
        self.deliver(notices);
        changed
    }

    /// Starts workers for queued tasks, oldest first, up to the concurrency cap.
    ///
    /// A task whose previous worker has not exited yet stays queued.
    fn dispatch(&self, state: &mut SchedulerState, notices: &mut Vec<Notice>) {
        let cap = self.config.concurrency();
        while state.workers.len() < cap {
            let next = state.queue.iter().position(|key| {
                state
                    .index
                    .get(key)
                    .is_some_and(|&i| state.tasks[i].worker.is_none())
            });
            let Some(key) = next.and_then(|pos| state.queue.remove(pos)) else {
                break;
            };
            let Some(&i) = state.index.get(&key) else {
                continue;
            };

            let id = state.next_worker;
            state.next_worker += 1;
            let task = &mut state.tasks[i];
            let job = TransferJob {
                url: task.url.clone(),
                destination: task.file_path(),
                expected_size: task.size_bytes,
            };
            log::info!("Starting {} -> {}", job.url, job.destination.display());
            let handle =
                TransferWorker::spawn(id, job, &self.config, self.http.clone(), self.events.clone());
            task.worker = Some(id);
            task.status = TaskStatus::Downloading;
            task.error = None;
            notices.push(Notice::Status(task.clone()));
            state.workers.insert(id, ActiveWorker { key, handle });
        }
        self.settle(state, notices);
    }

    /// Publishes the idle flag and fires all-finished once per settling period.
    fn settle(&self, state: &mut SchedulerState, notices: &mut Vec<Notice>) {
        let idle = state.queue.is_empty() && state.workers.is_empty();
        state.idle_seq += 1;
        let seq = state.idle_seq;

        if idle {
            let mut any = false;
            let (mut done, mut total) = (0u64, 0u64);
            for task in state.tasks.iter().filter(|t| t.period == state.period) {
                any = true;
                total += task.size_bytes;
                if task.status == TaskStatus::Completed {
                    done += task.downloaded_bytes;
                }
            }
            if any && done + 1 >= total {
                log::info!("All transfers finished ({done} bytes)");
                state.period += 1;
                notices.push(Notice::AllFinished(done));
            }
        }
        notices.push(Notice::Idle { seq, idle });
    }

    /// Applies one worker event under the lock.
    fn handle_event(&self, event: WorkerEvent) {
        let mut notices = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(key) = state.workers.get(&event.worker).map(|w| w.key.clone()) else {
                log::debug!("Ignoring event from retired worker {}", event.worker);
                return;
            };
            let terminal = event.kind.is_terminal();
            if terminal {
                state.workers.remove(&event.worker);
            }
            let Some(&i) = state.index.get(&key) else {
                return;
            };
            let task = &mut state.tasks[i];
            if terminal && task.worker == Some(event.worker) {
                task.worker = None;
            }
            // Events only count while the scheduler still considers the
            // worker attached, i.e. not after cancel or retry.
            let attached = matches!(task.status, TaskStatus::Downloading | TaskStatus::Paused);

            match event.kind {
                WorkerEventKind::Progress { downloaded, total } if attached => {
                    task.record_progress(downloaded, total);
                    notices.push(Notice::Progress(task.clone()));
                }
                WorkerEventKind::Status(WorkerStatus::Retrying { attempt }) if attached => {
                    notices.push(Notice::Retrying(task.clone(), attempt));
                }
                WorkerEventKind::Finished {
                    session_bytes,
                    resumed_from,
                } if attached => {
                    let bytes = session_bytes + resumed_from;
                    task.downloaded_bytes = task.downloaded_bytes.max(bytes);
                    if task.size_bytes == 0 {
                        task.size_bytes = task.downloaded_bytes;
                    }
                    task.status = TaskStatus::Completed;
                    task.progress_percent = 100;
                    task.error = None;
                    notices.push(Notice::Status(task.clone()));
                    state.total_downloaded += bytes;
                }
                WorkerEventKind::Failed { message } if attached => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(message.clone());
                    notices.push(Notice::Failed(task.clone(), message));
                }
                WorkerEventKind::Canceled if attached => {
                    task.status = TaskStatus::Canceled;
                    notices.push(Notice::Status(task.clone()));
                }
                _ => {}
            }

            if terminal {
                self.dispatch(state, &mut notices);
            }
        }
        self.deliver(notices);
    }

    fn deliver(&self, notices: Vec<Notice>) {
        let observer = &self.observer;
        for notice in notices {
            match notice {
                Notice::Added(task) => observer.on_task_added(&task),
                Notice::Status(task) => observer.on_status_changed(&task),
                Notice::Progress(task) => observer.on_progress(&task),
                Notice::Retrying(task, attempt) => observer.on_retrying(&task, attempt),
                Notice::Failed(task, message) => {
                    observer.on_status_changed(&task);
                    observer.on_task_failed(&task, &message);
                }
                Notice::AllFinished(bytes) => observer.on_all_finished(bytes),
                Notice::Idle { seq, idle } => {
                    self.idle.send_if_modified(|current| {
                        if seq <= current.0 {
                            return false;
                        }
                        let changed = current.1 != idle;
                        *current = (seq, idle);
                        changed
                    });
                }
            }
        }
    }
}

fn pause_task(state: &mut SchedulerState, i: usize) -> bool {
    if state.tasks[i].status != TaskStatus::Downloading {
        return false;
    }
    if let Some(handle) = state.worker_handle(i) {
        handle.pause();
    }
    log::info!("Paused {}", state.tasks[i].url);
    state.tasks[i].status = TaskStatus::Paused;
    true
}

fn resume_task(state: &mut SchedulerState, i: usize) -> bool {
    if state.tasks[i].status != TaskStatus::Paused {
        return false;
    }
    if let Some(handle) = state.worker_handle(i) {
        handle.resume();
    }
    log::info!("Resumed {}", state.tasks[i].url);
    state.tasks[i].status = TaskStatus::Downloading;
    true
}

fn cancel_task(state: &mut SchedulerState, i: usize) -> bool {
    match state.tasks[i].status {
        TaskStatus::Downloading | TaskStatus::Paused => {
            if let Some(handle) = state.worker_handle(i) {
                handle.cancel();
            }
        }
        TaskStatus::Queued => {
            let key = state.tasks[i].key();
            state.queue.retain(|k| *k != key);
        }
        _ => return false,
    }
    log::info!("Canceled {}", state.tasks[i].url);
    state.tasks[i].status = TaskStatus::Canceled;
    true
}

fn retry_task(state: &mut SchedulerState, i: usize) -> bool {
    if !matches!(
        state.tasks[i].status,
        TaskStatus::Failed | TaskStatus::Canceled
    ) {
        return false;
    }
    let period = state.period;
    let task = &mut state.tasks[i];
    log::info!("Retrying {}", task.url);
    task.status = TaskStatus::Queued;
    task.progress_percent = 0;
    task.downloaded_bytes = 0;
    task.error = None;
    task.period = period;
    let key = task.key();
    state.queue.push_back(key);
    true
}

/// Applies worker events until the scheduler is dropped.
async fn pump(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(url: &str, status: TaskStatus) -> Task {
        Task {
            url: url.to_string(),
            relative_path: "f".to_string(),
            destination_root: PathBuf::from("/dl"),
            status,
            size_bytes: 10,
            progress_percent: 0,
            downloaded_bytes: 0,
            error: None,
            worker: None,
            period: 0,
        }
    }

    fn state_with(tasks: Vec<Task>) -> SchedulerState {
        let mut state = SchedulerState::new();
        for t in tasks {
            let key = t.key();
            if t.status == TaskStatus::Queued {
                state.queue.push_back(key.clone());
            }
            state.index.insert(key, state.tasks.len());
            state.tasks.push(t);
        }
        state
    }

    #[test]
    fn status_classes() {
        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Paused.is_active());
        assert!(TaskStatus::Canceled.is_terminal());
        assert_eq!(TaskStatus::Downloading.to_string(), "Downloading");
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
        assert_eq!(percent(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn progress_never_goes_backwards() {
        let mut t = task("http://h/a", TaskStatus::Downloading);
        t.size_bytes = 0;
        t.record_progress(40, 100);
        assert_eq!((t.downloaded_bytes, t.size_bytes, t.progress_percent), (40, 100, 40));
        t.record_progress(20, 100);
        assert_eq!(t.downloaded_bytes, 40);
    }

    #[test]
    fn file_path_joins_root() {
        let mut t = task("http://h/a", TaskStatus::Queued);
        t.relative_path = "dir/sub/a.bin".to_string();
        assert_eq!(t.file_path(), PathBuf::from("/dl/dir/sub/a.bin"));
    }

    #[test]
    fn cancel_removes_queued_task_from_queue() {
        let mut state = state_with(vec![
            task("http://h/a", TaskStatus::Queued),
            task("http://h/b", TaskStatus::Queued),
        ]);
        assert!(cancel_task(&mut state, 0));
        assert_eq!(state.tasks[0].status, TaskStatus::Canceled);
        assert_eq!(state.queue.len(), 1);
        assert!(!cancel_task(&mut state, 0));
    }

    #[test]
    fn retry_only_from_failed_or_canceled() {
        let mut state = state_with(vec![
            task("http://h/a", TaskStatus::Completed),
            task("http://h/b", TaskStatus::Failed),
        ]);
        state.tasks[1].error = Some("boom".to_string());
        state.tasks[1].downloaded_bytes = 7;
        state.period = 3;

        assert!(!retry_task(&mut state, 0));
        assert!(retry_task(&mut state, 1));
        let t = &state.tasks[1];
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!((t.downloaded_bytes, t.progress_percent, t.period), (0, 0, 3));
        assert_eq!(t.error, None);
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn pause_and_resume_need_the_right_state() {
        let mut state = state_with(vec![task("http://h/a", TaskStatus::Queued)]);
        assert!(!pause_task(&mut state, 0));
        state.tasks[0].status = TaskStatus::Downloading;
        assert!(pause_task(&mut state, 0));
        assert!(!pause_task(&mut state, 0));
        assert!(resume_task(&mut state, 0));
        assert_eq!(state.tasks[0].status, TaskStatus::Downloading);
    }

    #[test]
    fn no_observer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoObserver>();
        assert_send_sync::<TransferScheduler>();
    }
}
