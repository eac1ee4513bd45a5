//! Single-file transfer over HTTP(S) or FTP.
//!
//! A worker runs on its own task and owns the destination file for its whole
//! lifetime. It resumes from whatever is already on disk, writes in bounded
//! chunks, and checks its control channel before every chunk write: a paused
//! worker parks there (connection and file stay open), a cancelled one
//! returns. Partial files are never deleted.
//!
//! Workers never touch task state. They report through [`WorkerEvent`]s and
//! finish with exactly one terminal event ([`WorkerEventKind::Finished`],
//! [`WorkerEventKind::Failed`] or [`WorkerEventKind::Canceled`]).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fs::{FileSystem, TokioFileSystem};
use crate::ftp::FtpSession;
use crate::url::{FtpLocation, Scheme};

/// Identifies one worker for the lifetime of a scheduler.
pub type WorkerId = u64;

/// What the owner of a [`WorkerHandle`] wants the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Canceled,
}

/// A file to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Canonical source URL.
    pub url: String,
    /// Local destination file.
    pub destination: PathBuf,
    /// Size from the size check, 0 if unknown.
    pub expected_size: u64,
}

/// Lifecycle notices a worker sends while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// An attempt started, or the worker woke up after a pause.
    Downloading,
    /// The worker is parked before its next chunk write.
    Paused,
    /// The previous attempt failed; attempt number `attempt` follows after the
    /// retry delay.
    Retrying {
        /// 1-based number of the upcoming attempt.
        attempt: u32,
    },
}

/// Payload of a [`WorkerEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEventKind {
    /// Bytes on disk so far (resume offset included) and the total, 0 if unknown.
    Progress {
        /// Bytes present in the destination file.
        downloaded: u64,
        /// Expected file size, 0 if unknown.
        total: u64,
    },
    /// Non-terminal state change.
    Status(WorkerStatus),
    /// The file is complete.
    Finished {
        /// Bytes written by this worker across all of its attempts.
        session_bytes: u64,
        /// Bytes that were already on disk when the worker started.
        resumed_from: u64,
    },
    /// All attempts failed, or the failure was not retryable.
    Failed {
        /// Human-readable reason.
        message: String,
    },
    /// The worker stopped because it was cancelled.
    Canceled,
}

impl WorkerEventKind {
    /// Returns true for the event that ends a worker.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Failed { .. } | Self::Canceled
        )
    }
}

/// An event tagged with the worker that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    /// Sender.
    pub worker: WorkerId,
    /// What happened.
    pub kind: WorkerEventKind,
}

/// Control side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    control: watch::Sender<Control>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Worker id used in its events.
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Parks the worker before its next chunk write. No-op unless running.
    pub fn pause(&self) {
        self.control.send_if_modified(|c| {
            let change = *c == Control::Running;
            if change {
                *c = Control::Paused;
            }
            change
        });
    }

    /// Wakes a paused worker. No-op unless paused.
    pub fn resume(&self) {
        self.control.send_if_modified(|c| {
            let change = *c == Control::Paused;
            if change {
                *c = Control::Running;
            }
            change
        });
    }

    /// Stops the worker at its next chunk boundary or pending network call.
    pub fn cancel(&self) {
        self.control.send_replace(Control::Canceled);
    }

    /// Returns true once the worker task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Outcome of a successful transfer.
struct Done {
    session_bytes: u64,
    resumed_from: u64,
}

/// Executes one [`TransferJob`].
pub struct TransferWorker<F: FileSystem = TokioFileSystem> {
    id: WorkerId,
    job: TransferJob,
    http: reqwest::Client,
    fs: F,
    chunk_size: usize,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
    control: watch::Receiver<Control>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl TransferWorker<TokioFileSystem> {
    /// Starts a worker on its own task, writing through `tokio::fs`.
    #[must_use]
    pub fn spawn(
        id: WorkerId,
        job: TransferJob,
        config: &EngineConfig,
        http: reqwest::Client,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerHandle {
        Self::spawn_with_fs(id, job, config, http, events, TokioFileSystem)
    }
}

impl<F: FileSystem + 'static> TransferWorker<F> {
    /// Starts a worker on its own task with a custom file system.
    #[must_use]
    pub fn spawn_with_fs(
        id: WorkerId,
        job: TransferJob,
        config: &EngineConfig,
        http: reqwest::Client,
        events: mpsc::UnboundedSender<WorkerEvent>,
        fs: F,
    ) -> WorkerHandle {
        let (control_tx, control) = watch::channel(Control::Running);
        let worker = Self {
            id,
            job,
            http,
            fs,
            chunk_size: config.chunk_size(),
            timeout: config.request_timeout(),
            attempts: config.attempts(),
            retry_delay: config.retry_delay(),
            control,
            events,
        };
        let task = tokio::spawn(worker.run());
        WorkerHandle {
            id,
            control: control_tx,
            task,
        }
    }
}

impl<F: FileSystem> TransferWorker<F> {
    fn emit(&self, kind: WorkerEventKind) {
        let _ = self.events.send(WorkerEvent {
            worker: self.id,
            kind,
        });
    }

    fn progress(&self, downloaded: u64, total: u64) {
        self.emit(WorkerEventKind::Progress { downloaded, total });
    }

    async fn run(mut self) {
        let kind = match self.run_attempts().await {
            Ok(done) => {
                log::info!(
                    "Finished {} ({} new bytes, resumed at {})",
                    self.job.url,
                    done.session_bytes,
                    done.resumed_from
                );
                WorkerEventKind::Finished {
                    session_bytes: done.session_bytes,
                    resumed_from: done.resumed_from,
                }
            }
            Err(Error::Cancelled) => {
                log::info!("Canceled {}", self.job.url);
                WorkerEventKind::Canceled
            }
            Err(e) => {
                log::error!("Transfer of {} failed: {e}", self.job.url);
                WorkerEventKind::Failed {
                    message: e.to_string(),
                }
            }
        };
        self.emit(kind);
    }

    async fn run_attempts(&mut self) -> Result<Done> {
        let scheme = Scheme::of(&self.job.url)?;
        self.ensure_parent_dir().await?;

        let mut session_bytes = 0;
        let mut resumed_from = None;
        let mut attempt = 1;
        loop {
            self.wait_while_paused().await?;
            self.emit(WorkerEventKind::Status(WorkerStatus::Downloading));

            let offset = self.resume_offset().await?;
            let first_offset = *resumed_from.get_or_insert(offset);

            let result = if scheme.is_http() {
                self.http_attempt(offset, &mut session_bytes).await
            } else {
                self.ftp_attempt(offset, &mut session_bytes).await
            };

            match result {
                Ok(()) => {
                    return Ok(Done {
                        session_bytes,
                        resumed_from: first_offset,
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    attempt += 1;
                    log::warn!(
                        "{} failed: {e}; attempt {attempt}/{} in {:?}",
                        self.job.url,
                        self.attempts,
                        self.retry_delay
                    );
                    self.emit(WorkerEventKind::Status(WorkerStatus::Retrying { attempt }));
                    self.sleep_or_cancel(self.retry_delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self
            .job
            .destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| Error::disk(parent, e))?;
        }
        Ok(())
    }

    /// Size of the partial file, or 0 if there is none. A file larger than the
    /// expected size cannot be a prefix of the source and is discarded.
    async fn resume_offset(&self) -> Result<u64> {
        let dest = &self.job.destination;
        let existing = self
            .fs
            .file_size(dest)
            .await
            .map_err(|e| Error::disk(dest, e))?
            .unwrap_or(0);
        let expected = self.job.expected_size;
        if expected > 0 && existing > expected {
            log::warn!(
                "{} is larger than the source ({existing} > {expected}); starting over",
                dest.display()
            );
            self.fs
                .create_truncate(dest)
                .await
                .map_err(|e| Error::disk(dest, e))?;
            return Ok(0);
        }
        if existing > 0 {
            log::info!("Resuming {} at byte {existing}", self.job.url);
        }
        Ok(existing)
    }

    async fn open_destination(&self) -> Result<tokio::fs::File> {
        let dest = &self.job.destination;
        self.fs
            .open_append(dest)
            .await
            .map_err(|e| Error::disk(dest, e))
    }

    /// Blocks while paused. Returns [`Error::Cancelled`] once cancelled.
    async fn wait_while_paused(&mut self) -> Result<()> {
        let mut parked = false;
        loop {
            let state = *self.control.borrow_and_update();
            match state {
                Control::Running => {
                    if parked {
                        log::info!("Resumed {}", self.job.url);
                        self.emit(WorkerEventKind::Status(WorkerStatus::Downloading));
                    }
                    return Ok(());
                }
                Control::Canceled => return Err(Error::Cancelled),
                Control::Paused => {
                    if !parked {
                        log::info!("Paused {}", self.job.url);
                        self.emit(WorkerEventKind::Status(WorkerStatus::Paused));
                        parked = true;
                    }
                    // Nobody can resume a worker whose handle is gone.
                    if self.control.changed().await.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    /// Runs a network step bounded by the request timeout and abandoned on
    /// cancellation.
    async fn guarded<T>(&self, what: &str, fut: impl Future<Output = T>) -> Result<T> {
        let mut control = self.control.clone();
        tokio::select! {
            out = tokio::time::timeout(self.timeout, fut) => {
                out.map_err(|_| Error::Timeout(format!("{what} for {}", self.job.url)))
            }
            () = cancelled(&mut control) => Err(Error::Cancelled),
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> Result<()> {
        let mut control = self.control.clone();
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancelled(&mut control) => Err(Error::Cancelled),
        }
    }

    async fn write_chunk(
        &mut self,
        file: &mut tokio::fs::File,
        piece: &[u8],
        downloaded: &mut u64,
        session_bytes: &mut u64,
        total: u64,
    ) -> Result<()> {
        self.wait_while_paused().await?;
        file.write_all(piece)
            .await
            .map_err(|e| Error::disk(&self.job.destination, e))?;
        let n = piece.len() as u64;
        *downloaded += n;
        *session_bytes += n;
        self.progress(*downloaded, total);
        Ok(())
    }

    async fn http_attempt(&mut self, offset: u64, session_bytes: &mut u64) -> Result<()> {
        let url = self.job.url.clone();
        let known = self.job.expected_size;
        if known > 0 && offset == known {
            self.progress(offset, known);
            return Ok(());
        }

        let mut request = self.http.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = self.guarded("request", request.send()).await??;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let total = content_range_total(response.headers())
                .or((known > 0).then_some(known));
            if total == Some(offset) {
                self.progress(offset, offset);
                return Ok(());
            }
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let total = if known > 0 {
            known
        } else {
            content_range_total(response.headers())
                .or_else(|| {
                    response
                        .content_length()
                        .map(|len| if partial { len + offset } else { len })
                })
                .unwrap_or(0)
        };
        // A server that ignored the range resends the prefix we already have.
        let mut skip = if partial { 0 } else { offset };
        if skip > 0 {
            log::info!("{url} does not support ranges; skipping {skip} bytes");
        }

        let mut file = self.open_destination().await?;
        let mut downloaded = offset;
        self.progress(downloaded, total);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = self.guarded("reading body", stream.next()).await? {
            let chunk = chunk?;
            let mut data = &chunk[..];
            if skip > 0 {
                let n = usize::try_from(skip).unwrap_or(usize::MAX).min(data.len());
                data = &data[n..];
                skip -= n as u64;
            }
            for piece in data.chunks(self.chunk_size) {
                self.write_chunk(&mut file, piece, &mut downloaded, session_bytes, total)
                    .await?;
            }
        }
        file.flush()
            .await
            .map_err(|e| Error::disk(&self.job.destination, e))?;

        ensure_complete(downloaded, total)
    }

    async fn ftp_attempt(&mut self, offset: u64, session_bytes: &mut u64) -> Result<()> {
        let loc = FtpLocation::parse(&self.job.url)?;
        let mut session = self
            .guarded("connect", FtpSession::connect(&loc.host, loc.port, self.timeout))
            .await??;

        let total = if self.job.expected_size > 0 {
            self.job.expected_size
        } else {
            match session.size(&loc.path).await {
                Ok(size) => size,
                Err(e) => {
                    log::debug!("SIZE unavailable for {}: {e}", self.job.url);
                    0
                }
            }
        };
        if total > 0 && offset == total {
            session.quit().await;
            self.progress(offset, total);
            return Ok(());
        }

        let mut data = self
            .guarded("RETR", session.retrieve(&loc.path, offset))
            .await??;
        let mut file = self.open_destination().await?;
        let mut downloaded = offset;
        self.progress(downloaded, total);

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = self.guarded("reading data", data.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            self.write_chunk(&mut file, &buf[..n], &mut downloaded, session_bytes, total)
                .await?;
        }
        drop(data);
        file.flush()
            .await
            .map_err(|e| Error::disk(&self.job.destination, e))?;

        self.guarded("transfer completion", session.finish_transfer())
            .await??;
        session.quit().await;

        ensure_complete(downloaded, total)
    }
}

/// Resolves once the control channel says `Canceled`. Never resolves if the
/// handle was dropped without cancelling.
async fn cancelled(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() == Control::Canceled {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Total size from `Content-Range: bytes a-b/total` or `bytes */total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}

fn ensure_complete(downloaded: u64, total: u64) -> Result<()> {
    if total > 0 && downloaded < total {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection closed after {downloaded} of {total} bytes"),
        )));
    }
    Ok(())
}

/// Destination file for `relative_path` under `root`.
///
/// Empty, `.` and `..` segments are dropped, so the result always stays
/// below `root`.
#[must_use]
pub fn destination_path(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .fold(root.to_path_buf(), |path, seg| path.join(seg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_total(&headers), None);
        headers.insert(CONTENT_RANGE, "bytes 100-199/200".parse().unwrap());
        assert_eq!(content_range_total(&headers), Some(200));
        headers.insert(CONTENT_RANGE, "bytes */1234".parse().unwrap());
        assert_eq!(content_range_total(&headers), Some(1234));
        headers.insert(CONTENT_RANGE, "bytes 0-1/*".parse().unwrap());
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn short_transfers_are_errors() {
        assert!(ensure_complete(10, 10).is_ok());
        assert!(ensure_complete(5, 0).is_ok());
        let err = ensure_complete(5, 10).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn destination_stays_below_root() {
        let root = Path::new("/data/dl");
        assert_eq!(
            destination_path(root, "pub/My Dir/a.iso"),
            PathBuf::from("/data/dl/pub/My Dir/a.iso")
        );
        assert_eq!(
            destination_path(root, "../../etc/passwd"),
            PathBuf::from("/data/dl/etc/passwd")
        );
        assert_eq!(destination_path(root, "/x//y/"), PathBuf::from("/data/dl/x/y"));
    }

    #[test]
    fn terminal_events() {
        assert!(WorkerEventKind::Canceled.is_terminal());
        assert!(
            WorkerEventKind::Finished {
                session_bytes: 0,
                resumed_from: 0
            }
            .is_terminal()
        );
        assert!(!WorkerEventKind::Status(WorkerStatus::Paused).is_terminal());
    }

    #[tokio::test]
    async fn handle_controls_are_idempotent() {
        let (control, mut rx) = watch::channel(Control::Running);
        let handle = WorkerHandle {
            id: 7,
            control,
            task: tokio::spawn(async {}),
        };
        handle.resume();
        assert!(!rx.has_changed().unwrap());
        handle.pause();
        handle.pause();
        assert_eq!(*rx.borrow_and_update(), Control::Paused);
        handle.resume();
        assert_eq!(*rx.borrow_and_update(), Control::Running);
        handle.cancel();
        handle.pause();
        assert_eq!(*rx.borrow(), Control::Canceled);
        assert_eq!(handle.id(), 7);
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_without_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::default().with_retry(3, 0);
        let job = TransferJob {
            url: "gopher://example.com/file".to_string(),
            destination: dir.path().join("file"),
            expected_size: 0,
        };
        let _handle = TransferWorker::spawn(1, job, &config, reqwest::Client::new(), tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.worker, 1);
        assert!(
            matches!(event.kind, WorkerEventKind::Failed { ref message } if message.contains("gopher"))
        );
        assert!(rx.recv().await.is_none());
    }
}
