//! A scripted, in-process FTP server for integration tests.
//!
//! It understands just the commands the engine sends: USER, PASS, TYPE, CWD,
//! SIZE, PASV, LIST, REST, RETR and QUIT. Every command is recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Virtual file tree served by [`FtpServer`].
#[derive(Debug, Clone, Default)]
pub struct FtpTree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl FtpTree {
    pub fn new() -> Self {
        let mut tree = Self::default();
        tree.dirs.insert("/".to_string());
        tree
    }

    /// Adds a directory and its parents.
    pub fn dir(mut self, path: &str) -> Self {
        self.add_dirs(path);
        self
    }

    /// Adds a file and its parent directories.
    pub fn file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.add_dirs(parent);
        }
        self.files.insert(path.to_string(), content.into());
        self
    }

    fn add_dirs(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.dirs.insert(current.clone());
        }
    }

    fn listing(&self, dir: &str) -> String {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir.trim_end_matches('/'))
        };
        let child = |path: &str| {
            path.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };

        let mut out = String::from("total 0\r\n");
        for name in self.dirs.iter().filter_map(|d| child(d)) {
            out.push_str(&format!(
                "drwxr-xr-x    2 ftp      ftp          4096 Jan 01 12:00 {name}\r\n"
            ));
        }
        for (path, content) in &self.files {
            if let Some(name) = child(path) {
                out.push_str(&format!(
                    "-rw-r--r--    1 ftp      ftp      {:>8} Jan 01 12:00 {name}\r\n",
                    content.len()
                ));
            }
        }
        out
    }
}

struct ServerState {
    tree: FtpTree,
    commands: Mutex<Vec<String>>,
    /// The first RETR sends only this many bytes and then aborts.
    cut_first_retr_at: Option<usize>,
    retrievals: AtomicUsize,
}

/// Handle to a running scripted server. Aborted on drop.
pub struct FtpServer {
    port: u16,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl FtpServer {
    pub async fn start(tree: FtpTree) -> Self {
        Self::start_with(tree, None).await
    }

    /// Starts a server whose first RETR is cut after `bytes` bytes.
    pub async fn start_flaky(tree: FtpTree, bytes: usize) -> Self {
        Self::start_with(tree, Some(bytes)).await
    }

    async fn start_with(tree: FtpTree, cut_first_retr_at: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            tree,
            commands: Mutex::new(Vec::new()),
            cut_first_retr_at,
            retrievals: AtomicUsize::new(0),
        });
        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });
        Self { port, state, task }
    }

    /// `ftp://127.0.0.1:<port><path>`
    pub fn url(&self, path: &str) -> String {
        format!("ftp://127.0.0.1:{}{path}", self.port)
    }

    /// Every command received so far, across all sessions.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Commands starting with `verb`.
    pub fn commands_named(&self, verb: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .collect()
    }
}

impl Drop for FtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut cwd = "/".to_string();
    let mut passive: Option<TcpListener> = None;
    let mut rest = 0usize;

    if wr.write_all(b"220 scripted server ready\r\n").await.is_err() {
        return;
    }

    while let Ok(Some(line)) = lines.next_line().await {
        state.commands.lock().unwrap().push(line.clone());
        let (verb, arg) = line
            .split_once(' ')
            .map_or((line.as_str(), ""), |(v, a)| (v, a));
        let absolute = |arg: &str| -> String {
            if arg.starts_with('/') {
                arg.to_string()
            } else if cwd == "/" {
                format!("/{arg}")
            } else {
                format!("{cwd}/{arg}")
            }
        };

        let reply = match verb.to_ascii_uppercase().as_str() {
            "USER" => "331 send password".to_string(),
            "PASS" => "230 logged in".to_string(),
            "TYPE" => "200 type set".to_string(),
            "CWD" => {
                let target = absolute(arg);
                let normalized = if target.len() > 1 {
                    target.trim_end_matches('/').to_string()
                } else {
                    target
                };
                if state.tree.dirs.contains(&normalized) {
                    cwd = normalized;
                    "250 directory changed".to_string()
                } else {
                    "550 no such directory".to_string()
                }
            }
            "SIZE" => match state.tree.files.get(&absolute(arg)) {
                Some(content) => format!("213 {}", content.len()),
                None => "550 no such file".to_string(),
            },
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                passive = Some(listener);
                format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                )
            }
            "REST" => {
                rest = arg.trim().parse().unwrap_or(0);
                format!("350 restarting at {rest}")
            }
            "LIST" => {
                let Some(listener) = passive.take() else {
                    let _ = wr.write_all(b"425 use PASV first\r\n").await;
                    continue;
                };
                let _ = wr.write_all(b"150 here comes the listing\r\n").await;
                if let Ok((mut data, _)) = listener.accept().await {
                    let _ = data.write_all(state.tree.listing(&cwd).as_bytes()).await;
                    let _ = data.shutdown().await;
                }
                "226 listing sent".to_string()
            }
            "RETR" => {
                let offset = std::mem::take(&mut rest);
                let Some(content) = state.tree.files.get(&absolute(arg)) else {
                    passive = None;
                    let _ = wr.write_all(b"550 no such file\r\n").await;
                    continue;
                };
                let Some(listener) = passive.take() else {
                    let _ = wr.write_all(b"425 use PASV first\r\n").await;
                    continue;
                };
                let first = state.retrievals.fetch_add(1, Ordering::SeqCst) == 0;
                let body = &content[offset.min(content.len())..];
                let (body, aborted) = match state.cut_first_retr_at {
                    Some(cut) if first && cut < body.len() => (&body[..cut], true),
                    _ => (body, false),
                };
                let _ = wr.write_all(b"150 opening data connection\r\n").await;
                if let Ok((mut data, _)) = listener.accept().await {
                    let _ = data.write_all(body).await;
                    let _ = data.shutdown().await;
                }
                if aborted {
                    "426 connection closed; transfer aborted".to_string()
                } else {
                    "226 transfer complete".to_string()
                }
            }
            "QUIT" => {
                let _ = wr.write_all(b"221 bye\r\n").await;
                return;
            }
            _ => "502 not implemented".to_string(),
        };

        if wr.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
            return;
        }
    }
}
