//! Anonymous FTP session: login, directory changes, SIZE, LIST and RETR.

use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::codec::{FtpCodec, FtpReply};
use super::error::{FtpError, FtpResult};

static PASV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").expect("valid regex")
});

static EPSV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|\|\|(\d+)\|").expect("valid regex"));

/// A logged-in control connection.
pub struct FtpSession {
    codec: FtpCodec,
    peer: IpAddr,
    timeout: Duration,
}

impl FtpSession {
    /// Connects to `host:port`, logs in anonymously and switches to binary mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, the greeting or the login fails, or
    /// if any step exceeds `op_timeout`.
    pub async fn connect(host: &str, port: u16, op_timeout: Duration) -> FtpResult<Self> {
        let addr = format!("{host}:{port}");
        let tcp = timeout(op_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| FtpError::timeout(format!("connect to {addr} timed out")))?
            .map_err(|e| FtpError::connection_failed(format!("connect to {addr}: {e}")))?;
        tcp.set_nodelay(true).ok();
        let peer = tcp.peer_addr()?.ip();

        let mut session = Self {
            codec: FtpCodec::new(tcp),
            peer,
            timeout: op_timeout,
        };

        let greeting = session.read_reply().await?;
        if greeting.class() != 2 {
            return Err(FtpError::rejected(greeting.code, greeting.text()));
        }

        let user = session.command("USER anonymous").await?;
        match user.code {
            230 => {}
            331 | 332 => {
                session.expect("PASS anonymous@", 2).await?;
            }
            _ => return Err(FtpError::rejected(user.code, user.text())),
        }
        session.expect("TYPE I", 2).await?;
        log::debug!("FTP session open on {addr}");
        Ok(session)
    }

    async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let limit = self.timeout;
        timeout(limit, self.codec.read_reply())
            .await
            .map_err(|_| FtpError::timeout("waiting for FTP reply timed out"))?
    }

    async fn command(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        let limit = self.timeout;
        timeout(limit, self.codec.execute(cmd))
            .await
            .map_err(|_| FtpError::timeout(format!("'{cmd}' timed out")))?
    }

    async fn expect(&mut self, cmd: &str, class: u16) -> FtpResult<FtpReply> {
        let reply = self.command(cmd).await?;
        if reply.class() == class {
            Ok(reply)
        } else {
            Err(FtpError::rejected(reply.code, reply.text()))
        }
    }

    /// Changes the working directory.
    pub async fn cwd(&mut self, path: &str) -> FtpResult<()> {
        self.expect(&format!("CWD {path}"), 2).await.map(drop)
    }

    /// Queries the size of a remote file.
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let reply = self.expect(&format!("SIZE {path}"), 2).await?;
        reply
            .text()
            .trim()
            .parse::<u64>()
            .map_err(|_| FtpError::protocol(format!("bad SIZE reply: {}", reply.text())))
    }

    /// Lists the current working directory and returns the raw `LIST` text.
    pub async fn list(&mut self) -> FtpResult<String> {
        let mut data = self.open_data_channel().await?;
        let reply = self.command("LIST").await?;
        if reply.class() != 1 {
            return Err(FtpError::rejected(reply.code, reply.text()));
        }

        let mut raw = Vec::new();
        let limit = self.timeout;
        timeout(limit, data.read_to_end(&mut raw))
            .await
            .map_err(|_| FtpError::timeout("reading LIST data timed out"))?
            .map_err(|e| FtpError::data_channel(format!("reading LIST data: {e}")))?;
        drop(data);

        self.finish_transfer().await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Starts a download of `path`, resuming at `offset` when it is non-zero.
    ///
    /// The caller reads the returned data stream to its end and then calls
    /// [`finish_transfer`](Self::finish_transfer).
    pub async fn retrieve(&mut self, path: &str, offset: u64) -> FtpResult<TcpStream> {
        let data = self.open_data_channel().await?;
        if offset > 0 {
            self.expect(&format!("REST {offset}"), 3).await?;
        }
        let reply = self.command(&format!("RETR {path}")).await?;
        if reply.class() != 1 {
            return Err(FtpError::rejected(reply.code, reply.text()));
        }
        Ok(data)
    }

    /// Reads the completion reply that follows a data transfer.
    pub async fn finish_transfer(&mut self) -> FtpResult<()> {
        let reply = self.read_reply().await?;
        if reply.class() == 2 {
            Ok(())
        } else {
            Err(FtpError::rejected(reply.code, reply.text()))
        }
    }

    /// Says goodbye. Errors are ignored; the connection is dropped either way.
    pub async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }

    /// Opens a passive data connection, trying PASV before EPSV.
    async fn open_data_channel(&mut self) -> FtpResult<TcpStream> {
        let pasv = self.command("PASV").await?;
        let addr = if pasv.code == 227 {
            let mut addr = parse_pasv(pasv.text())?;
            if addr.ip().is_unspecified() {
                addr.set_ip(self.peer);
            }
            addr
        } else {
            let epsv = self.expect("EPSV", 2).await?;
            SocketAddr::new(self.peer, parse_epsv(epsv.text())?)
        };

        timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FtpError::data_channel(format!("data connect to {addr} timed out")))?
            .map_err(|e| FtpError::data_channel(format!("data connect to {addr}: {e}")))
    }
}

/// Parses `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
fn parse_pasv(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol(format!("cannot parse PASV reply: {text}")))?;
    let mut nums = [0u8; 6];
    for (i, n) in nums.iter_mut().enumerate() {
        *n = caps[i + 1]
            .parse()
            .map_err(|_| FtpError::protocol("PASV number out of range"))?;
    }
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Parses the port from `(|||port|)` in a 229 reply.
fn parse_epsv(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol(format!("cannot parse EPSV reply: {text}")))?;
    caps[1]
        .parse()
        .map_err(|_| FtpError::protocol("EPSV port out of range"))
}
