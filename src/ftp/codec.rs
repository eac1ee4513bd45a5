//! FTP control-channel codec: commands out, (multi-line) replies in.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::error::{FtpError, FtpResult};

/// A complete server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    /// Three-digit reply code.
    pub code: u16,
    /// Every line of the reply, CRLF stripped.
    pub lines: Vec<String>,
}

impl FtpReply {
    /// Text of the final line without its code.
    #[must_use]
    pub fn text(&self) -> &str {
        self.lines
            .last()
            .map_or("", |l| l.get(4..).unwrap_or_default())
    }

    /// Reply class: 1 preliminary, 2 completion, 3 intermediate, 4/5 failure.
    #[must_use]
    pub const fn class(&self) -> u16 {
        self.code / 100
    }
}

/// Command/reply codec over the split halves of the control connection.
pub struct FtpCodec {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FtpCodec {
    /// Wraps a connected control socket.
    pub fn new(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer: wr,
        }
    }

    /// Sends one command; CRLF is appended.
    pub async fn send(&mut self, cmd: &str) -> FtpResult<()> {
        self.writer.write_all(format!("{cmd}\r\n").as_bytes()).await?;
        log::trace!(">>> {cmd}");
        Ok(())
    }

    async fn read_line(&mut self) -> FtpResult<String> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf).await? == 0 {
            return Err(FtpError::disconnected("server closed the control connection"));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads one reply. `NNN-` opens a multi-line reply that ends at `NNN `.
    pub async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first];

        if lines[0].as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let next = self.read_line().await?;
                let done = next.starts_with(&terminator) || next == code.to_string();
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let reply = FtpReply { code, lines };
        log::trace!("<<< {} {}", reply.code, reply.text());
        Ok(reply)
    }

    /// Sends a command and reads its reply.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.send(cmd).await?;
        self.read_reply().await
    }
}

fn parse_code(line: &str) -> FtpResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| FtpError::protocol(format!("invalid reply line: '{line}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn codec_with_server_output(output: &'static [u8]) -> FtpCodec {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(output).await.unwrap();
        });
        FtpCodec::new(TcpStream::connect(addr).await.unwrap())
    }

    #[tokio::test]
    async fn reads_single_line_reply() {
        let mut codec = codec_with_server_output(b"220 ready\r\n").await;
        let reply = codec.read_reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text(), "ready");
        assert_eq!(reply.class(), 2);
    }

    #[tokio::test]
    async fn reads_multi_line_reply() {
        let mut codec =
            codec_with_server_output(b"220-Welcome\r\n220-second line\r\n220 done\r\n331 next\r\n")
                .await;
        let reply = codec.read_reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.text(), "done");
        assert_eq!(codec.read_reply().await.unwrap().code, 331);
    }

    #[tokio::test]
    async fn rejects_garbage_and_eof() {
        let mut codec = codec_with_server_output(b"hello\r\n").await;
        assert!(codec.read_reply().await.is_err());
        let err = codec.read_reply().await.unwrap_err();
        assert_eq!(err.kind, super::super::FtpErrorKind::Disconnected);
    }
}
