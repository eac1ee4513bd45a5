//! `LIST` output parser.
//!
//! Understands Unix `ls -l` lines and Windows/IIS lines:
//!
//! ```text
//! drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
//! -rw-r--r--   1 user group  1234 Jan  1  2025 file name.txt
//! 01-01-26  12:00PM       <DIR> Directory Name
//! 01-01-26  12:00AM        1234 file.txt
//! ```
//!
//! Sizes and dates are kept as the raw text the server sent.

use std::sync::LazyLock;

use regex::Regex;

use crate::listing::ItemKind;

static UNIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^([dlcbps-])[rwxsStT-]{9}[+@.]?\s+  # type flag + permissions
        \d+\s+                               # link count
        \S+\s+                               # owner
        (?:\S+\s+)?                          # group (absent on some servers)
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s         # date
        (.+)$                                # name
        ",
    )
    .expect("valid regex")
});

static WINDOWS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4}\s+\d{1,2}:\d{2}(?:AM|PM)?)\s+  # date + time
        (<DIR>|\d+)\s+                                      # size or <DIR>
        (.+)$                                               # name
        ",
    )
    .expect("valid regex")
});

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    /// Entry name (for symlinks, without the ` -> target` suffix).
    pub name: String,
    /// File or directory.
    pub kind: ItemKind,
    /// Size column as sent by the server.
    pub size_raw: String,
    /// Modification date as sent by the server.
    pub modified: String,
}

/// Parses a complete `LIST` response body, skipping `.`, `..` and lines that
/// match neither format.
#[must_use]
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .filter_map(parse_line)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

fn parse_line(line: &str) -> Option<FtpEntry> {
    parse_unix(line).or_else(|| parse_windows(line))
}

fn parse_unix(line: &str) -> Option<FtpEntry> {
    let caps = UNIX_RE.captures(line)?;
    let kind = if &caps[1] == "d" {
        ItemKind::Directory
    } else {
        ItemKind::File
    };
    let raw_name = &caps[4];
    let name = if &caps[1] == "l" {
        raw_name.split(" -> ").next().unwrap_or(raw_name)
    } else {
        raw_name
    };
    Some(FtpEntry {
        name: name.to_string(),
        kind,
        size_raw: caps[2].to_string(),
        modified: caps[3].split_whitespace().collect::<Vec<_>>().join(" "),
    })
}

fn parse_windows(line: &str) -> Option<FtpEntry> {
    let caps = WINDOWS_RE.captures(line)?;
    let (kind, size_raw) = if &caps[2] == "<DIR>" {
        (ItemKind::Directory, "-".to_string())
    } else {
        (ItemKind::File, caps[2].to_string())
    };
    Some(FtpEntry {
        name: caps[3].to_string(),
        kind,
        size_raw,
        modified: caps[1].split_whitespace().collect::<Vec<_>>().join(" "),
    })
}
