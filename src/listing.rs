//! Entries discovered while crawling a remote directory tree.

use serde::{Deserialize, Serialize};

/// Whether a listing entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// A regular file (symlinks are reported as files).
    File,
    /// A directory the crawler may descend into.
    Directory,
}

/// One file or directory found during a crawl.
///
/// The serde field names follow the on-disk cache format
/// (`{name, size, type, modified, path, full_url}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingItem {
    /// Entry name as the server presented it.
    pub name: String,
    /// Size column as sent by the server (`-` when unknown).
    #[serde(rename = "size")]
    pub size_raw: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Modification date as sent by the server.
    pub modified: String,
    /// Path relative to the crawl root, `/`-separated, without a leading slash.
    pub path: String,
    /// Absolute URL of the entry (HTTP listings only).
    #[serde(rename = "full_url", default, skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
}

impl ListingItem {
    /// Returns true for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    /// Absolute URL of this entry below `root`.
    ///
    /// Uses the resolved URL when the crawler recorded one, otherwise joins the
    /// relative path onto the crawl root.
    #[must_use]
    pub fn url_under(&self, root: &str) -> String {
        self.resolved_url.clone().unwrap_or_else(|| {
            let encoded: Vec<String> = self
                .path
                .split('/')
                .map(|seg| url::form_urlencoded::byte_serialize(seg.as_bytes()).collect::<String>())
                .map(|seg| seg.replace('+', "%20"))
                .collect();
            format!("{}{}", crate::url::directory_url(root), encoded.join("/"))
        })
    }
}
