//! URL validation, scheme dispatch and path helpers.
//!
//! Every crawl and every enqueued transfer first passes through a
//! [`UrlValidator`]. The rest of the engine works only on the canonical,
//! percent-encoded strings a validator returns.

use url::Url;

use crate::error::{Error, Result};

/// Turns a raw, user-supplied URL into a canonical percent-encoded one.
pub trait UrlValidator: Send + Sync {
    /// Returns the canonical form of `raw`, or a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] or [`Error::UnsupportedScheme`] when the
    /// URL cannot be used for a crawl or a transfer.
    fn validate(&self, raw: &str) -> Result<String>;
}

/// Default validator accepting `http`, `https` and `ftp` URLs.
///
/// A URL without a scheme is treated as FTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardValidator;

impl UrlValidator for StandardValidator {
    fn validate(&self, raw: &str) -> Result<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidUrl("empty URL".to_string()));
        }
        if matches!(trimmed, "http://" | "https://" | "ftp://") {
            return Err(Error::InvalidUrl(trimmed.to_string()));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ftp://{trimmed}")
        };

        let parsed =
            Url::parse(&candidate).map_err(|e| Error::InvalidUrl(format!("{trimmed}: {e}")))?;

        match parsed.scheme() {
            "http" | "https" | "ftp" => {}
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidUrl(format!("{trimmed}: missing host")));
        }

        let encoded = parsed.to_string();
        if encoded != trimmed {
            log::debug!("URL encoding: {trimmed} -> {encoded}");
        }
        Ok(encoded)
    }
}

/// Transfer protocol selected from a URL's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// Anonymous FTP (also used for URLs without a scheme).
    Ftp,
}

impl Scheme {
    /// Determines the protocol for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedScheme`] for anything but http, https, ftp
    /// or an empty scheme.
    pub fn of(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map_or("", |(scheme, _)| scheme)
            .to_ascii_lowercase();
        match scheme.as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "ftp" | "" => Ok(Self::Ftp),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    /// Returns true for HTTP and HTTPS.
    #[must_use]
    pub const fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

/// Host, port and decoded path of an FTP URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpLocation {
    /// Server host name.
    pub host: String,
    /// Control port (21 unless given).
    pub port: u16,
    /// Percent-decoded server path, always starting with `/`.
    pub path: String,
}

impl FtpLocation {
    /// Splits an `ftp://` (or scheme-less) URL into its parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the URL has no host.
    pub fn parse(url: &str) -> Result<Self> {
        let candidate = if url.contains("://") {
            url.to_string()
        } else {
            format!("ftp://{url}")
        };
        let parsed = Url::parse(&candidate).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing host")))?
            .to_string();
        let path = decode_path(parsed.path());
        Ok(Self {
            host,
            port: parsed.port().unwrap_or(21),
            path: if path.is_empty() { "/".to_string() } else { path },
        })
    }
}

/// Returns `url` with exactly one trailing slash.
#[must_use]
pub fn directory_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// Returns the last non-empty path segment of `url`, percent-decoded.
#[must_use]
pub fn file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest.split_once('/').map_or("", |(_, p)| p));
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .map(decode_path)
        .unwrap_or_default()
}

/// Percent-decodes a path for use as a local file name.
///
/// Invalid escapes are kept verbatim.
#[must_use]
pub fn decode_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            out.push((hi << 4) | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
