//! Shared fixtures for the integration tests.

#![allow(dead_code)]

pub mod ftp;

use std::path::Path;
use std::time::Duration;

use treefetch::EngineConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves a fixed body and honours `Range: bytes=N-`.
pub struct RangeFile {
    body: Vec<u8>,
    delay: Duration,
}

impl RangeFile {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    /// Holds every response back for `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len();
        let start = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix('-'))
            .and_then(|v| v.parse::<usize>().ok());

        let template = match start {
            Some(start) if start >= len => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{len}").as_str()),
            Some(start) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{}/{len}", len - 1).as_str(),
                )
                .set_body_bytes(self.body[start..].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        template.set_delay(self.delay)
    }
}

/// Mounts HEAD (size) and GET (ranged content) handlers for `route`.
pub async fn serve_file(server: &MockServer, route: &str, body: &[u8]) {
    serve_file_with(server, route, RangeFile::new(body)).await;
}

/// Like [`serve_file`] with a custom GET responder.
pub async fn serve_file_with(server: &MockServer, route: &str, get: RangeFile) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(get.body.clone()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(get)
        .mount(server)
        .await;
}

/// An Apache-style autoindex page linking to `entries` (directories end in `/`).
pub fn index_page(title: &str, entries: &[&str]) -> String {
    let mut html = format!(
        "<html><head><title>Index of {title}</title></head><body>\n\
         <h1>Index of {title}</h1><pre>\n\
         <a href=\"?C=N;O=D\">Name</a> <a href=\"?C=M;O=A\">Last modified</a>\n\
         <hr><a href=\"../\">Parent Directory</a>\n"
    );
    for entry in entries {
        html.push_str(&format!(
            "<a href=\"{entry}\">{entry}</a>  2024-01-01 12:00  -\n"
        ));
    }
    html.push_str("</pre><hr></body></html>\n");
    html
}

/// Mounts an index page at `route`.
pub async fn serve_index(server: &MockServer, route: &str, entries: &[&str]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(index_page(route, entries)),
        )
        .mount(server)
        .await;
}

/// Fast-failing configuration with its cache under `dir`.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_cache_directory(dir.join("cache"))
        .with_request_timeout_secs(5)
        .with_retry(3, 0)
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
