//! HTTP access to the forecast feeds.
//!
//! Two operations: fetch a file as bytes, and list the links of an HTML
//! directory index (the feeds are published as plain Apache-style listings).

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::errors::IngestError;

/// Client for the forecast open-data server.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"href=['"]([^'"]+)['"]"#).expect("static regex is valid"))
}

impl FeedClient {
    /// Build a client with a per-request timeout, so a stalled download
    /// fails its unit instead of blocking a worker forever.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|source| IngestError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Download a file completely.
    ///
    /// A body shorter than the announced `Content-Length` surfaces as a
    /// transport error from reqwest.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, IngestError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| IngestError::Transport {
                    url: url.to_string(),
                    source,
                })?;

        if !response.status().is_success() {
            return Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| IngestError::Transport {
                url: url.to_string(),
                source,
            })?;
        Ok(body.to_vec())
    }

    /// Fetch a directory index and return the absolute URLs of its entries.
    pub async fn list_links(&self, url: &str) -> Result<Vec<String>, IngestError> {
        let body = self.fetch_bytes(url).await?;
        let html = String::from_utf8_lossy(&body);
        Ok(extract_links(&html)
            .into_iter()
            .map(|link| join_url(url, &link))
            .collect())
    }
}

/// Pull `href` targets out of an index page, dropping navigation links
/// (parent directory, column sort queries, anchors).
pub fn extract_links(html: &str) -> Vec<String> {
    href_re()
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|link| {
            !link.is_empty()
                && !link.starts_with('?')
                && !link.starts_with('#')
                && !link.starts_with("..")
                && link != "/"
        })
        .collect()
}

/// Resolve an index entry against the index URL.
pub fn join_url(base: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, link.trim_start_matches('/'))
    } else {
        format!("{}/{}", base, link.trim_start_matches('/'))
    }
}

/// Last path segment of a URL.
pub fn file_name(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}
