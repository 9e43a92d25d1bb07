//! Size-capped download of task sources.

use crate::error::DownloadError;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode, Url};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Metadata reported by the probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Probe {
    content_length: Option<u64>,
    accepts_ranges: bool,
}

impl Probe {
    fn from_headers(headers: &HeaderMap) -> Self {
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .map_or(false, |v| v.as_bytes() == b"bytes");
        Self {
            content_length,
            accepts_ranges,
        }
    }
}

/// Downloads sources, never keeping more than the command's cap on disk.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches `url` into `dest`, rejecting anything larger than `max_size`.
    ///
    /// Returns the number of bytes written.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        max_size: u64,
    ) -> Result<u64, DownloadError> {
        let (url, probe) = self.probe(url).await?;

        let expected = expected_length(probe.content_length, max_size);
        if expected > max_size {
            return Err(DownloadError::TooLarge {
                size: expected,
                limit: max_size,
            });
        }

        let mut request = self.client.get(&url);
        // One byte past the expected length, so an oversized body shows up.
        if probe.accepts_ranges {
            request = request.header(RANGE, format!("bytes=0-{}", expected));
        }

        let mut response = request.send().await.map_err(|source| DownloadError::Request {
            url: url.clone(),
            source,
        })?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Status { url, status });
        }

        let io_err = |source: std::io::Error| DownloadError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| DownloadError::Request {
                url: url.clone(),
                source,
            })?
        {
            written += chunk.len() as u64;
            if written > max_size {
                return Err(DownloadError::TooLarge {
                    size: written,
                    limit: max_size,
                });
            }
            file.write_all(&chunk).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        let actual = tokio::fs::metadata(dest).await.map_err(io_err)?.len();
        if actual > max_size {
            return Err(DownloadError::TooLarge {
                size: actual,
                limit: max_size,
            });
        }

        info!(url = %url, bytes = actual, "Downloaded source file");
        Ok(actual)
    }

    /// Probes `url`, falling back once to its escaped form.
    async fn probe(&self, url: &str) -> Result<(String, Probe), DownloadError> {
        match self.head(url).await {
            Ok(probe) => Ok((url.to_string(), probe)),
            Err(first) => {
                let escaped = escape_url(url);
                if escaped == url {
                    return Err(first);
                }
                warn!(url = %url, error = %first, "Probe failed, retrying with escaped url");
                let probe = self.head(&escaped).await?;
                Ok((escaped, probe))
            }
        }
    }

    async fn head(&self, url: &str) -> Result<Probe, DownloadError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;

        if response.status() != StatusCode::OK {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let headers = response.headers();
        if headers
            .get(CONTENT_TYPE)
            .map_or(true, |v| v.as_bytes().is_empty())
        {
            return Err(DownloadError::MissingContentType {
                url: url.to_string(),
            });
        }

        let probe = Probe::from_headers(headers);
        debug!(url = %url, ?probe, "Probed source file");
        Ok(probe)
    }
}

/// Length to expect: the declared one, or the cap when none was declared.
fn expected_length(declared: Option<u64>, max_size: u64) -> u64 {
    match declared {
        Some(length) if length > 0 => length,
        _ => max_size,
    }
}

/// Escapes every `%` that does not start a valid percent-encoded byte.
pub fn fix_invalid_escapes(url: &str) -> String {
    let bytes = url.as_bytes();
    let mut fixed = String::with_capacity(url.len());
    for (i, c) in url.char_indices() {
        let is_hex = |at: usize| bytes.get(at).map_or(false, u8::is_ascii_hexdigit);
        if c == '%' && !(is_hex(i + 1) && is_hex(i + 2)) {
            fixed.push_str("%25");
        } else {
            fixed.push(c);
        }
    }
    fixed
}

/// Repaired and normalized form of `url`, used when the raw form is refused.
pub fn escape_url(url: &str) -> String {
    let fixed = fix_invalid_escapes(url);
    match Url::parse(&fixed) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => fixed,
    }
}
