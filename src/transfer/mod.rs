//! HTTP transfers: capped source download and chunked result upload.

pub mod download;
pub mod upload;

pub use download::Downloader;
pub use upload::{UploadSession, UploadTicket};

use reqwest::Client;
use std::time::Duration;

/// Whole-request timeout for downloads and upload chunks.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the HTTP client shared by every worker.
pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}
