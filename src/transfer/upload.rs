//! Chunked upload of converted files to the caller's callback endpoint.
//!
//! Every file goes through negotiate and stream; the whole result set is then
//! committed by a single finalize request.

use crate::error::{UploadError, UploadPhase};
use crate::retry::RetryPolicy;
use crate::task::Format;
use crate::temp_files::TempFiles;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const FINALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Negotiate response: where and how to stream one file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadTicket {
    #[serde(default, alias = "Bucket")]
    pub bucket: i64,
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default)]
    pub chunk_size: i64,
}

impl UploadTicket {
    /// Negotiated chunk size; non-positive values fall back to one byte.
    pub fn effective_chunk_size(&self) -> u64 {
        if self.chunk_size > 0 {
            self.chunk_size as u64
        } else {
            1
        }
    }
}

/// Number of chunk requests for a file of `size` bytes, at least one.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size.max(1)).max(1)
}

/// Per-task upload state bound to one callback URL.
///
/// Owns the task's temporary files until `delete_files` runs.
#[derive(Debug)]
pub struct UploadSession {
    client: Client,
    url: String,
    retry: RetryPolicy,
    files: BTreeMap<Format, PathBuf>,
    uploaded: BTreeMap<Format, String>,
    temp_files: TempFiles,
}

impl UploadSession {
    pub fn new(client: Client, url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            url: url.into(),
            retry,
            files: BTreeMap::new(),
            uploaded: BTreeMap::new(),
            temp_files: TempFiles::new(),
        }
    }

    pub fn temp_files_mut(&mut self) -> &mut TempFiles {
        &mut self.temp_files
    }

    pub fn set_files(&mut self, files: BTreeMap<Format, PathBuf>) {
        self.files = files;
    }

    /// Remote names assigned so far, by format.
    pub fn uploaded(&self) -> &BTreeMap<Format, String> {
        &self.uploaded
    }

    /// Negotiates and streams every file. Stops at the first failure.
    pub async fn upload_files(&mut self) -> Result<(), UploadError> {
        let files: Vec<(Format, PathBuf)> = self
            .files
            .iter()
            .map(|(format, path)| (*format, path.clone()))
            .collect();

        for (format, path) in files {
            let size = file_size(&path).await?;
            let ticket = self.negotiate(format, size).await?;
            self.uploaded.insert(format, ticket.name.clone());
            self.stream(&path, size, &ticket).await?;

            info!(
                format = %format,
                name = %ticket.name,
                bytes = size,
                "Uploaded result file"
            );
        }
        Ok(())
    }

    /// Commits the uploaded result set.
    pub async fn complete(&self) -> Result<(), UploadError> {
        let mut form = vec![("finish".to_string(), "y".to_string())];
        form.extend(
            self.uploaded
                .iter()
                .map(|(format, name)| (format!("result[files][{}]", format), name.clone())),
        );
        let form = &form;

        self.retry
            .run("upload finalize", move || async move {
                let response = self
                    .client
                    .post(&self.url)
                    .timeout(FINALIZE_TIMEOUT)
                    .form(form)
                    .send()
                    .await
                    .map_err(|source| self.request_error(UploadPhase::Finalize, source))?;
                self.check_response(UploadPhase::Finalize, response).await?;
                Ok::<(), UploadError>(())
            })
            .await?;

        info!(url = %self.url, files = self.uploaded.len(), "Upload completed");
        Ok(())
    }

    /// Removes every registered temporary file. Safe to call repeatedly.
    pub async fn delete_files(&self) {
        self.temp_files.delete_all().await;
    }

    async fn negotiate(&self, format: Format, size: u64) -> Result<UploadTicket, UploadError> {
        let form = [
            ("file_id", format.as_str().to_string()),
            ("file_size", size.to_string()),
            ("upload", "where".to_string()),
        ];
        let form = &form;

        let ticket = self
            .retry
            .run("upload negotiate", move || async move {
                let response = self
                    .client
                    .post(&self.url)
                    .form(form)
                    .send()
                    .await
                    .map_err(|source| self.request_error(UploadPhase::Negotiate, source))?;
                let body = self.check_response(UploadPhase::Negotiate, response).await?;
                serde_json::from_slice::<UploadTicket>(&body).map_err(|source| {
                    UploadError::InvalidTicket {
                        url: self.url.clone(),
                        source,
                    }
                })
            })
            .await?;

        debug!(format = %format, ticket = ?ticket, "Negotiated upload");
        Ok(ticket)
    }

    async fn stream(&self, path: &Path, size: u64, ticket: &UploadTicket) -> Result<(), UploadError> {
        let chunk_size = ticket.effective_chunk_size();
        let parts = chunk_count(size, chunk_size);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|source| io_error(path, source))?;

        for chunk in 1..=parts {
            let mut buffer = Vec::new();
            (&mut file)
                .take(chunk_size)
                .read_to_end(&mut buffer)
                .await
                .map_err(|source| io_error(path, source))?;
            if buffer.is_empty() && size > 0 {
                return Err(UploadError::Truncated {
                    path: path.to_path_buf(),
                    chunk,
                    parts,
                });
            }

            let last = chunk == parts;
            let buffer = &buffer;
            let file_name = &file_name;

            self.retry
                .run("upload chunk", move || async move {
                    let form = chunk_form(buffer.clone(), file_name, ticket, last, size);
                    let response = self
                        .client
                        .post(&self.url)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(|source| self.request_error(UploadPhase::Stream, source))?;
                    self.check_response(UploadPhase::Stream, response).await?;
                    Ok::<(), UploadError>(())
                })
                .await?;

            debug!(name = %ticket.name, chunk, parts, "Uploaded chunk");
        }
        Ok(())
    }

    fn request_error(&self, phase: UploadPhase, source: reqwest::Error) -> UploadError {
        UploadError::Request {
            phase,
            url: self.url.clone(),
            source,
        }
    }

    /// Requires status 200 and no `error` member in a JSON body.
    async fn check_response(
        &self,
        phase: UploadPhase,
        response: Response,
    ) -> Result<Vec<u8>, UploadError> {
        let status = response.status();
        if status != StatusCode::OK {
            return Err(UploadError::Status {
                phase,
                url: self.url.clone(),
                status,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| self.request_error(phase, source))?;
        if let Some(message) = reply_error(&body) {
            return Err(UploadError::Rejected {
                phase,
                url: self.url.clone(),
                message,
            });
        }
        Ok(body.to_vec())
    }
}

fn chunk_form(bytes: Vec<u8>, file_name: &str, ticket: &UploadTicket, last: bool, size: u64) -> Form {
    let mut form = Form::new()
        .part("file", Part::bytes(bytes).file_name(file_name.to_string()))
        .text("file_name", ticket.name.clone())
        .text("last_part", if last { "y" } else { "n" })
        .text("file_size", size.to_string());
    if ticket.bucket > 0 {
        form = form.text("bucket", ticket.bucket.to_string());
    }
    form
}

/// Error reported in a response body, if any.
///
/// Bodies that are not JSON objects carry no error.
fn reply_error(body: &[u8]) -> Option<String> {
    let reply: Value = match serde_json::from_slice(body) {
        Ok(reply) => reply,
        Err(_) => {
            debug!(bytes = body.len(), "Upload response body is not JSON");
            return None;
        }
    };
    match reply.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) if message.is_empty() => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

async fn file_size(path: &Path) -> Result<u64, UploadError> {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> UploadError {
    UploadError::Io {
        path: path.to_path_buf(),
        source,
    }
}
