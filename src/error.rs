//! Error types for the convert worker.

use crate::task::CommandKind;
use reqwest::StatusCode;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Whether an operation that failed with this error is worth repeating.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("broker connection is not established")]
    NotConnected,

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to consume queue {queue}: {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to settle delivery: {0}")]
    Settle(#[source] lapin::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("callback url is required")]
    MissingCallbackUrl,

    #[error("source file is required")]
    MissingFile,

    #[error("at least one format is required")]
    NoFormats,

    #[error("format {format:?} is not supported by the {kind} command")]
    UnsupportedFormat { format: String, kind: CommandKind },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: StatusCode },

    #[error("content-type header in probe response from {url} is empty")]
    MissingContentType { url: String },

    #[error("file is too big: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Retryable for DownloadError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DownloadError::TooLarge { .. } | DownloadError::MissingContentType { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    ToolFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("expected output not created: {0}")]
    MissingOutput(PathBuf),

    #[error("format {0} cannot be produced by this command")]
    UnsupportedFormat(crate::task::Format),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Phase of the chunked upload protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Negotiate,
    Stream,
    Finalize,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadPhase::Negotiate => write!(f, "negotiate"),
            UploadPhase::Stream => write!(f, "stream"),
            UploadPhase::Finalize => write!(f, "finalize"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{phase} request to {url} failed: {source}")]
    Request {
        phase: UploadPhase,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{phase} request to {url} returned status {status}")]
    Status {
        phase: UploadPhase,
        url: String,
        status: StatusCode,
    },

    #[error("{phase} request to {url} was rejected: {message}")]
    Rejected {
        phase: UploadPhase,
        url: String,
        message: String,
    },

    #[error("invalid upload ticket from {url}: {source}")]
    InvalidTicket {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("file {path} ended before chunk {chunk} of {parts}")]
    Truncated {
        path: PathBuf,
        chunk: u64,
        parts: u64,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Retryable for UploadError {
    fn is_retryable(&self) -> bool {
        !matches!(self, UploadError::Truncated { .. })
    }
}

/// Pipeline stage in which a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Download,
    Convert,
    Upload,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validate => write!(f, "validate"),
            Stage::Download => write!(f, "download"),
            Stage::Convert => write!(f, "convert"),
            Stage::Upload => write!(f, "upload"),
            Stage::Complete => write!(f, "complete"),
        }
    }
}

/// Task-fatal error. The message carrying the task is rejected.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to validate task: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to download source: {0}")]
    Download(#[from] DownloadError),

    #[error("failed to convert to {format}: {source}")]
    Conversion {
        format: crate::task::Format,
        #[source]
        source: ConversionError,
    },

    #[error("failed to upload results: {0}")]
    Upload(#[source] UploadError),

    #[error("failed to complete upload: {0}")]
    Complete(#[source] UploadError),
}

impl TaskError {
    pub fn stage(&self) -> Stage {
        match self {
            TaskError::Validation(_) => Stage::Validate,
            TaskError::Download(_) => Stage::Download,
            TaskError::Conversion { .. } => Stage::Convert,
            TaskError::Upload(_) => Stage::Upload,
            TaskError::Complete(_) => Stage::Complete,
        }
    }
}
