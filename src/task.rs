//! Task model for queued conversion requests.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A conversion request as published to a work queue.
///
/// Field names follow the submission endpoint's wire format. A task is
/// immutable once dequeued and lives only for one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConvertTask {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file_id: i64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub formats: Vec<String>,
    #[serde(default)]
    pub back_url: String,
    pub command: CommandKind,
    #[serde(default)]
    pub queue: String,
    #[serde(default, rename = "RequestID")]
    pub request_id: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<String>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ConvertTask {
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// Which conversion command handles the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "Bitrix\\TransformerController\\Document", alias = "document")]
    Document,
    #[serde(rename = "Bitrix\\TransformerController\\Video", alias = "video")]
    Video,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Document => write!(f, "document"),
            CommandKind::Video => write!(f, "video"),
        }
    }
}

/// Output formats understood by at least one command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Format {
    Pdf,
    Jpg,
    Txt,
    Text,
    Md5,
    Sha1,
    Crc32,
    PngAllPages,
    Mp4,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Jpg => "jpg",
            Format::Txt => "txt",
            Format::Text => "text",
            Format::Md5 => "md5",
            Format::Sha1 => "sha1",
            Format::Crc32 => "crc32",
            Format::PngAllPages => "pngAllPages",
            Format::Mp4 => "mp4",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFormat(pub String);

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pdf" => Format::Pdf,
            "jpg" => Format::Jpg,
            "txt" => Format::Txt,
            "text" => Format::Text,
            "md5" => Format::Md5,
            "sha1" => Format::Sha1,
            "crc32" => Format::Crc32,
            "pngAllPages" => Format::PngAllPages,
            "mp4" => Format::Mp4,
            other => return Err(UnknownFormat(other.to_string())),
        })
    }
}
