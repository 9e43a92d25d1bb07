//! Conversion commands.
//!
//! A command describes how one kind of source (document, video) is validated,
//! where its files live, and how each output format is produced. The shared
//! task flow lives in [`crate::pipeline`] and takes the command as a parameter.

pub mod document;
pub mod video;

pub use document::DocumentCommand;
pub use video::VideoCommand;

use crate::error::{ConversionError, ValidationError};
use crate::task::{CommandKind, ConvertTask, Format};
use crate::temp_files::TempFiles;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Mutable per-task conversion state handed to [`Command::pre_convert`].
pub struct ConvertContext<'a> {
    /// Downloaded source file.
    pub source: &'a Path,
    /// Formats requested by the task, after validation.
    pub requested: &'a [Format],
    /// Files to deliver, one per format.
    pub outputs: &'a mut BTreeMap<Format, PathBuf>,
    /// Files produced only to derive other formats.
    pub intermediates: &'a mut BTreeMap<Format, PathBuf>,
    pub temp_files: &'a mut TempFiles,
}

#[async_trait]
pub trait Command: Send + Sync {
    fn kind(&self) -> CommandKind;

    /// Formats this command accepts.
    fn allowed_formats(&self) -> &'static [Format];

    /// Download cap in bytes.
    fn max_size(&self) -> u64;

    /// Directory receiving converted files.
    fn success_dir(&self) -> PathBuf;

    /// Directory receiving downloaded sources.
    fn download_dir(&self) -> PathBuf;

    /// Checks required fields and the format allow-list.
    ///
    /// Returns the requested formats in order, duplicates included.
    fn validate(&self, task: &ConvertTask) -> Result<Vec<Format>, ValidationError> {
        if task.back_url.trim().is_empty() {
            return Err(ValidationError::MissingCallbackUrl);
        }
        if task.file.trim().is_empty() {
            return Err(ValidationError::MissingFile);
        }
        if task.formats.is_empty() {
            return Err(ValidationError::NoFormats);
        }

        task.formats
            .iter()
            .map(|name| {
                name.parse::<Format>()
                    .ok()
                    .filter(|format| self.allowed_formats().contains(format))
                    .ok_or_else(|| ValidationError::UnsupportedFormat {
                        format: name.clone(),
                        kind: self.kind(),
                    })
            })
            .collect()
    }

    /// Produces `format` from `source` with the external tool.
    ///
    /// The expected output is registered in `temp_files` before the tool runs.
    async fn transform(
        &self,
        format: Format,
        source: &Path,
        temp_files: &mut TempFiles,
    ) -> Result<PathBuf, ConversionError>;

    /// Lets the command satisfy `format` from already produced files.
    ///
    /// Returns `true` when the format was handled and `transform` must be skipped.
    async fn pre_convert(
        &self,
        _ctx: &mut ConvertContext<'_>,
        _format: Format,
    ) -> Result<bool, ConversionError> {
        Ok(false)
    }
}

/// `path` with `suffix` appended to its final component.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) async fn create_dir(dir: &Path) -> Result<(), ConversionError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ConversionError::Io {
            path: dir.to_path_buf(),
            source,
        })
}
