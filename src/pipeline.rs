//! Per-task execution: validate, download, convert, upload, complete.
//!
//! Any failure ends the task at that stage. Temporary files are deleted
//! whatever the outcome.

use crate::command::{Command, ConvertContext};
use crate::error::{DownloadError, TaskError};
use crate::retry::RetryPolicy;
use crate::task::{ConvertTask, Format};
use crate::temp_files::TempFiles;
use crate::transfer::{Downloader, UploadSession};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub struct Pipeline<'a> {
    command: &'a dyn Command,
    downloader: &'a Downloader,
    retry: RetryPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(command: &'a dyn Command, downloader: &'a Downloader, retry: RetryPolicy) -> Self {
        Self {
            command,
            downloader,
            retry,
        }
    }

    /// Runs `task` to completion, uploading through `session`.
    pub async fn execute(
        &self,
        task: &ConvertTask,
        session: &mut UploadSession,
    ) -> Result<(), TaskError> {
        let result = self.run(task, session).await;
        session.delete_files().await;
        result
    }

    async fn run(&self, task: &ConvertTask, session: &mut UploadSession) -> Result<(), TaskError> {
        let formats = self.command.validate(task)?;

        let source = self.download(task, session.temp_files_mut()).await?;
        let outputs = self
            .convert(&source, &formats, session.temp_files_mut())
            .await?;

        session.set_files(outputs);
        session.upload_files().await.map_err(TaskError::Upload)?;
        session.complete().await.map_err(TaskError::Complete)?;
        Ok(())
    }

    async fn download(
        &self,
        task: &ConvertTask,
        temp_files: &mut TempFiles,
    ) -> Result<PathBuf, DownloadError> {
        let directory = self.command.download_dir();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|source| DownloadError::Io {
                path: directory.clone(),
                source,
            })?;

        let path = directory.join(format!("original{}-{}", task.file_id, Uuid::new_v4()));
        temp_files.register(&path);

        let max_size = self.command.max_size();
        let (url, dest) = (task.file.as_str(), path.as_path());
        let downloader = self.downloader;
        self.retry
            .run("download", move || downloader.download(url, dest, max_size))
            .await?;

        Ok(path)
    }

    /// Produces every requested format once, in request order.
    async fn convert(
        &self,
        source: &Path,
        formats: &[Format],
        temp_files: &mut TempFiles,
    ) -> Result<BTreeMap<Format, PathBuf>, TaskError> {
        let mut outputs = BTreeMap::new();
        let mut intermediates = BTreeMap::new();

        for &format in formats {
            if outputs.contains_key(&format) {
                debug!(format = %format, "Format already produced");
                continue;
            }

            let mut ctx = ConvertContext {
                source,
                requested: formats,
                outputs: &mut outputs,
                intermediates: &mut intermediates,
                temp_files: &mut *temp_files,
            };
            let handled = self
                .command
                .pre_convert(&mut ctx, format)
                .await
                .map_err(|source| TaskError::Conversion { format, source })?;
            if handled {
                continue;
            }

            let output = self
                .command
                .transform(format, source, temp_files)
                .await
                .map_err(|source| TaskError::Conversion { format, source })?;
            outputs.insert(format, output);
        }

        info!(
            formats = ?outputs.keys().map(Format::as_str).collect::<Vec<_>>(),
            "Conversion finished"
        );
        Ok(outputs)
    }
}
