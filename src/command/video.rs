//! Video conversion through the transcoder.

use super::{create_dir, with_suffix, Command};
use crate::config::ConvertConfig;
use crate::error::ConversionError;
use crate::task::{CommandKind, Format};
use crate::temp_files::TempFiles;
use crate::tools::{ensure_output, ToolInvocation, ToolRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const VIDEO_DIR: &str = "video";

const ALLOWED: &[Format] = &[Format::Mp4, Format::Jpg];

/// Caps width at 1280 for 16:9 and keeps both dimensions even.
const SCALE_FILTER: &str = "scale=w='min(min(1280\\,trunc(1280/max(a/1.7778\\,1.7778/a)/2)*2)\\,trunc(iw/2)*2):h=-2'";

pub struct VideoCommand {
    config: Arc<ConvertConfig>,
    tools: Arc<dyn ToolRunner>,
}

impl VideoCommand {
    pub fn new(config: Arc<ConvertConfig>, tools: Arc<dyn ToolRunner>) -> Self {
        Self { config, tools }
    }

    fn arguments(format: Format, source: &Path, output: &Path) -> Option<Vec<String>> {
        let input = source.display().to_string();
        let output = output.display().to_string();
        let args: Vec<&str> = match format {
            Format::Mp4 => vec![
                "-loglevel", "warning",
                "-i", input.as_str(),
                "-c:v", "libx264",
                "-r", "25",
                "-vf", SCALE_FILTER,
                "-strict", "-2",
                "-preset", "fast",
                "-pix_fmt", "yuv420p",
                "-codec:a", "aac",
                "-f", "mp4",
                output.as_str(),
            ],
            Format::Jpg => vec![
                "-loglevel", "warning",
                "-i", input.as_str(),
                "-an",
                "-ss", "00:00:00",
                "-vf", SCALE_FILTER,
                "-vframes", "1",
                "-r", "1",
                "-y",
                output.as_str(),
            ],
            _ => return None,
        };
        Some(args.into_iter().map(String::from).collect())
    }
}

#[async_trait]
impl Command for VideoCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::Video
    }

    fn allowed_formats(&self) -> &'static [Format] {
        ALLOWED
    }

    fn max_size(&self) -> u64 {
        self.config.max_video_size
    }

    fn success_dir(&self) -> PathBuf {
        self.config.success_dir.join(VIDEO_DIR)
    }

    fn download_dir(&self) -> PathBuf {
        self.config.download_dir.join(VIDEO_DIR)
    }

    async fn transform(
        &self,
        format: Format,
        source: &Path,
        temp_files: &mut TempFiles,
    ) -> Result<PathBuf, ConversionError> {
        let directory = self.success_dir();
        create_dir(&directory).await?;

        let name = source.file_name().map(PathBuf::from).unwrap_or_default();
        let output = with_suffix(&directory.join(name), &format!(".{}", format));
        let args = Self::arguments(format, source, &output)
            .ok_or(ConversionError::UnsupportedFormat(format))?;
        temp_files.register(&output);

        self.tools
            .run(&ToolInvocation::new(&self.config.ffmpeg_bin, args))
            .await?;
        ensure_output(&output).await?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::test_config;
    use crate::tools::MockToolRunner;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_mp4_output_named_after_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("original77");
        std::fs::write(&source, b"video").unwrap();
        let expected = dir.path().join("success").join("video").join("original77.mp4");

        let mut mock = MockToolRunner::new();
        let written = expected.clone();
        mock.expect_run()
            .withf(|inv| inv.program == "ffmpeg" && inv.args.contains(&"libx264".to_string()))
            .times(1)
            .returning(move |_| {
                std::fs::write(&written, b"mp4").unwrap();
                Ok(())
            });

        let command = VideoCommand::new(test_config(dir.path()), Arc::new(mock));
        let mut temp_files = TempFiles::new();
        let output = command
            .transform(Format::Mp4, &source, &mut temp_files)
            .await
            .unwrap();

        assert_eq!(output, expected);
        assert!(temp_files.contains(&expected));
    }

    #[tokio::test]
    async fn test_jpg_takes_single_frame() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip");
        std::fs::write(&source, b"video").unwrap();

        let mut mock = MockToolRunner::new();
        mock.expect_run()
            .withf(|inv| {
                let args = &inv.args;
                args.windows(2).any(|w| w[0] == "-vframes" && w[1] == "1")
                    && args.last().map_or(false, |o| o.ends_with("clip.jpg"))
            })
            .times(1)
            .returning(|inv| {
                std::fs::write(inv.args.last().unwrap(), b"jpg").unwrap();
                Ok(())
            });

        let command = VideoCommand::new(test_config(dir.path()), Arc::new(mock));
        let mut temp_files = TempFiles::new();
        assert!(command
            .transform(Format::Jpg, &source, &mut temp_files)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_tool_failure_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip");
        std::fs::write(&source, b"video").unwrap();

        let mut mock = MockToolRunner::new();
        mock.expect_run().returning(|inv| {
            Err(ConversionError::ToolFailed {
                program: inv.program.clone(),
                code: 1,
                stderr: "Invalid data found when processing input".to_string(),
            })
        });

        let command = VideoCommand::new(test_config(dir.path()), Arc::new(mock));
        let mut temp_files = TempFiles::new();
        let result = command.transform(Format::Mp4, &source, &mut temp_files).await;

        assert!(matches!(result, Err(ConversionError::ToolFailed { code: 1, .. })));
        assert_eq!(temp_files.paths().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let command = VideoCommand::new(test_config(dir.path()), Arc::new(MockToolRunner::new()));
        let mut temp_files = TempFiles::new();

        let result = command
            .transform(Format::Pdf, &dir.path().join("clip"), &mut temp_files)
            .await;

        assert!(matches!(result, Err(ConversionError::UnsupportedFormat(Format::Pdf))));
        assert!(temp_files.paths().is_empty());
    }
}
