//! Document conversion through the office renderer and image rasterizer.

use super::{create_dir, with_suffix, Command, ConvertContext};
use crate::config::ConvertConfig;
use crate::error::ConversionError;
use crate::task::{CommandKind, Format};
use crate::temp_files::TempFiles;
use crate::tools::{ensure_output, ToolInvocation, ToolRunner};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const DOCUMENT_DIR: &str = "documents";

const ALLOWED: &[Format] = &[
    Format::Pdf,
    Format::Jpg,
    Format::Txt,
    Format::Text,
    Format::Md5,
    Format::Sha1,
    Format::Crc32,
    Format::PngAllPages,
];

const PDF_SIGNATURE: &[u8] = b"%PDF-";

pub struct DocumentCommand {
    config: Arc<ConvertConfig>,
    tools: Arc<dyn ToolRunner>,
    worker_id: String,
}

impl DocumentCommand {
    /// `worker_id` isolates the renderer profile of concurrent workers.
    pub fn new(
        config: Arc<ConvertConfig>,
        tools: Arc<dyn ToolRunner>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            tools,
            worker_id: worker_id.into(),
        }
    }

    fn profile_dir(&self) -> PathBuf {
        std::env::temp_dir().join("libreoffice").join(&self.worker_id)
    }

    /// A PDF usable as input for derived formats, rendering one if needed.
    async fn locate_pdf(&self, ctx: &mut ConvertContext<'_>) -> Result<PathBuf, ConversionError> {
        if is_pdf(ctx.source).await {
            debug!(source = %ctx.source.display(), "Source is already a PDF");
            return Ok(ctx.source.to_path_buf());
        }
        if let Some(pdf) = ctx.outputs.get(&Format::Pdf).or(ctx.intermediates.get(&Format::Pdf)) {
            return Ok(pdf.clone());
        }

        let pdf = self.transform(Format::Pdf, ctx.source, ctx.temp_files).await?;
        ctx.intermediates.insert(Format::Pdf, pdf.clone());
        if ctx.requested.contains(&Format::Pdf) {
            ctx.outputs.insert(Format::Pdf, pdf.clone());
        }
        Ok(pdf)
    }

    /// Rasterizes every page of `pdf` and bundles the images into one archive.
    async fn rasterize_pages(
        &self,
        pdf: &Path,
        temp_files: &mut TempFiles,
    ) -> Result<PathBuf, ConversionError> {
        let single = with_suffix(pdf, ".png");
        let invocation = ToolInvocation::new(
            &self.config.imagemagick_bin,
            [
                "-density".to_string(),
                "150".to_string(),
                pdf.display().to_string(),
                "-quality".to_string(),
                "90".to_string(),
                single.display().to_string(),
            ],
        );
        self.tools.run(&invocation).await?;

        let mut pages = Vec::new();
        if tokio::fs::metadata(&single).await.is_ok() {
            pages.push(single.clone());
        } else {
            loop {
                let page = with_suffix(pdf, &format!("-{}.png", pages.len()));
                if tokio::fs::metadata(&page).await.is_err() {
                    break;
                }
                pages.push(page);
            }
        }
        for page in &pages {
            temp_files.register(page);
        }
        if pages.is_empty() {
            return Err(ConversionError::MissingOutput(single));
        }

        let archive = with_suffix(pdf, "_pngs.zip");
        temp_files.register(&archive);

        info!(pages = pages.len(), archive = %archive.display(), "Bundling rasterized pages");
        let target = archive.clone();
        tokio::task::spawn_blocking(move || write_archive(&target, &pages)).await??;

        Ok(archive)
    }
}

#[async_trait]
impl Command for DocumentCommand {
    fn kind(&self) -> CommandKind {
        CommandKind::Document
    }

    fn allowed_formats(&self) -> &'static [Format] {
        ALLOWED
    }

    fn max_size(&self) -> u64 {
        self.config.max_document_size
    }

    fn success_dir(&self) -> PathBuf {
        self.config.success_dir.join(DOCUMENT_DIR)
    }

    fn download_dir(&self) -> PathBuf {
        self.config.download_dir.join(DOCUMENT_DIR)
    }

    async fn transform(
        &self,
        format: Format,
        source: &Path,
        temp_files: &mut TempFiles,
    ) -> Result<PathBuf, ConversionError> {
        if format == Format::PngAllPages || format == Format::Mp4 {
            return Err(ConversionError::UnsupportedFormat(format));
        }

        let directory = self.success_dir();
        create_dir(&directory).await?;

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output = directory.join(format!("{}.{}", stem, format));
        temp_files.register(&output);

        let invocation = ToolInvocation::new(
            &self.config.libreoffice_bin,
            [
                format!("-env:UserInstallation=file://{}", self.profile_dir().display()),
                "--convert-to".to_string(),
                format.to_string(),
                "--outdir".to_string(),
                directory.display().to_string(),
                source.display().to_string(),
                "--headless".to_string(),
                "--display".to_string(),
                ":0".to_string(),
            ],
        );
        self.tools.run(&invocation).await?;
        ensure_output(&output).await?;

        Ok(output)
    }

    async fn pre_convert(
        &self,
        ctx: &mut ConvertContext<'_>,
        format: Format,
    ) -> Result<bool, ConversionError> {
        match format {
            Format::Jpg => {
                let pdf = self.locate_pdf(ctx).await?;
                let jpg = self.transform(Format::Jpg, &pdf, ctx.temp_files).await?;
                ctx.outputs.insert(Format::Jpg, jpg);
                Ok(true)
            }
            Format::PngAllPages => {
                let pdf = self.locate_pdf(ctx).await?;
                let archive = self.rasterize_pages(&pdf, ctx.temp_files).await?;
                ctx.outputs.insert(Format::PngAllPages, archive);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Content sniffing: a PDF starts with the `%PDF-` signature.
pub async fn is_pdf(path: &Path) -> bool {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut head = [0u8; 5];
        File::open(&path)
            .and_then(|mut f| f.read_exact(&mut head))
            .map(|_| &head[..] == PDF_SIGNATURE)
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

fn write_archive(archive: &Path, pages: &[PathBuf]) -> Result<(), ConversionError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ConversionError::Io { path, source }
    };
    let zip_err = |source: zip::result::ZipError| ConversionError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::create(archive).map_err(io_err(archive))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default();

    for (index, page) in pages.iter().enumerate() {
        writer
            .start_file(format!("{}.png", index), options)
            .map_err(zip_err)?;
        let mut input = File::open(page).map_err(io_err(page))?;
        std::io::copy(&mut input, &mut writer).map_err(io_err(page))?;
    }
    let mut inner = writer.finish().map_err(zip_err)?;
    inner.flush().map_err(io_err(archive))?;
    Ok(())
}
