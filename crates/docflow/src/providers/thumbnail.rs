//! Best-effort preview generation
//!
//! Failures here are never fatal to an upload; callers log and move on.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::time::Duration;

use super::command::run_tool;
use crate::config::ThumbnailConfig;
use crate::error::{Error, Result};

/// Trait for thumbnail generators
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// PNG bytes, or `None` when the type has no preview
    async fn generate(&self, data: &[u8], mime_type: &str) -> Result<Option<Vec<u8>>>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Produces no thumbnails
pub struct NoopThumbnailer;

#[async_trait]
impl ThumbnailGenerator for NoopThumbnailer {
    async fn generate(&self, _data: &[u8], _mime_type: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Renders thumbnails with `pdftoppm` (PDF) and ImageMagick `convert` (images)
pub struct CommandThumbnailer {
    size: u32,
    timeout: Duration,
}

impl CommandThumbnailer {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            size: config.size,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn render_pdf(data: &[u8], size: u32) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.pdf");
        let prefix = dir.path().join("thumb");
        tokio::fs::write(&input, data).await?;

        let size = size.to_string();
        let args: [&OsStr; 8] = [
            OsStr::new("-png"),
            OsStr::new("-singlefile"),
            OsStr::new("-f"),
            OsStr::new("1"),
            OsStr::new("-scale-to"),
            OsStr::new(&size),
            input.as_os_str(),
            prefix.as_os_str(),
        ];
        run_tool("pdftoppm", args).await?;

        Ok(tokio::fs::read(dir.path().join("thumb.png")).await?)
    }

    async fn render_image(data: &[u8], size: u32) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input");
        let output = dir.path().join("thumb.png");
        tokio::fs::write(&input, data).await?;

        // [0] picks the first frame of multi-frame GIF/TIFF
        let mut source = input.into_os_string();
        source.push("[0]");
        let geometry = format!("{}x{}", size, size);
        let args: [&OsStr; 4] = [
            source.as_os_str(),
            OsStr::new("-thumbnail"),
            OsStr::new(&geometry),
            output.as_os_str(),
        ];
        run_tool("convert", args).await?;

        Ok(tokio::fs::read(output).await?)
    }
}

#[async_trait]
impl ThumbnailGenerator for CommandThumbnailer {
    async fn generate(&self, data: &[u8], mime_type: &str) -> Result<Option<Vec<u8>>> {
        let render = if mime_type == "application/pdf" {
            futures::future::Either::Left(Self::render_pdf(data, self.size))
        } else if mime_type.starts_with("image/") {
            futures::future::Either::Right(Self::render_image(data, self.size))
        } else {
            return Ok(None);
        };

        match tokio::time::timeout(self.timeout, render).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(Error::transient(format!(
                "Thumbnail generation timed out after {:?}",
                self.timeout
            ))),
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}
