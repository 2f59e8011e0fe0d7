//! OCR engines used for images and as the fallback for empty native text

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::providers::command::{run_tool, tool_available};

/// Trait for OCR engines
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Whether this engine can read the given mime type
    fn supports(&self, mime_type: &str) -> bool;

    /// Recognise text; empty output means nothing legible was found
    async fn recognize(&self, data: &[u8], mime_type: &str) -> Result<String>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// OCR switched off; supports nothing
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    fn supports(&self, _mime_type: &str) -> bool {
        false
    }

    async fn recognize(&self, _data: &[u8], mime_type: &str) -> Result<String> {
        Err(Error::permanent(format!("OCR is disabled; cannot read {}", mime_type)))
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Tesseract, with pdftoppm rasterising page-oriented documents
pub struct TesseractOcr {
    languages: String,
    dpi: u32,
}

impl TesseractOcr {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            languages: config.ocr_languages.clone(),
            dpi: config.ocr_dpi,
        }
    }

    /// Both binaries present on PATH
    pub fn is_installed() -> bool {
        tool_available("tesseract", "--version") && tool_available("pdftoppm", "-v")
    }

    async fn tesseract(image: &Path, languages: &str) -> Result<String> {
        let args: [&OsStr; 4] = [
            image.as_os_str(),
            OsStr::new("stdout"),
            OsStr::new("-l"),
            OsStr::new(languages),
        ];
        let output = run_tool("tesseract", args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn recognize_image(data: &[u8], languages: &str) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("input");
        tokio::fs::write(&image, data).await?;
        Self::tesseract(&image, languages).await
    }

    async fn recognize_pdf(data: &[u8], languages: &str, dpi: u32) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.pdf");
        let prefix = dir.path().join("page");
        tokio::fs::write(&input, data).await?;

        let dpi = dpi.to_string();
        let args: [&OsStr; 5] = [
            OsStr::new("-png"),
            OsStr::new("-r"),
            OsStr::new(&dpi),
            input.as_os_str(),
            prefix.as_os_str(),
        ];
        run_tool("pdftoppm", args).await?;

        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "png") {
                pages.push(path);
            }
        }
        // pdftoppm zero-pads page numbers, so lexical order is page order
        pages.sort();

        let mut text = String::new();
        for page in &pages {
            let page_text = Self::tesseract(page, languages).await?;
            if !page_text.trim().is_empty() {
                text.push_str(page_text.trim());
                text.push_str("\n\n");
            }
        }

        tracing::debug!(pages = pages.len(), chars = text.len(), "PDF OCR complete");
        Ok(text)
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("image/") || mime_type == "application/pdf"
    }

    async fn recognize(&self, data: &[u8], mime_type: &str) -> Result<String> {
        if !self.supports(mime_type) {
            return Err(Error::permanent(format!("OCR cannot read {}", mime_type)));
        }

        if mime_type == "application/pdf" {
            Self::recognize_pdf(data, &self.languages, self.dpi).await
        } else {
            Self::recognize_image(data, &self.languages).await
        }
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}
