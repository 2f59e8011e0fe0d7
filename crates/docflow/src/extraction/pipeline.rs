//! Native extraction with OCR fallback

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::native::{Extracted, ExtractorRegistry};
use super::normalize::normalize_text;
use super::ocr::OcrEngine;
use crate::config::ExtractionConfig;
use crate::error::{Error, Result};

/// Which path produced the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Native extractor output
    Native,
    /// Native extraction was empty or failed; OCR produced the text
    OcrFallback,
    /// Image input, OCR only
    Ocr,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::OcrFallback => "ocr_fallback",
            Self::Ocr => "ocr",
        }
    }
}

/// Normalized text plus where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub text: String,
    pub provenance: Provenance,
    pub extractor: String,
    pub pages: Option<u32>,
}

/// Extraction pipeline
pub struct ExtractionPipeline {
    registry: Arc<ExtractorRegistry>,
    ocr: Arc<dyn OcrEngine>,
    timeout: Duration,
    ocr_timeout: Duration,
}

impl ExtractionPipeline {
    pub fn new(
        registry: Arc<ExtractorRegistry>,
        ocr: Arc<dyn OcrEngine>,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            registry,
            ocr,
            timeout: config.timeout(),
            ocr_timeout: config.ocr_timeout(),
        }
    }

    /// Mime types the pipeline can produce text for
    pub fn can_extract(&self, mime_type: &str) -> bool {
        self.registry.get_for_mime(mime_type).is_some() || self.ocr.supports(mime_type)
    }

    /// Extract text from `data`
    ///
    /// Timeouts are `Transient`; unsupported or unreadable content is
    /// `Permanent`.
    pub async fn extract(&self, mime_type: &str, data: Bytes) -> Result<ExtractionResult> {
        if mime_type.starts_with("image/") {
            if !self.ocr.supports(mime_type) {
                return Err(Error::permanent(format!(
                    "No OCR engine available for {}",
                    mime_type
                )));
            }
            let text = self.run_ocr(&data, mime_type).await?;
            return Ok(self.finish(text, Provenance::Ocr, self.ocr.name(), None));
        }

        let extractor = self.registry.get_for_mime(mime_type).ok_or_else(|| {
            Error::permanent(format!("No extractor for mime type {}", mime_type))
        })?;
        let name = extractor.name().to_string();

        let native = {
            let data = data.clone();
            let task = tokio::task::spawn_blocking(move || extractor.extract(&data));
            match tokio::time::timeout(self.timeout, task).await {
                Err(_) => Err(Error::transient(format!(
                    "{} extraction timed out after {:?}",
                    name, self.timeout
                ))),
                Ok(Err(join)) => Err(Error::permanent(format!(
                    "{} extractor panicked: {}",
                    name, join
                ))),
                Ok(Ok(result)) => result,
            }
        };

        match native {
            Ok(Extracted { text, pages }) if !text.trim().is_empty() => {
                Ok(self.finish(text, Provenance::Native, &name, pages))
            }
            Ok(Extracted { text, pages }) => {
                if !self.ocr.supports(mime_type) {
                    tracing::debug!(extractor = %name, "Native text empty, no OCR for this type");
                    return Ok(self.finish(text, Provenance::Native, &name, pages));
                }
                tracing::info!(extractor = %name, "Native text empty, falling back to OCR");
                let text = self.run_ocr(&data, mime_type).await?;
                Ok(self.finish(text, Provenance::OcrFallback, self.ocr.name(), pages))
            }
            Err(native_err) if self.ocr.supports(mime_type) && !native_err.is_retryable() => {
                tracing::warn!(extractor = %name, error = %native_err, "Native extraction failed, trying OCR");
                match self.run_ocr(&data, mime_type).await {
                    Ok(text) if text.trim().is_empty() => {
                        tracing::debug!(extractor = %name, "OCR fallback found no text");
                        Err(native_err)
                    }
                    Ok(text) => Ok(self.finish(text, Provenance::OcrFallback, self.ocr.name(), None)),
                    Err(ocr_err) if ocr_err.is_retryable() => Err(ocr_err),
                    Err(ocr_err) => {
                        tracing::debug!(error = %ocr_err, "OCR fallback failed");
                        Err(native_err)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_ocr(&self, data: &[u8], mime_type: &str) -> Result<String> {
        match tokio::time::timeout(self.ocr_timeout, self.ocr.recognize(data, mime_type)).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(format!(
                "OCR timed out after {:?}",
                self.ocr_timeout
            ))),
        }
    }

    fn finish(
        &self,
        text: String,
        provenance: Provenance,
        extractor: &str,
        pages: Option<u32>,
    ) -> ExtractionResult {
        ExtractionResult {
            text: normalize_text(&text),
            provenance,
            extractor: extractor.to_string(),
            pages,
        }
    }
}
