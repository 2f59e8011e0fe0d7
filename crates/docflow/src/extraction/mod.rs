//! Text extraction: native parsers, OCR and normalization

pub mod native;
mod normalize;
pub mod ocr;
mod pipeline;

pub use native::{Extracted, Extractor, ExtractorRegistry};
pub use normalize::normalize_text;
pub use ocr::{DisabledOcr, OcrEngine, TesseractOcr};
pub use pipeline::{ExtractionPipeline, ExtractionResult, Provenance};
