//! Format-specific text extractors
//!
//! Extractors are synchronous and CPU-bound; the pipeline runs them on the
//! blocking pool. A parse failure is a `Permanent` error. Empty output is not
//! an error: it is the signal for OCR fallback.

use calamine::Reader as _;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Raw output of a native extractor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub text: String,
    /// Pages, slides or sheets, where the format has them
    pub pages: Option<u32>,
}

impl Extracted {
    fn text(text: String) -> Self {
        Self { text, pages: None }
    }

    fn paged(text: String, pages: u32) -> Self {
        Self {
            text,
            pages: Some(pages),
        }
    }
}

/// A native (non-OCR) text extractor
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Mime types this extractor handles
    fn supported_types(&self) -> &[&str];

    fn extract(&self, data: &[u8]) -> Result<Extracted>;
}

/// Mime type to extractor dispatch
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
    mime_mapping: HashMap<String, String>,
}

impl ExtractorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
            mime_mapping: HashMap::new(),
        }
    }

    /// Registry with every built-in extractor
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TextExtractor);
        registry.register(MarkdownExtractor);
        registry.register(HtmlExtractor);
        registry.register(CsvExtractor);
        registry.register(PptxExtractor);
        #[cfg(feature = "pdf")]
        registry.register(PdfExtractor);
        #[cfg(feature = "docx")]
        registry.register(DocxExtractor);
        #[cfg(feature = "xlsx")]
        registry.register(XlsxExtractor);
        registry
    }

    /// Register an extractor for all of its mime types
    pub fn register<E: Extractor + 'static>(&mut self, extractor: E) {
        let name = extractor.name().to_string();
        for mime in extractor.supported_types() {
            self.mime_mapping.insert((*mime).to_string(), name.clone());
        }
        self.extractors.insert(name, Arc::new(extractor));
    }

    pub fn get_for_mime(&self, mime_type: &str) -> Option<Arc<dyn Extractor>> {
        self.mime_mapping
            .get(mime_type)
            .and_then(|name| self.extractors.get(name))
            .cloned()
    }

    /// Mime types with a native extractor
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.mime_mapping.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn decode_utf8(data: &[u8]) -> String {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    String::from_utf8_lossy(data).into_owned()
}

/// text/plain
pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn name(&self) -> &str {
        "text"
    }

    fn supported_types(&self) -> &[&str] {
        &["text/plain"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        Ok(Extracted::text(decode_utf8(data)))
    }
}

/// Markdown, keeping only the prose
pub struct MarkdownExtractor;

impl Extractor for MarkdownExtractor {
    fn name(&self) -> &str {
        "markdown"
    }

    fn supported_types(&self) -> &[&str] {
        &["text/markdown", "text/x-markdown"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        use pulldown_cmark::{Event, Parser, TagEnd};

        let source = decode_utf8(data);
        let mut text = String::with_capacity(source.len());

        for event in Parser::new(&source) {
            match event {
                Event::Text(t) | Event::Code(t) => text.push_str(&t),
                Event::SoftBreak => text.push(' '),
                Event::HardBreak => text.push('\n'),
                Event::End(
                    TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item | TagEnd::CodeBlock,
                ) => text.push('\n'),
                _ => {}
            }
        }

        Ok(Extracted::text(text))
    }
}

/// HTML body text, without scripts and styles
pub struct HtmlExtractor;

impl Extractor for HtmlExtractor {
    fn name(&self) -> &str {
        "html"
    }

    fn supported_types(&self) -> &[&str] {
        &["text/html", "application/xhtml+xml"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        let html = decode_utf8(data);
        let document = scraper::Html::parse_document(&html);

        let mut parts: Vec<&str> = Vec::new();
        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name()))
                .is_some_and(|name| matches!(name, "script" | "style" | "noscript" | "head" | "title"));
            let trimmed = text.trim();
            if !hidden && !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }

        Ok(Extracted::text(parts.join("\n")))
    }
}

/// CSV rows joined with `|`
pub struct CsvExtractor;

impl Extractor for CsvExtractor {
    fn name(&self) -> &str {
        "csv"
    }

    fn supported_types(&self) -> &[&str] {
        &["text/csv"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(data);

        let mut text = String::new();
        for (line, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| Error::permanent(format!("Malformed CSV at record {}: {}", line + 1, e)))?;
            let row: Vec<&str> = record.iter().map(str::trim).collect();
            if row.iter().any(|cell| !cell.is_empty()) {
                text.push_str(&row.join(" | "));
                text.push('\n');
            }
        }

        Ok(Extracted::text(text))
    }
}

/// Word documents: paragraph runs and table cells
pub struct DocxExtractor;

impl DocxExtractor {
    fn paragraph_text(paragraph: &docx_rs::Paragraph, out: &mut String) {
        for child in &paragraph.children {
            if let docx_rs::ParagraphChild::Run(run) = child {
                for run_child in &run.children {
                    match run_child {
                        docx_rs::RunChild::Text(t) => out.push_str(&t.text),
                        docx_rs::RunChild::Tab(_) => out.push('\t'),
                        docx_rs::RunChild::Break(_) => out.push('\n'),
                        _ => {}
                    }
                }
            }
        }
        out.push('\n');
    }

    #[allow(irrefutable_let_patterns)]
    fn table_text(table: &docx_rs::Table, out: &mut String) {
        for row in &table.rows {
            let docx_rs::TableChild::TableRow(row) = row else {
                continue;
            };
            let mut cells = Vec::new();
            for cell in &row.cells {
                let docx_rs::TableRowChild::TableCell(cell) = cell else {
                    continue;
                };
                let mut cell_text = String::new();
                for content in &cell.children {
                    if let docx_rs::TableCellContent::Paragraph(p) = content {
                        Self::paragraph_text(p, &mut cell_text);
                    }
                }
                cells.push(cell_text.trim().to_string());
            }
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
    }
}

impl Extractor for DocxExtractor {
    fn name(&self) -> &str {
        "docx"
    }

    fn supported_types(&self) -> &[&str] {
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        let docx = docx_rs::read_docx(data)
            .map_err(|e| Error::permanent(format!("Unreadable DOCX: {}", e)))?;

        let mut text = String::new();
        for child in &docx.document.children {
            match child {
                docx_rs::DocumentChild::Paragraph(p) => Self::paragraph_text(p, &mut text),
                docx_rs::DocumentChild::Table(t) => Self::table_text(t, &mut text),
                _ => {}
            }
        }

        Ok(Extracted::text(text))
    }
}

/// PDF via pdf-extract, with a lopdf fallback
///
/// Image-only PDFs come back empty rather than failing.
pub struct PdfExtractor;

impl PdfExtractor {
    fn page_count(data: &[u8]) -> Option<u32> {
        lopdf::Document::load_mem(data)
            .ok()
            .map(|doc| doc.get_pages().len() as u32)
    }

    fn extract_with_lopdf(data: &[u8]) -> Result<Extracted> {
        let doc = lopdf::Document::load_mem(data)
            .map_err(|e| Error::permanent(format!("Unreadable PDF: {}", e)))?;

        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        let text = doc.extract_text(&pages).unwrap_or_default();
        Ok(Extracted::paged(text, pages.len() as u32))
    }
}

impl Extractor for PdfExtractor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn supported_types(&self) -> &[&str] {
        &["application/pdf"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        // pdf-extract panics on some malformed font tables
        let primary = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem(data)
        }));

        match primary {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                Ok(Extracted {
                    text,
                    pages: Self::page_count(data),
                })
            }
            Ok(Ok(_)) => Self::extract_with_lopdf(data),
            Ok(Err(e)) => {
                tracing::debug!("pdf-extract failed: {}, trying lopdf", e);
                Self::extract_with_lopdf(data)
            }
            Err(_) => {
                tracing::warn!("pdf-extract panicked, trying lopdf");
                Self::extract_with_lopdf(data)
            }
        }
    }
}

/// PowerPoint slides, `<a:t>` runs in slide order
pub struct PptxExtractor;

impl PptxExtractor {
    fn slide_number(name: &str) -> u32 {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse()
            .unwrap_or(u32::MAX)
    }

    fn slide_text(xml: &str) -> String {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut paragraphs = Vec::new();
        let mut current = String::new();
        let mut in_text = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
                Ok(Event::Text(e)) if in_text => {
                    if let Ok(t) = e.unescape() {
                        if !current.is_empty() {
                            current.push(' ');
                        }
                        current.push_str(&t);
                    }
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"t" => in_text = false,
                    b"p" if !current.is_empty() => paragraphs.push(std::mem::take(&mut current)),
                    _ => {}
                },
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
        }
        if !current.is_empty() {
            paragraphs.push(current);
        }

        paragraphs.join("\n")
    }
}

impl Extractor for PptxExtractor {
    fn name(&self) -> &str {
        "pptx"
    }

    fn supported_types(&self) -> &[&str] {
        &["application/vnd.openxmlformats-officedocument.presentationml.presentation"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))
            .map_err(|e| Error::permanent(format!("Unreadable PPTX: {}", e)))?;

        let mut slides: Vec<String> = archive
            .file_names()
            .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
            .map(str::to_string)
            .collect();
        slides.sort_by_key(|name| Self::slide_number(name));

        let mut text = String::new();
        for name in &slides {
            let mut xml = String::new();
            archive
                .by_name(name)
                .map_err(|e| Error::permanent(format!("Missing slide {}: {}", name, e)))?
                .read_to_string(&mut xml)
                .map_err(|e| Error::permanent(format!("Unreadable slide {}: {}", name, e)))?;

            let slide = Self::slide_text(&xml);
            if !slide.is_empty() {
                text.push_str(&slide);
                text.push_str("\n\n");
            }
        }

        Ok(Extracted::paged(text, slides.len() as u32))
    }
}

/// Spreadsheets, one block of `|`-joined rows per sheet
pub struct XlsxExtractor;

impl XlsxExtractor {
    fn cell_text(cell: &calamine::Data) -> String {
        match cell {
            calamine::Data::Empty => String::new(),
            calamine::Data::String(s) => s.trim().to_string(),
            calamine::Data::Float(f) => f.to_string(),
            calamine::Data::Int(i) => i.to_string(),
            calamine::Data::Bool(b) => b.to_string(),
            calamine::Data::DateTime(dt) => dt.to_string(),
            calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
            _ => String::new(),
        }
    }
}

impl Extractor for XlsxExtractor {
    fn name(&self) -> &str {
        "xlsx"
    }

    fn supported_types(&self) -> &[&str] {
        &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"]
    }

    fn extract(&self, data: &[u8]) -> Result<Extracted> {
        let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(data))
            .map_err(|e| Error::permanent(format!("Unreadable spreadsheet: {}", e)))?;

        let sheets = workbook.sheet_names().to_vec();
        let mut text = String::new();
        for sheet in &sheets {
            let range = workbook
                .worksheet_range(sheet)
                .map_err(|e| Error::permanent(format!("Unreadable sheet {}: {}", sheet, e)))?;

            text.push_str(sheet);
            text.push('\n');
            for row in range.rows() {
                let cells: Vec<String> = row.iter().map(Self::cell_text).collect();
                if cells.iter().any(|c| !c.is_empty()) {
                    text.push_str(&cells.join(" | "));
                    text.push('\n');
                }
            }
            text.push('\n');
        }

        Ok(Extracted::paged(text, sheets.len() as u32))
    }
}
