//! Page sources: page counting and page-range extraction.
//!
//! ## Why pdfium?
//!
//! Splitting a PDF means copying a page range into a fresh document and
//! serialising it, which pdfium does natively. pdfium keeps thread-local
//! state and blocks, so callers run these methods inside
//! `tokio::task::spawn_blocking`.

use crate::document::PageRange;
use crate::services::PageSource;
use pdfium_render::prelude::*;
use tracing::debug;

/// PDF page source backed by pdfium.
///
/// Binds to the library at `PDFIUM_LIB_PATH` when set, otherwise to the
/// system library. Binding happens per call, matching how pdfium is used
/// from blocking tasks.
#[derive(Debug, Default, Clone)]
pub struct PdfiumPageSource;

impl PdfiumPageSource {
    pub fn new() -> Self {
        Self
    }

    fn bind() -> Result<Pdfium, String> {
        let bindings = match std::env::var("PDFIUM_LIB_PATH") {
            Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
            _ => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| format!("failed to bind pdfium: {e:?}"))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PageSource for PdfiumPageSource {
    fn page_count(&self, bytes: &[u8]) -> Result<usize, String> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| format!("corrupt or encrypted PDF: {e:?}"))?;
        Ok(document.pages().len() as usize)
    }

    fn extract(&self, bytes: &[u8], pages: PageRange) -> Result<Vec<u8>, String> {
        if pages.is_empty() {
            return Err(format!("empty page range {pages}"));
        }
        let pdfium = Self::bind()?;
        let source = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| format!("corrupt or encrypted PDF: {e:?}"))?;

        let total = source.pages().len() as usize;
        if pages.end > total {
            return Err(format!(
                "page range {pages} exceeds document length {total}"
            ));
        }

        let mut target = pdfium
            .create_new_pdf()
            .map_err(|e| format!("could not create chunk document: {e:?}"))?;
        target
            .pages_mut()
            .copy_page_range_from_document(
                &source,
                pages.start as u16..=(pages.end - 1) as u16,
                0,
            )
            .map_err(|e| format!("could not copy pages {pages}: {e:?}"))?;

        let out = target
            .save_to_bytes()
            .map_err(|e| format!("could not serialise pages {pages}: {e:?}"))?;
        debug!("Extracted pages {} → {} bytes", pages, out.len());
        Ok(out)
    }
}

/// Treats the whole input as a single page (plain text, HTML, CSV, …).
#[derive(Debug, Default, Clone)]
pub struct WholeDocumentSource;

impl PageSource for WholeDocumentSource {
    fn page_count(&self, bytes: &[u8]) -> Result<usize, String> {
        Ok(if bytes.is_empty() { 0 } else { 1 })
    }

    fn extract(&self, bytes: &[u8], pages: PageRange) -> Result<Vec<u8>, String> {
        if pages != PageRange::new(0, 1) {
            return Err(format!("single-page document has no pages {pages}"));
        }
        Ok(bytes.to_vec())
    }
}
