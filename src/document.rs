//! The immutable input document.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// MIME type of PDF documents; the only paginated type.
pub const PDF_MIME: &str = "application/pdf";

/// A loaded document: identifier, raw bytes and MIME type.
///
/// The bytes are reference-counted so every worker can read them without
/// copying; nothing mutates a `Document` once it is built. The page count is
/// discovered by the page source when processing starts.
#[derive(Clone)]
pub struct Document {
    id: String,
    bytes: Arc<Vec<u8>>,
    mime_type: String,
}

impl Document {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bytes: Arc::new(bytes),
            mime_type: mime_type.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared handle on the raw bytes, for moving into blocking tasks.
    pub fn shared_bytes(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.bytes)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type == PDF_MIME
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Half-open page range `[start, end)`, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "page range start {start} > end {end}");
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_accessors() {
        let doc = Document::new("a.pdf", b"%PDF-1.7".to_vec(), PDF_MIME);
        assert_eq!(doc.id(), "a.pdf");
        assert_eq!(doc.len(), 8);
        assert!(doc.is_pdf());
        assert!(!format!("{doc:?}").contains("PDF-1.7"));
    }

    #[test]
    fn page_range_display_is_half_open() {
        let r = PageRange::new(10, 12);
        assert_eq!(r.len(), 2);
        assert_eq!(r.to_string(), "[10, 12)");
    }
}
