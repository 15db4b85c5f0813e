//! Chunk planning: partition a paginated document into ordered page ranges.
//!
//! The planner only computes ranges. Materialising the bytes for a range is
//! the page source's job and happens later, inside the worker that owns the
//! chunk, so an extraction failure is attributed to that chunk alone.

use crate::document::PageRange;
use crate::error::DocParseError;
use serde::Serialize;

/// One planned chunk of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSpec {
    pub document_id: String,
    /// Zero-based sequence index; also the chunk's slot in the aggregator.
    pub index: usize,
    pub pages: PageRange,
}

/// Split `total_pages` into `ceil(total_pages / pages_per_chunk)` chunks.
///
/// Chunk `i` covers `[i * C, min((i + 1) * C, P))`. The chunks are
/// contiguous, non-overlapping and together cover `[0, P)`. Zero pages give
/// an empty plan; a zero chunk size is a configuration error.
pub fn plan_chunks(
    document_id: &str,
    total_pages: usize,
    pages_per_chunk: usize,
) -> Result<Vec<ChunkSpec>, DocParseError> {
    if pages_per_chunk == 0 {
        return Err(DocParseError::InvalidConfig(
            "pages_per_chunk must be ≥ 1, got 0".into(),
        ));
    }

    let chunks = (0..total_pages)
        .step_by(pages_per_chunk)
        .enumerate()
        .map(|(index, start)| ChunkSpec {
            document_id: document_id.to_string(),
            index,
            pages: PageRange::new(start, (start + pages_per_chunk).min(total_pages)),
        })
        .collect();

    Ok(chunks)
}
