//! Index-addressed fan-in of chunk results.
//!
//! The aggregator owns one slot per planned chunk. Workers finish in any
//! order; each result lands in the slot named by its sequence index, so the
//! merged text follows document order regardless of completion order.

use crate::document::PageRange;
use crate::error::{ChunkError, DocParseError};
use crate::output::{ChunkResult, ProcessStats};
use crate::pipeline::planner::ChunkSpec;
use tracing::{info, warn};

/// Separator placed between the texts of consecutive successful chunks.
pub const CHUNK_SEPARATOR: &str = "\n\n";

#[derive(Debug)]
pub struct ResultAggregator {
    slots: Vec<Option<ChunkResult>>,
    pages: Vec<PageRange>,
}

impl ResultAggregator {
    /// Pre-size one empty slot per planned chunk.
    pub fn new(chunks: &[ChunkSpec]) -> Self {
        Self {
            slots: vec![None; chunks.len()],
            pages: chunks.iter().map(|c| c.pages).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store a terminal result in its slot. Each slot accepts one write.
    pub fn place(&mut self, result: ChunkResult) -> Result<(), DocParseError> {
        let index = result.index;
        let total = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            DocParseError::Internal(format!("chunk index {index} out of range (n={total})"))
        })?;
        if slot.is_some() {
            return Err(DocParseError::Internal(format!(
                "chunk {index} reported twice"
            )));
        }
        *slot = Some(result);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Indices whose result never arrived.
    pub fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Consume the aggregator, returning results in index order.
    ///
    /// Slots that never received a result (a worker died) become failed
    /// results, so the output always has exactly one entry per chunk.
    pub fn into_results(self) -> Vec<ChunkResult> {
        self.slots
            .into_iter()
            .zip(self.pages)
            .enumerate()
            .map(|(index, (slot, pages))| {
                slot.unwrap_or_else(|| {
                    warn!("Chunk {}: no result reported; marking failed", index);
                    ChunkResult::failed(
                        index,
                        pages,
                        ChunkError::Aborted {
                            index,
                            detail: "worker stopped before reporting".into(),
                        },
                    )
                })
            })
            .collect()
    }
}

/// Join non-empty successful texts in index order.
///
/// Failed chunks are skipped without disturbing the order of the others.
pub fn merge_texts(results: &[ChunkResult]) -> String {
    results
        .iter()
        .filter(|r| r.is_success() && !r.text.is_empty())
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR)
}

/// Summarise a finished run and log how it ended.
pub fn summarise(results: &[ChunkResult], total_pages: usize, duration_ms: u64) -> ProcessStats {
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let stats = ProcessStats {
        total_pages,
        total_chunks: results.len(),
        succeeded_chunks: succeeded,
        failed_chunks: results.len() - succeeded,
        cached_chunks: results.iter().filter(|r| r.from_result_cache).count(),
        total_input_tokens: results.iter().map(|r| r.input_tokens).sum(),
        total_output_tokens: results.iter().map(|r| r.output_tokens).sum(),
        duration_ms,
    };

    if stats.total_chunks == 0 {
        info!("Document has no pages; nothing to process");
    } else if succeeded == 0 {
        warn!("All {} chunks failed; merged result is empty", stats.total_chunks);
    } else if stats.failed_chunks > 0 {
        warn!(
            "{}/{} chunks failed; merged result omits their pages",
            stats.failed_chunks, stats.total_chunks
        );
    } else {
        info!("All {} chunks succeeded in {}ms", stats.total_chunks, duration_ms);
    }

    stats
}
