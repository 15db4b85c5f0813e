//! Default prompts and instructions.
//!
//! Callers override these through [`crate::config::ProcessConfig::prompt`]
//! and [`crate::config::ProcessConfig::cache_system_instruction`]; the
//! constants are used only when no override is provided.

/// Default instruction sent with every chunk.
pub const DEFAULT_PROMPT: &str =
    "Transcribe this document into text format preserving layout and formatting.";

/// Default system instruction stored alongside cached content.
pub const DEFAULT_CACHE_INSTRUCTION: &str = "You are processing documents efficiently.";

/// Build the prompt for one chunk of a multi-chunk document.
///
/// Single-chunk documents get the caller's prompt untouched. For split
/// documents the model is told which pages it is looking at so it does not
/// invent a title page or a closing summary for a middle slice.
pub fn chunk_prompt(
    base: &str,
    start_page: usize,
    end_page: usize,
    total_pages: usize,
    total_chunks: usize,
) -> String {
    if total_chunks <= 1 {
        return base.to_string();
    }
    format!(
        "{base}\n\nThis excerpt contains pages {}-{} of a {total_pages}-page document. \
Transcribe only these pages and do not add introductions or summaries.",
        start_page + 1,
        end_page
    )
}
