//! Prompts for the optional LLM refinement pass.
//!
//! Callers can override the default via
//! [`crate::config::ConversionConfig::refine_prompt`].

/// Default system prompt for [`crate::pipeline::refine::LlmRefiner`].
///
/// The model receives one page of blocks as a JSON array and must answer
/// with an array of the same length.
pub const REFINE_SYSTEM_PROMPT: &str = r#"You repair Markdown blocks that were reconstructed from a PDF page by layout analysis.

INPUT
A JSON array. Each element is {"kind": <kind>, "markdown": <text>} where kind is one of
"heading:N", "paragraph", "list-item", "table-row", "equation", "diagnostic".

TASK
- Correct block kinds: a paragraph that is really a heading, a heading at the wrong level, a line that is really a list item.
- Copy every "markdown" value exactly as given. Answers with changed text are discarded.
- Never touch image links, "table-row", "equation" or "diagnostic" blocks, or <mark> annotations.

OUTPUT
Return ONLY a JSON array with exactly as many elements as the input, in the same order,
each {"kind": <kind>, "markdown": <text>}. No commentary, no code fences."#;

/// Build the user message carrying one page of blocks.
pub fn refine_request(blocks_json: &str) -> String {
    format!("Blocks:\n{blocks_json}")
}
