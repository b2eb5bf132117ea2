//! Optional structure refinement pass.
//!
//! A [`StructureRefiner`] receives one page of [`StructuredBlock`]s after
//! layout analysis and may return an improved version. The pipeline never
//! depends on it: [`apply_refiner`] validates whatever comes back and falls
//! back to the input blocks on any failure.
//!
//! ## Retry Strategy
//!
//! [`LlmRefiner`] retries transient provider errors with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`), each call bounded by
//! `api_timeout_secs`.

use crate::config::ConversionConfig;
use crate::error::Pdf2MdError;
use crate::model::{AssetId, BlockKind, StructuredBlock};
use crate::pipeline::postprocess::strip_markdown_fences;
use crate::prompts::{refine_request, REFINE_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Default model when a provider is named without one.
const DEFAULT_MODEL: &str = "gpt-4.1-nano";

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Post-structuring pass over one page of blocks.
#[async_trait]
pub trait StructureRefiner: Send + Sync {
    async fn refine(&self, blocks: &[StructuredBlock]) -> Result<Vec<StructuredBlock>, RefineError>;
}

/// Returns its input unchanged. Used when no refiner is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRefiner;

#[async_trait]
impl StructureRefiner for NoopRefiner {
    async fn refine(
        &self,
        blocks: &[StructuredBlock],
    ) -> Result<Vec<StructuredBlock>, RefineError> {
        Ok(blocks.to_vec())
    }
}

/// Run `refiner` over a page and validate the result.
///
/// The refined blocks are accepted only when they are non-empty for
/// non-empty input and reference exactly the same assets. Anything else,
/// including an error, leaves `blocks` untouched.
pub async fn apply_refiner(
    refiner: &dyn StructureRefiner,
    page_num: usize,
    blocks: Vec<StructuredBlock>,
) -> Vec<StructuredBlock> {
    if blocks.is_empty() {
        return blocks;
    }
    match refiner.refine(&blocks).await {
        Ok(refined) => match validate(&blocks, &refined) {
            Ok(()) => refined,
            Err(reason) => {
                warn!("Page {}: refiner output rejected: {}", page_num, reason);
                blocks
            }
        },
        Err(e) => {
            warn!("Page {}: refinement failed, keeping layout blocks: {}", page_num, e);
            blocks
        }
    }
}

fn asset_multiset(blocks: &[StructuredBlock]) -> Vec<&AssetId> {
    let mut ids: Vec<&AssetId> = blocks.iter().flat_map(|b| b.assets.iter()).collect();
    ids.sort();
    ids
}

fn validate(original: &[StructuredBlock], refined: &[StructuredBlock]) -> Result<(), String> {
    if refined.is_empty() {
        return Err("empty output".into());
    }
    if asset_multiset(original) != asset_multiset(refined) {
        return Err("asset references changed".into());
    }
    Ok(())
}

// ── LLM refiner ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct WireBlock {
    kind: String,
    markdown: String,
}

/// Refines blocks with a chat model via `edgequake-llm`.
///
/// The model may only re-type headings, paragraphs and list items (heading
/// levels included). Its text is accepted only when it matches the original
/// block; table rows, equations, diagnostics and blocks carrying assets are
/// passed through verbatim whatever the model answers.
pub struct LlmRefiner {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    system_prompt: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    timeout_secs: u64,
}

impl LlmRefiner {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(0.0),
                max_tokens: Some(4096),
                ..Default::default()
            },
            system_prompt: REFINE_SYSTEM_PROMPT.to_string(),
            max_retries: 2,
            retry_backoff_ms: 500,
            timeout_secs: 60,
        }
    }

    /// Build from the refinement fields of `config`, resolving a provider.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, Pdf2MdError> {
        let provider = resolve_provider(config)?;
        Ok(Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
            system_prompt: config
                .refine_prompt
                .clone()
                .unwrap_or_else(|| REFINE_SYSTEM_PROMPT.to_string()),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            timeout_secs: config.api_timeout_secs,
        })
    }

    async fn chat_with_retry(&self, messages: &[ChatMessage]) -> Result<String, RefineError> {
        let mut last_err = RefineError::Provider("no attempt made".into());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Refinement retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            let call = self.provider.chat(messages, Some(&self.options));
            match tokio::time::timeout(Duration::from_secs(self.timeout_secs), call).await {
                Ok(Ok(response)) => {
                    debug!(
                        "Refinement: {} input tokens, {} output tokens",
                        response.prompt_tokens, response.completion_tokens
                    );
                    return Ok(response.content);
                }
                Ok(Err(e)) => {
                    warn!("Refinement attempt {} failed: {}", attempt + 1, e);
                    last_err = RefineError::Provider(e.to_string());
                }
                Err(_) => {
                    warn!("Refinement attempt {} timed out", attempt + 1);
                    last_err = RefineError::Timeout {
                        secs: self.timeout_secs,
                    };
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl StructureRefiner for LlmRefiner {
    async fn refine(
        &self,
        blocks: &[StructuredBlock],
    ) -> Result<Vec<StructuredBlock>, RefineError> {
        let wire: Vec<WireBlock> = blocks
            .iter()
            .map(|b| WireBlock {
                kind: b.kind.to_string(),
                markdown: b.markdown.clone(),
            })
            .collect();
        let payload =
            serde_json::to_string(&wire).map_err(|e| RefineError::Malformed(e.to_string()))?;

        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user(refine_request(&payload)),
        ];
        let content = self.chat_with_retry(&messages).await?;

        let answer: Vec<WireBlock> = serde_json::from_str(&strip_markdown_fences(&content))
            .map_err(|e| RefineError::Malformed(e.to_string()))?;
        merge_refined(blocks, answer)
    }
}

/// Parse the `Display` form of a [`BlockKind`].
pub fn parse_block_kind(s: &str) -> Option<BlockKind> {
    let s = s.trim();
    if let Some(level) = s.strip_prefix("heading:") {
        return level
            .parse::<u8>()
            .ok()
            .filter(|l| (1..=6).contains(l))
            .map(BlockKind::Heading);
    }
    match s {
        "paragraph" => Some(BlockKind::Paragraph),
        "list-item" => Some(BlockKind::ListItem),
        "table-row" => Some(BlockKind::TableRow),
        "equation" => Some(BlockKind::Equation),
        "diagnostic" => Some(BlockKind::Diagnostic),
        _ => None,
    }
}

fn rewritable(kind: BlockKind) -> bool {
    matches!(
        kind,
        BlockKind::Heading(_) | BlockKind::Paragraph | BlockKind::ListItem
    )
}

static RE_ORDERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,3}\. ").unwrap());

/// Block text without heading markers, whitespace collapsed.
fn plain_text(markdown: &str) -> String {
    markdown
        .trim()
        .trim_start_matches('#')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip leading `#` markers and re-add them for headings.
fn render_for_kind(kind: BlockKind, markdown: &str) -> String {
    let body = markdown.trim().trim_start_matches('#').trim_start();
    match kind {
        BlockKind::Heading(level) => format!("{} {}", "#".repeat(level as usize), body),
        BlockKind::ListItem if !body.starts_with("- ") && !RE_ORDERED.is_match(body) => {
            format!("- {body}")
        }
        _ => body.to_string(),
    }
}

fn merge_refined(
    original: &[StructuredBlock],
    refined: Vec<WireBlock>,
) -> Result<Vec<StructuredBlock>, RefineError> {
    if refined.len() != original.len() {
        return Err(RefineError::Malformed(format!(
            "expected {} blocks, got {}",
            original.len(),
            refined.len()
        )));
    }

    Ok(original
        .iter()
        .zip(refined)
        .map(|(orig, wire)| {
            if !rewritable(orig.kind) || !orig.assets.is_empty() {
                return orig.clone();
            }
            let Some(kind) = parse_block_kind(&wire.kind).filter(|k| rewritable(*k)) else {
                return orig.clone();
            };
            if plain_text(&wire.markdown) != plain_text(&orig.markdown) {
                debug!("Refiner changed block text, keeping original: {:?}", orig.markdown);
                return orig.clone();
            }
            StructuredBlock {
                kind,
                markdown: render_for_kind(kind, &orig.markdown),
                assets: Vec::new(),
                fragment_count: orig.fragment_count,
            }
        })
        .collect())
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Pdf2MdError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2MdError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, Pdf2MdError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2MdError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetKind, DocumentId};

    struct Failing;

    #[async_trait]
    impl StructureRefiner for Failing {
        async fn refine(&self, _: &[StructuredBlock]) -> Result<Vec<StructuredBlock>, RefineError> {
            Err(RefineError::Timeout { secs: 1 })
        }
    }

    struct DropsEverything;

    #[async_trait]
    impl StructureRefiner for DropsEverything {
        async fn refine(&self, _: &[StructuredBlock]) -> Result<Vec<StructuredBlock>, RefineError> {
            Ok(Vec::new())
        }
    }

    struct DropsAssets;

    #[async_trait]
    impl StructureRefiner for DropsAssets {
        async fn refine(
            &self,
            blocks: &[StructuredBlock],
        ) -> Result<Vec<StructuredBlock>, RefineError> {
            Ok(blocks.iter().filter(|b| b.assets.is_empty()).cloned().collect())
        }
    }

    fn sample() -> Vec<StructuredBlock> {
        let id = AssetId::derive(&DocumentId::new("doc"), 0, AssetKind::Equation, 1);
        vec![
            StructuredBlock::new(BlockKind::Paragraph, "Introduction", 1),
            StructuredBlock::new(BlockKind::Equation, "![Equation 1](assets/x.png)", 1)
                .with_asset(id),
            StructuredBlock::new(BlockKind::Paragraph, "Some exam ple text", 2),
        ]
    }

    fn wire(kind: &str, markdown: &str) -> WireBlock {
        WireBlock {
            kind: kind.into(),
            markdown: markdown.into(),
        }
    }

    #[tokio::test]
    async fn noop_is_identity() {
        let blocks = sample();
        assert_eq!(apply_refiner(&NoopRefiner, 1, blocks.clone()).await, blocks);
    }

    #[tokio::test]
    async fn failures_pass_through() {
        let blocks = sample();
        assert_eq!(apply_refiner(&Failing, 1, blocks.clone()).await, blocks);
        assert_eq!(apply_refiner(&DropsEverything, 1, blocks.clone()).await, blocks);
        assert_eq!(apply_refiner(&DropsAssets, 1, blocks.clone()).await, blocks);
    }

    #[test]
    fn kinds_parse_from_display() {
        for kind in [
            BlockKind::Heading(3),
            BlockKind::Paragraph,
            BlockKind::ListItem,
            BlockKind::TableRow,
            BlockKind::Equation,
            BlockKind::Diagnostic,
        ] {
            assert_eq!(parse_block_kind(&kind.to_string()), Some(kind));
        }
        assert_eq!(parse_block_kind("heading:9"), None);
        assert_eq!(parse_block_kind("sidebar"), None);
    }

    #[test]
    fn merge_retypes_text_blocks_only() {
        let original = sample();
        let answer = vec![
            wire("heading:1", "# Introduction"),
            wire("paragraph", "replaced equation"),
            wire("heading:2", "Some  exam ple\ntext"),
        ];
        let merged = merge_refined(&original, answer).unwrap();
        assert_eq!(merged[0].kind, BlockKind::Heading(1));
        assert_eq!(merged[0].markdown, "# Introduction");
        assert_eq!(merged[1], original[1]);
        assert_eq!(merged[2].kind, BlockKind::Heading(2));
        assert_eq!(merged[2].markdown, "## Some exam ple text");
        assert_eq!(merged[2].fragment_count, 2);
    }

    #[test]
    fn merge_keeps_original_when_text_changes() {
        let original = vec![StructuredBlock::new(
            BlockKind::Paragraph,
            "First finding. Second finding that matters.",
            2,
        )];
        let dropped = merge_refined(&original, vec![wire("heading:1", "First finding.")]).unwrap();
        assert_eq!(dropped, original);
        let reworded = merge_refined(&original, vec![wire("paragraph", "A summary.")]).unwrap();
        assert_eq!(reworded, original);
    }

    #[test]
    fn paragraph_promoted_to_list_item_gets_a_marker() {
        let original = vec![
            StructuredBlock::new(BlockKind::Paragraph, "first step", 1),
            StructuredBlock::new(BlockKind::Paragraph, "2. second step", 1),
        ];
        let answer = vec![wire("list-item", "first step"), wire("list-item", "2. second step")];
        let merged = merge_refined(&original, answer).unwrap();
        assert_eq!(merged[0].markdown, "- first step");
        assert_eq!(merged[1].markdown, "2. second step");
    }

    #[test]
    fn merge_keeps_original_for_unknown_kind() {
        let original = vec![StructuredBlock::new(BlockKind::ListItem, "- item", 1)];
        let merged = merge_refined(&original, vec![wire("sidebar", "- item")]).unwrap();
        assert_eq!(merged, original);
    }

    #[test]
    fn merge_rejects_length_mismatch() {
        let err = merge_refined(&sample(), vec![wire("paragraph", "x")]).unwrap_err();
        assert!(matches!(err, RefineError::Malformed(_)));
    }

    #[test]
    fn merge_keeps_original_when_media_injected() {
        let original = vec![StructuredBlock::new(BlockKind::Paragraph, "plain", 1)];
        let merged = merge_refined(&original, vec![wire("paragraph", "![x](evil.png)")]).unwrap();
        assert_eq!(merged, original);
    }

    #[test]
    fn merge_keeps_confidence_marks() {
        let original = vec![StructuredBlock::new(
            BlockKind::Paragraph,
            "<mark data-ocr-confidence=\"0.10\">blurry</mark>",
            1,
        )];
        let merged = merge_refined(&original, vec![wire("paragraph", "blurry")]).unwrap();
        assert_eq!(merged, original);
    }
}
