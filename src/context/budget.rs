//! Context budgeter.
//!
//! Trims an oversized [`StructuredDataContext`] to a target rendered size
//! with staged reduction: long-form narrative goes first, numeric sample
//! rows second, and only then is remaining overflow summarized by
//! truncation. Citation-bearing fields (dataset names and filters, graph
//! node ids, web URLs) are the last thing touched and are never silently
//! dropped. Trimming is deterministic: identical input and budget always
//! yield byte-identical output.

use tracing::debug;

use super::StructuredDataContext;
use crate::config::ContextConfig;

/// First-stage cap on passage text length.
const PASSAGE_TRIM_CHARS: usize = 240;
/// Final-stage cap on passage text length.
const PASSAGE_SUMMARY_CHARS: usize = 80;
/// Sample-row floor below which rows are not truncated further.
const MIN_SAMPLE_ROWS: usize = 2;

/// Deterministic staged reducer for structured contexts.
#[derive(Debug, Clone)]
pub struct ContextBudgeter {
    max_chars: usize,
}

impl ContextBudgeter {
    /// Create a budgeter with an explicit budget
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Create a budgeter from context configuration
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            max_chars: config.max_chars,
        }
    }

    /// The configured budget in characters
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Reduce the context until its rendered form fits the budget.
    pub fn apply(&self, mut ctx: StructuredDataContext) -> StructuredDataContext {
        ctx.recompute_size();
        if ctx.size_estimate <= self.max_chars {
            return ctx;
        }
        let original = ctx.size_estimate;

        // Stage 1: narrative first. Web snippets go entirely (title and URL
        // keep the citation); passage texts get a first-stage cap.
        for hit in &mut ctx.web_hits {
            hit.snippet.clear();
        }
        for passage in &mut ctx.passages {
            passage.text = truncate_at_word(&passage.text, PASSAGE_TRIM_CHARS);
        }
        ctx.recompute_size();
        if ctx.size_estimate <= self.max_chars {
            debug!(original, reduced = ctx.size_estimate, stage = 1, "Context budgeted");
            return ctx;
        }

        // Stage 2: shrink numeric samples stepwise down to the floor.
        let mut cap = ctx
            .datasets
            .iter()
            .map(|d| d.sample_rows.len())
            .max()
            .unwrap_or(0);
        while cap > MIN_SAMPLE_ROWS && ctx.size_estimate > self.max_chars {
            cap -= 1;
            for dataset in &mut ctx.datasets {
                dataset.sample_rows.truncate(cap);
            }
            ctx.recompute_size();
        }
        if ctx.size_estimate <= self.max_chars {
            debug!(original, reduced = ctx.size_estimate, stage = 2, "Context budgeted");
            return ctx;
        }

        // Stage 3: summarize what remains. Citation anchors survive: every
        // passage keeps its node id, every hit its URL, every dataset its
        // name, filters, and signals.
        for passage in &mut ctx.passages {
            passage.text = truncate_at_word(&passage.text, PASSAGE_SUMMARY_CHARS);
        }
        for dataset in &mut ctx.datasets {
            dataset.sample_rows.truncate(1);
        }
        ctx.recompute_size();

        debug!(original, reduced = ctx.size_estimate, stage = 3, "Context budgeted");
        ctx
    }
}

/// Truncate text at a word boundary, appending an ellipsis marker.
fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    let cut = prefix.rfind(char::is_whitespace).unwrap_or(prefix.len());
    let mut out = prefix[..cut].trim_end().to_string();
    out.push('…');
    out
}
