//! Evidence-gathering branches.
//!
//! Every branch — SQL analytics, knowledge graph, web fallback — sits
//! behind the same [`BranchExecutor`] interface and returns the same closed
//! [`BranchResult`] shape, so the context builder and synthesizer never
//! special-case a source. Executors recover their own failures: a store
//! error is folded into the result status, never propagated as an `Err`
//! that could abort the question.

mod graph;
mod sql;
mod web;

pub use graph::GraphBranch;
pub use sql::{QueryTemplate, SqlBranch, TemplateBind, TemplateRegistry};
pub use web::WebBranch;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::flow::FlowContext;
use crate::router::{Question, RoutingDecision};
use crate::stores::{Row, WebHit};

/// Which evidence subsystem produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchSource {
    /// Structured SQL analytics.
    Sql,
    /// Knowledge-graph retrieval.
    Graph,
    /// Web-search fallback.
    Web,
}

impl BranchSource {
    /// Get the source tag as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchSource::Sql => "sql",
            BranchSource::Graph => "graph",
            BranchSource::Web => "web",
        }
    }
}

impl std::fmt::Display for BranchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome classification for a branch run.
///
/// `Degraded` means a best-effort result was produced with missing inputs
/// or filters; `Error` is reserved for exceptions from the underlying
/// store (after all fallback candidates were exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    /// Evidence produced with the full intended filters.
    Ok,
    /// The branch ran but found nothing.
    Empty,
    /// Best-effort evidence with missing inputs or filters.
    Degraded,
    /// The underlying store failed after all candidates were tried.
    Error,
}

impl BranchStatus {
    /// Whether the branch produced usable evidence
    pub fn has_evidence(&self) -> bool {
        matches!(self, BranchStatus::Ok | BranchStatus::Degraded)
    }
}

/// A graph passage after timestamp normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedPassage {
    /// Graph node identifier (citation anchor).
    pub node_id: String,
    /// Passage text.
    pub text: String,
    /// Source document or feed, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// UTC-naive timestamp, when the store supplied one that parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<NaiveDateTime>,
}

/// Evidence payload, one variant per source family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum BranchPayload {
    /// SQL result rows.
    Rows(Vec<Row>),
    /// Normalized graph passages.
    Passages(Vec<NormalizedPassage>),
    /// Web search hits.
    Hits(Vec<WebHit>),
    /// No payload (empty or failed branch).
    None,
}

impl BranchPayload {
    /// Number of evidence items carried
    pub fn len(&self) -> usize {
        match self {
            BranchPayload::Rows(rows) => rows.len(),
            BranchPayload::Passages(passages) => passages.len(),
            BranchPayload::Hits(hits) => hits.len(),
            BranchPayload::None => 0,
        }
    }

    /// Whether the payload carries nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The outcome of one branch execution for one question.
///
/// At most one exists per (question, source). `attempts` records every
/// target tried, in order, so fallback chains stay diagnosable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    /// Which subsystem ran.
    pub source: BranchSource,
    /// Outcome classification.
    pub status: BranchStatus,
    /// Evidence payload.
    pub payload: BranchPayload,
    /// Every target attempted, in order (template ids, graph endpoints).
    pub attempts: Vec<String>,
    /// Filters actually applied to the evidence.
    pub filters: BTreeMap<String, String>,
    /// Wall-clock execution time.
    pub elapsed_ms: u64,
    /// Degradation or error detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BranchResult {
    /// Create an empty result shell for a source
    pub fn empty(source: BranchSource) -> Self {
        Self {
            source,
            status: BranchStatus::Empty,
            payload: BranchPayload::None,
            attempts: Vec::new(),
            filters: BTreeMap::new(),
            elapsed_ms: 0,
            message: None,
        }
    }

    /// Create a timeout result, used when a branch exceeded its budget
    pub fn timed_out(source: BranchSource, timeout_ms: u64) -> Self {
        Self {
            source,
            status: BranchStatus::Degraded,
            payload: BranchPayload::None,
            attempts: Vec::new(),
            filters: BTreeMap::new(),
            elapsed_ms: timeout_ms,
            message: Some(format!("timed out after {}ms", timeout_ms)),
        }
    }
}

/// Uniform interface over evidence branches.
#[async_trait]
pub trait BranchExecutor: Send + Sync {
    /// The source this executor feeds.
    fn source(&self) -> BranchSource;

    /// Gather evidence for a routed question.
    ///
    /// Never fails outright; store problems surface in the result status.
    async fn execute(
        &self,
        question: &Question,
        decision: &RoutingDecision,
        flow: &FlowContext,
    ) -> BranchResult;
}
