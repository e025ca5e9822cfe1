//! Knowledge-graph evidence branch.
//!
//! Retrieval is read-only; passage timestamps arrive in whatever form the
//! store emits and are normalized to UTC-naive here, before any freshness
//! math downstream.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::{BranchExecutor, BranchPayload, BranchResult, BranchSource, BranchStatus, NormalizedPassage};
use crate::flow::{FlowContext, FlowScope};
use crate::router::{Question, RoutingDecision};
use crate::stores::{coerce_utc_naive, GraphStore};

/// Graph branch executor.
pub struct GraphBranch {
    store: Arc<dyn GraphStore>,
    top_k: usize,
}

impl GraphBranch {
    /// Create a new graph branch
    pub fn new(store: Arc<dyn GraphStore>, top_k: usize) -> Self {
        Self { store, top_k }
    }
}

#[async_trait]
impl BranchExecutor for GraphBranch {
    fn source(&self) -> BranchSource {
        BranchSource::Graph
    }

    async fn execute(
        &self,
        question: &Question,
        decision: &RoutingDecision,
        flow: &FlowContext,
    ) -> BranchResult {
        let _scope = FlowScope::enter(flow.agent("graph_branch"));
        let start = Instant::now();

        let mut result = BranchResult::empty(BranchSource::Graph);
        let target = format!("graph:{}", decision.country);
        result.attempts.push(target);
        result
            .filters
            .insert("country".to_string(), decision.country.clone());

        match self
            .store
            .retrieve(&question.text, &decision.country, self.top_k)
            .await
        {
            Ok(passages) if passages.is_empty() => {
                result.status = BranchStatus::Empty;
            }
            Ok(passages) => {
                let normalized: Vec<NormalizedPassage> = passages
                    .into_iter()
                    .map(|p| {
                        let timestamp = p.timestamp.as_ref().and_then(|t| {
                            coerce_utc_naive(t)
                                .map_err(|e| {
                                    warn!(
                                        node_id = %p.node_id,
                                        error = %e,
                                        "Dropping unparseable passage timestamp"
                                    );
                                    e
                                })
                                .ok()
                        });
                        NormalizedPassage {
                            node_id: p.node_id,
                            text: p.text,
                            source: p.source,
                            timestamp,
                        }
                    })
                    .collect();

                info!(
                    flow_run_id = %flow.flow_run_id,
                    passages = normalized.len(),
                    country = %decision.country,
                    "Graph branch resolved"
                );
                result.status = BranchStatus::Ok;
                result.payload = BranchPayload::Passages(normalized);
            }
            Err(e) => {
                warn!(flow_run_id = %flow.flow_run_id, error = %e, "Graph retrieval failed");
                result.status = BranchStatus::Error;
                result.message = Some(e.to_string());
            }
        }

        result.elapsed_ms = start.elapsed().as_millis() as u64;
        result
    }
}
