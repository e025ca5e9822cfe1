//! Web-search fallback branch.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::{BranchExecutor, BranchPayload, BranchResult, BranchSource, BranchStatus};
use crate::flow::{FlowContext, FlowScope};
use crate::router::{Question, RoutingDecision};
use crate::stores::WebSearch;

/// Web fallback executor. Only constructed when an endpoint is configured.
pub struct WebBranch {
    search: Arc<dyn WebSearch>,
    max_results: usize,
}

impl WebBranch {
    /// Create a new web branch
    pub fn new(search: Arc<dyn WebSearch>, max_results: usize) -> Self {
        Self {
            search,
            max_results,
        }
    }
}

#[async_trait]
impl BranchExecutor for WebBranch {
    fn source(&self) -> BranchSource {
        BranchSource::Web
    }

    async fn execute(
        &self,
        question: &Question,
        _decision: &RoutingDecision,
        flow: &FlowContext,
    ) -> BranchResult {
        let _scope = FlowScope::enter(flow.agent("web_branch"));
        let start = Instant::now();

        let mut result = BranchResult::empty(BranchSource::Web);
        result.attempts.push("web_search".to_string());

        match self.search.search(&question.text, self.max_results).await {
            Ok(hits) if hits.is_empty() => {
                result.status = BranchStatus::Empty;
            }
            Ok(hits) => {
                info!(
                    flow_run_id = %flow.flow_run_id,
                    hits = hits.len(),
                    "Web branch resolved"
                );
                result.status = BranchStatus::Ok;
                result.payload = BranchPayload::Hits(hits);
            }
            Err(e) => {
                warn!(flow_run_id = %flow.flow_run_id, error = %e, "Web search failed");
                result.status = BranchStatus::Error;
                result.message = Some(e.to_string());
            }
        }

        result.elapsed_ms = start.elapsed().as_millis() as u64;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowType;
    use crate::router::{IntentSource, RouteType};
    use crate::stores::{MockWebSearch, WebHit};

    fn decision() -> RoutingDecision {
        RoutingDecision {
            route: RouteType::General,
            country: "GLOBAL".to_string(),
            symbol: None,
            sql_need: true,
            graph_need: true,
            web_allowed: true,
            agents: vec!["web_branch".to_string()],
            intent_source: IntentSource::Heuristic,
        }
    }

    #[tokio::test]
    async fn test_hits_returned() {
        let mut search = MockWebSearch::new();
        search.expect_search().returning(|_, _| {
            Ok(vec![WebHit {
                title: "Markets overnight".to_string(),
                url: "https://example.com/markets".to_string(),
                snippet: "Stocks closed mixed.".to_string(),
            }])
        });

        let branch = WebBranch::new(Arc::new(search), 5);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let result = branch
            .execute(&Question::new("what happened overnight?"), &decision(), &flow)
            .await;

        assert_eq!(result.status, BranchStatus::Ok);
        assert_eq!(result.payload.len(), 1);
        assert_eq!(result.attempts, vec!["web_search".to_string()]);
    }

    #[tokio::test]
    async fn test_search_failure_is_error_status() {
        let mut search = MockWebSearch::new();
        search.expect_search().returning(|_, _| {
            Err(crate::error::StoreError::Web {
                message: "quota exceeded".to_string(),
            })
        });

        let branch = WebBranch::new(Arc::new(search), 5);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let result = branch
            .execute(&Question::new("q"), &decision(), &flow)
            .await;
        assert_eq!(result.status, BranchStatus::Error);
    }
}
