//! Answer pipeline.
//!
//! Orchestrates one question end to end: Router → parallel branch
//! executors → Structured Data Builder → Context Budgeter → Supervisor
//! Synthesizer, with the flow context threaded through every stage.
//! Branches marked needed by the routing decision run concurrently, each
//! under its own timeout; a branch that exceeds the budget contributes a
//! degraded result instead of blocking the question. When a conservative
//! route skipped the graph branch and the SQL branch came back empty or
//! degraded, the pipeline escalates and runs the graph branch after all.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::branches::{BranchExecutor, BranchResult, BranchSource, BranchStatus};
use crate::config::BranchConfig;
use crate::context::{ContextBudgeter, ContextBuilder, StructuredDataContext};
use crate::error::SynthesisResult;
use crate::flow::{FlowContext, FlowScope, FlowType};
use crate::router::{Question, Router, RoutingDecision};
use crate::synthesizer::{AnswerResponse, Synthesizer};

/// The full retrieval-and-synthesis pipeline for one deployment.
pub struct AnswerPipeline {
    router: Router,
    sql: Option<Arc<dyn BranchExecutor>>,
    graph: Option<Arc<dyn BranchExecutor>>,
    web: Option<Arc<dyn BranchExecutor>>,
    builder: ContextBuilder,
    budgeter: ContextBudgeter,
    synthesizer: Synthesizer,
    branch_timeout_ms: u64,
}

impl AnswerPipeline {
    /// Assemble a pipeline from its stages and the available branch executors.
    pub fn new(
        router: Router,
        branches: Vec<Arc<dyn BranchExecutor>>,
        builder: ContextBuilder,
        budgeter: ContextBudgeter,
        synthesizer: Synthesizer,
        branch_config: &BranchConfig,
    ) -> Self {
        let mut sql = None;
        let mut graph = None;
        let mut web = None;
        for executor in branches {
            match executor.source() {
                BranchSource::Sql => sql = Some(executor),
                BranchSource::Graph => graph = Some(executor),
                BranchSource::Web => web = Some(executor),
            }
        }

        Self {
            router,
            sql,
            graph,
            web,
            builder,
            budgeter,
            synthesizer,
            branch_timeout_ms: branch_config.timeout_ms,
        }
    }

    /// Answer a question end to end.
    ///
    /// Returns the routing decision alongside the answer so callers (and
    /// the regression harness) can verify scope resolution.
    pub async fn answer(
        &self,
        question: &Question,
        flow_type: FlowType,
    ) -> SynthesisResult<(RoutingDecision, AnswerResponse)> {
        let root = FlowContext::new(flow_type, "answer_pipeline");
        let scope = FlowScope::enter(root);
        let flow = scope.ctx();

        let decision = self.router.route(question, flow).await;
        let (ctx, _results) = self.gather_context(question, &decision, flow).await;

        let answer = self
            .synthesizer
            .synthesize(question, &decision, &ctx, flow)
            .await?;

        Ok((decision, answer))
    }

    /// Run the needed branches and build the budgeted context.
    ///
    /// Exposed so offline callers can inspect raw branch results.
    pub async fn gather_context(
        &self,
        question: &Question,
        decision: &RoutingDecision,
        flow: &FlowContext,
    ) -> (StructuredDataContext, Vec<BranchResult>) {
        let mut selected: Vec<Arc<dyn BranchExecutor>> = Vec::new();
        if decision.sql_need {
            if let Some(sql) = &self.sql {
                selected.push(Arc::clone(sql));
            }
        }
        if decision.graph_need {
            if let Some(graph) = &self.graph {
                selected.push(Arc::clone(graph));
            }
        }
        if decision.web_allowed {
            if let Some(web) = &self.web {
                selected.push(Arc::clone(web));
            }
        }

        let mut results = self.run_branches(question, decision, flow, selected).await;

        // Escalation: conservative routes skip the graph branch to bound
        // cost; an empty or degraded SQL result reopens it.
        if !decision.graph_need {
            let sql_unusable = results
                .iter()
                .find(|r| r.source == BranchSource::Sql)
                .map(|r| {
                    r.status == BranchStatus::Empty
                        || r.status == BranchStatus::Error
                        || (r.status == BranchStatus::Degraded && r.payload.is_empty())
                })
                .unwrap_or(false);

            if sql_unusable {
                if let Some(graph) = &self.graph {
                    info!(
                        flow_run_id = %flow.flow_run_id,
                        "SQL branch unusable, escalating to graph branch"
                    );
                    let escalated = self
                        .run_branches(question, decision, flow, vec![Arc::clone(graph)])
                        .await;
                    results.extend(escalated);
                }
            }
        }

        let ctx = self.builder.build(decision, &results);
        let ctx = self.budgeter.apply(ctx);
        (ctx, results)
    }

    /// Spawn the selected branches concurrently, each under the per-branch
    /// timeout, and wait for all of them.
    async fn run_branches(
        &self,
        question: &Question,
        decision: &RoutingDecision,
        flow: &FlowContext,
        selected: Vec<Arc<dyn BranchExecutor>>,
    ) -> Vec<BranchResult> {
        let timeout_ms = self.branch_timeout_ms;

        let tasks: Vec<_> = selected
            .into_iter()
            .map(|executor| {
                let question = question.clone();
                let decision = decision.clone();
                // Spawned branch tasks inherit the invocation's flow context.
                let flow = flow.clone();
                tokio::spawn(async move {
                    let source = executor.source();
                    match tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        executor.execute(&question, &decision, &flow),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(
                                flow_run_id = %flow.flow_run_id,
                                source = %source,
                                timeout_ms,
                                "Branch timed out"
                            );
                            BranchResult::timed_out(source, timeout_ms)
                        }
                    }
                })
            })
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(error = %e, "Branch task failed to join");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::branches::BranchPayload;
    use crate::config::{ContextConfig, InferenceConfig, RoutingConfig};
    use crate::inference::InferenceClient;
    use crate::router::{IntentSource, RouteType};
    use crate::stores::Row;

    /// Branch stub with a canned result, optional delay, and a call flag.
    struct StubBranch {
        source: BranchSource,
        status: BranchStatus,
        rows: usize,
        delay_ms: u64,
        invoked: Arc<AtomicBool>,
    }

    impl StubBranch {
        fn new(source: BranchSource, status: BranchStatus, rows: usize) -> (Self, Arc<AtomicBool>) {
            let invoked = Arc::new(AtomicBool::new(false));
            (
                Self {
                    source,
                    status,
                    rows,
                    delay_ms: 0,
                    invoked: Arc::clone(&invoked),
                },
                invoked,
            )
        }

        fn with_delay(mut self, delay_ms: u64) -> Self {
            self.delay_ms = delay_ms;
            self
        }
    }

    #[async_trait]
    impl BranchExecutor for StubBranch {
        fn source(&self) -> BranchSource {
            self.source
        }

        async fn execute(
            &self,
            _question: &Question,
            _decision: &RoutingDecision,
            flow: &FlowContext,
        ) -> BranchResult {
            let _agent = flow.agent(format!("{}_branch", self.source));
            self.invoked.store(true, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let rows: Vec<Row> = (0..self.rows)
                .map(|i| {
                    Row::from_pairs([
                        ("period", serde_json::json!(format!("2025-{:02}-01", i + 1))),
                        ("avg_price", serde_json::json!(100.0 + i as f64)),
                    ])
                })
                .collect();
            BranchResult {
                source: self.source,
                status: self.status,
                payload: if rows.is_empty() {
                    BranchPayload::None
                } else {
                    BranchPayload::Rows(rows)
                },
                attempts: vec![format!("{}_stub", self.source)],
                filters: BTreeMap::new(),
                elapsed_ms: self.delay_ms,
                message: None,
            }
        }
    }

    fn pipeline_with(branches: Vec<Arc<dyn BranchExecutor>>, timeout_ms: u64) -> AnswerPipeline {
        let inference = InferenceClient::new(&InferenceConfig {
            api_key: "test-key".to_string(),
            ..InferenceConfig::default()
        })
        .unwrap();
        AnswerPipeline::new(
            Router::new(inference.clone(), RoutingConfig::default()),
            branches,
            ContextBuilder::new(ContextConfig::default()),
            ContextBudgeter::new(6000),
            Synthesizer::new(inference, ContextConfig::default()),
            &BranchConfig { timeout_ms },
        )
    }

    fn decision(route: RouteType, graph_need: bool) -> RoutingDecision {
        RoutingDecision {
            route,
            country: "KR".to_string(),
            symbol: None,
            sql_need: true,
            graph_need,
            web_allowed: false,
            agents: vec![],
            intent_source: IntentSource::Heuristic,
        }
    }

    #[tokio::test]
    async fn test_graph_not_invoked_when_not_needed() {
        let (sql, _) = StubBranch::new(BranchSource::Sql, BranchStatus::Ok, 4);
        let (graph, graph_invoked) = StubBranch::new(BranchSource::Graph, BranchStatus::Ok, 0);

        let pipeline = pipeline_with(vec![Arc::new(sql), Arc::new(graph)], 1000);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices in seoul");
        let decision = decision(RouteType::RealEstateDetail, false);

        let (ctx, results) = pipeline.gather_context(&question, &decision, &flow).await;

        assert!(!graph_invoked.load(Ordering::SeqCst));
        assert_eq!(results.len(), 1);
        // Attempted-targets log shows only the SQL branch ran.
        assert!(ctx.attempted.contains_key("sql"));
        assert!(!ctx.attempted.contains_key("graph"));
    }

    #[tokio::test]
    async fn test_empty_sql_escalates_to_graph() {
        let (sql, _) = StubBranch::new(BranchSource::Sql, BranchStatus::Empty, 0);
        let (graph, graph_invoked) = StubBranch::new(BranchSource::Graph, BranchStatus::Ok, 2);

        let pipeline = pipeline_with(vec![Arc::new(sql), Arc::new(graph)], 1000);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices in seoul");
        let decision = decision(RouteType::RealEstateDetail, false);

        let (ctx, results) = pipeline.gather_context(&question, &decision, &flow).await;

        assert!(graph_invoked.load(Ordering::SeqCst));
        assert_eq!(results.len(), 2);
        assert!(ctx.attempted.contains_key("graph"));
    }

    #[tokio::test]
    async fn test_successful_sql_does_not_escalate() {
        let (sql, _) = StubBranch::new(BranchSource::Sql, BranchStatus::Ok, 4);
        let (graph, graph_invoked) = StubBranch::new(BranchSource::Graph, BranchStatus::Ok, 2);

        let pipeline = pipeline_with(vec![Arc::new(sql), Arc::new(graph)], 1000);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, false);

        pipeline.gather_context(&question, &decision, &flow).await;
        assert!(!graph_invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_slow_branch_times_out_to_degraded() {
        let (sql, _) = StubBranch::new(BranchSource::Sql, BranchStatus::Ok, 4);
        let sql = sql.with_delay(300);

        let pipeline = pipeline_with(vec![Arc::new(sql)], 50);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, true);

        let (_, results) = pipeline.gather_context(&question, &decision, &flow).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, BranchStatus::Degraded);
        assert!(results[0].message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_branches_run_concurrently() {
        // Two branches sleeping 80ms each; concurrent execution finishes
        // well under the serial 160ms.
        let (sql, _) = StubBranch::new(BranchSource::Sql, BranchStatus::Ok, 2);
        let (graph, _) = StubBranch::new(BranchSource::Graph, BranchStatus::Ok, 0);
        let sql = sql.with_delay(80);
        let graph = graph.with_delay(80);

        let pipeline = pipeline_with(vec![Arc::new(sql), Arc::new(graph)], 1000);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("anything");
        let decision = decision(RouteType::General, true);

        let started = std::time::Instant::now();
        let (_, results) = pipeline.gather_context(&question, &decision, &flow).await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 2);
        assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_branch_results_share_flow_run_id() {
        // Branch tasks inherit the invocation flow; both derive agents from
        // the same counter, so agent count reflects every branch.
        let (sql, _) = StubBranch::new(BranchSource::Sql, BranchStatus::Ok, 1);
        let (graph, _) = StubBranch::new(BranchSource::Graph, BranchStatus::Ok, 1);

        let pipeline = pipeline_with(vec![Arc::new(sql), Arc::new(graph)], 1000);
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("anything");
        let decision = decision(RouteType::General, true);

        pipeline.gather_context(&question, &decision, &flow).await;
        // Both branch tasks derived their agent from this invocation's
        // shared counter: same flow_run_id, distinct trace orders.
        assert_eq!(flow.agents_spawned(), 2);
    }
}
