//! Per-invocation flow/trace context.
//!
//! A [`FlowContext`] is created once at the top of a pipeline invocation and
//! cloned into every nested agent call. Callees read it but never rewrite
//! it; each nested agent derived via [`FlowContext::agent`] gets the next
//! monotonic `trace_order` from a counter shared across the whole
//! invocation, including concurrently spawned branch tasks. [`FlowScope`]
//! guarantees a teardown log on every exit path, including errors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

/// The kind of flow a pipeline invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// A live question/answer invocation.
    Answer,
    /// An offline regression-harness invocation.
    Regression,
}

impl FlowType {
    /// Get the flow type as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Answer => "answer",
            FlowType::Regression => "regression",
        }
    }
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request-scoped trace context propagated through nested agent calls.
#[derive(Debug, Clone, Serialize)]
pub struct FlowContext {
    /// The kind of flow this invocation belongs to.
    pub flow_type: FlowType,
    /// Identifier shared by every agent call within one invocation.
    pub flow_run_id: String,
    /// Name of the agent this context instance belongs to.
    pub agent_name: String,
    /// Monotonic position of this agent within the invocation.
    pub trace_order: u32,
    #[serde(skip_serializing)]
    counter: Arc<AtomicU32>,
}

impl FlowContext {
    /// Create the root context at a flow entry point.
    pub fn new(flow_type: FlowType, entry_agent: impl Into<String>) -> Self {
        Self {
            flow_type,
            flow_run_id: Uuid::new_v4().to_string(),
            agent_name: entry_agent.into(),
            trace_order: 0,
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Derive a child context for a nested agent call.
    ///
    /// The child shares the run id and increments the invocation-wide trace
    /// counter; safe to call from concurrently spawned branch tasks.
    pub fn agent(&self, name: impl Into<String>) -> Self {
        Self {
            flow_type: self.flow_type,
            flow_run_id: self.flow_run_id.clone(),
            agent_name: name.into(),
            trace_order: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
            counter: Arc::clone(&self.counter),
        }
    }

    /// Number of agent calls derived so far in this invocation.
    pub fn agents_spawned(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Scoped guard around one agent's work within a flow.
///
/// Logs entry on construction and teardown (with latency) when dropped,
/// which happens on success, `?`-propagated errors, and panics alike.
pub struct FlowScope {
    ctx: FlowContext,
    started: Instant,
}

impl FlowScope {
    /// Enter an agent scope.
    pub fn enter(ctx: FlowContext) -> Self {
        debug!(
            flow_type = %ctx.flow_type,
            flow_run_id = %ctx.flow_run_id,
            agent = %ctx.agent_name,
            trace_order = ctx.trace_order,
            "Agent scope entered"
        );
        Self {
            ctx,
            started: Instant::now(),
        }
    }

    /// Access the wrapped context.
    pub fn ctx(&self) -> &FlowContext {
        &self.ctx
    }
}

impl Drop for FlowScope {
    fn drop(&mut self) {
        info!(
            flow_type = %self.ctx.flow_type,
            flow_run_id = %self.ctx.flow_run_id,
            agent = %self.ctx.agent_name,
            trace_order = self.ctx.trace_order,
            latency_ms = self.started.elapsed().as_millis() as u64,
            "Agent scope torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_type_as_str() {
        assert_eq!(FlowType::Answer.as_str(), "answer");
        assert_eq!(FlowType::Regression.as_str(), "regression");
    }

    #[test]
    fn test_root_context_starts_at_zero() {
        let ctx = FlowContext::new(FlowType::Answer, "answer_pipeline");
        assert_eq!(ctx.trace_order, 0);
        assert_eq!(ctx.agent_name, "answer_pipeline");
        assert_eq!(ctx.agents_spawned(), 0);
    }

    #[test]
    fn test_child_contexts_increment_monotonically() {
        let root = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let a = root.agent("router_intent_classifier");
        let b = root.agent("sql_branch");
        let c = a.agent("supervisor_synthesizer");

        assert_eq!(a.trace_order, 1);
        assert_eq!(b.trace_order, 2);
        assert_eq!(c.trace_order, 3);
        assert_eq!(root.agents_spawned(), 3);
    }

    #[test]
    fn test_children_share_run_id() {
        let root = FlowContext::new(FlowType::Regression, "harness");
        let child = root.agent("sql_branch");
        let grandchild = child.agent("supervisor_synthesizer");

        assert_eq!(root.flow_run_id, child.flow_run_id);
        assert_eq!(root.flow_run_id, grandchild.flow_run_id);
    }

    #[test]
    fn test_distinct_invocations_have_distinct_run_ids() {
        let a = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let b = FlowContext::new(FlowType::Answer, "answer_pipeline");
        assert_ne!(a.flow_run_id, b.flow_run_id);
    }

    #[test]
    fn test_concurrent_children_get_unique_orders() {
        let root = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let mut handles = Vec::new();
        for i in 0..8 {
            let ctx = root.clone();
            handles.push(std::thread::spawn(move || {
                ctx.agent(format!("branch-{}", i)).trace_order
            }));
        }
        let mut orders: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        orders.sort_unstable();
        orders.dedup();
        assert_eq!(orders.len(), 8);
        assert_eq!(root.agents_spawned(), 8);
    }

    #[test]
    fn test_flow_scope_drops_without_panic() {
        let ctx = FlowContext::new(FlowType::Answer, "answer_pipeline");
        {
            let scope = FlowScope::enter(ctx.agent("sql_branch"));
            assert_eq!(scope.ctx().agent_name, "sql_branch");
        }
        // Guard dropped here; teardown ran on scope exit.
        assert_eq!(ctx.agents_spawned(), 1);
    }

    #[test]
    fn test_flow_context_serializes_without_counter() {
        let ctx = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["flow_type"], "answer");
        assert_eq!(json["agent_name"], "answer_pipeline");
        assert!(json.get("counter").is_none());
    }
}
