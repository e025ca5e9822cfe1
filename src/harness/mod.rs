//! Regression harness.
//!
//! Replays a fixed set of golden cases through the full pipeline and
//! classifies failures. Each case walks the state machine
//! `pending → executed → evaluated → {passed, failed}`; evaluation runs its
//! checks in a fixed order (schema shape, citation count, freshness, scope,
//! guardrail phrases) and the first failing check names the failure
//! category. An exception inside evaluation becomes `evaluator_error` for
//! that case instead of aborting the run. Cases run sequentially: they
//! share no mutable state and sequential execution keeps cost and
//! evaluation deterministic.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::flow::FlowType;
use crate::gateway::AnswerSource;
use crate::router::{Question, RoutingDecision};
use crate::synthesizer::AnswerResponse;

/// Grounding expectations for one golden case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseExpectation {
    /// Minimum number of citations the answer must carry.
    #[serde(default)]
    pub min_citations: usize,
    /// Case-specific staleness bound in days; falls back to the configured
    /// default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_staleness_days: Option<i64>,
    /// Expected resolved country scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_country: Option<String>,
    /// Phrases that must appear in the answer text (case-insensitive).
    #[serde(default)]
    pub required_phrases: Vec<String>,
    /// Phrases that must not appear in the answer text (case-insensitive).
    #[serde(default)]
    pub forbidden_phrases: Vec<String>,
}

/// A fixed regression fixture. Read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenCase {
    /// Stable case identifier.
    pub id: String,
    /// Question text.
    pub question: String,
    /// Explicit country scope, when the case pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Explicit focus symbol, when the case pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Grounding expectations.
    pub expect: CaseExpectation,
}

impl GoldenCase {
    fn to_question(&self) -> Question {
        let mut question = Question::new(&self.question);
        if let Some(country) = &self.country {
            question = question.with_country(country);
        }
        if let Some(symbol) = &self.symbol {
            question = question.with_symbol(symbol);
        }
        question
    }
}

/// Load golden cases from a JSON fixture file.
pub fn load_cases(path: &Path) -> HarnessResult<Vec<GoldenCase>> {
    let raw = std::fs::read_to_string(path)?;
    let cases: Vec<GoldenCase> = serde_json::from_str(&raw)?;
    if cases.is_empty() {
        return Err(HarnessError::Fixture {
            message: format!("{} contains no cases", path.display()),
        });
    }
    Ok(cases)
}

/// Case lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    /// Not yet executed.
    Pending,
    /// The pipeline produced (or failed to produce) an answer.
    Executed,
    /// Checks ran over the answer.
    Evaluated,
    /// Every check passed.
    Passed,
    /// A check failed or evaluation errored.
    Failed,
}

/// First failing check for a failed case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The answer shape is malformed (empty text or completion).
    SchemaMismatch,
    /// Fewer citations than the case requires.
    CitationMissing,
    /// Evidence older than the staleness bound.
    FreshnessStale,
    /// Resolved scope differs from the expectation.
    ScopeViolation,
    /// A required phrase is missing or a forbidden one is present.
    GuardrailViolation,
    /// The evaluator itself raised.
    EvaluatorError,
}

impl FailureCategory {
    /// Get the category as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::SchemaMismatch => "schema_mismatch",
            FailureCategory::CitationMissing => "citation_missing",
            FailureCategory::FreshnessStale => "freshness_stale",
            FailureCategory::ScopeViolation => "scope_violation",
            FailureCategory::GuardrailViolation => "guardrail_violation",
            FailureCategory::EvaluatorError => "evaluator_error",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-case verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    /// The case this verdict belongs to.
    pub case_id: String,
    /// Terminal state (`passed` or `failed`).
    pub state: CaseState,
    /// Failure category, for failed cases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Citations the answer carried.
    pub citation_count: usize,
    /// Wall-clock time for the case.
    pub elapsed_ms: u64,
}

/// Failing-case debug entry kept in the run report (bounded count).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub case_id: String,
    pub citation_count: usize,
    pub category: FailureCategory,
    pub message: String,
}

/// Aggregated outcome of one regression run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Total cases executed.
    pub total: usize,
    /// Cases that passed every check.
    pub passed: usize,
    /// Cases that failed.
    pub failed: usize,
    /// Per-case verdicts.
    pub results: Vec<CaseResult>,
    /// Bounded failing-case debug entries for triage.
    pub debug_entries: Vec<FailureEntry>,
}

/// Sequential regression runner over an [`AnswerSource`].
pub struct RegressionHarness {
    source: Arc<dyn AnswerSource>,
    config: HarnessConfig,
}

impl RegressionHarness {
    /// Create a harness
    pub fn new(source: Arc<dyn AnswerSource>, config: HarnessConfig) -> Self {
        Self { source, config }
    }

    /// Run all cases sequentially and aggregate the report.
    pub async fn run(&self, cases: &[GoldenCase]) -> RunReport {
        let now = chrono::Utc::now().naive_utc();
        self.run_at(cases, now).await
    }

    /// Run with an explicit "now" for deterministic freshness evaluation.
    pub async fn run_at(&self, cases: &[GoldenCase], now: NaiveDateTime) -> RunReport {
        let mut results = Vec::with_capacity(cases.len());
        let mut debug_entries = Vec::new();

        for case in cases {
            let result = self.run_case(case, now).await;

            if result.state == CaseState::Failed {
                if debug_entries.len() < self.config.max_debug_entries {
                    debug_entries.push(FailureEntry {
                        case_id: result.case_id.clone(),
                        citation_count: result.citation_count,
                        category: result.category.unwrap_or(FailureCategory::EvaluatorError),
                        message: result.message.clone().unwrap_or_default(),
                    });
                } else {
                    warn!(case_id = %result.case_id, "Debug entry cap reached, dropping detail");
                }
            }

            results.push(result);
        }

        let passed = results.iter().filter(|r| r.state == CaseState::Passed).count();
        let report = RunReport {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
            debug_entries,
        };

        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            "Regression run complete"
        );
        report
    }

    async fn run_case(&self, case: &GoldenCase, now: NaiveDateTime) -> CaseResult {
        let started = Instant::now();
        let mut state = CaseState::Pending;
        tracing::debug!(case_id = %case.id, ?state, "Case queued");

        let question = case.to_question();
        let executed = self.source.answer(&question, FlowType::Regression).await;
        state = CaseState::Executed;
        tracing::debug!(case_id = %case.id, ?state, "Case executed");

        let (decision, answer) = match executed {
            Ok(pair) => pair,
            Err(e) => {
                // No answer to evaluate: the schema-shape check fails first.
                warn!(case_id = %case.id, error = %e, "Case execution failed");
                return CaseResult {
                    case_id: case.id.clone(),
                    state: CaseState::Failed,
                    category: Some(FailureCategory::SchemaMismatch),
                    message: Some(format!("execution failed: {}", e)),
                    citation_count: 0,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let citation_count = answer.citations.len();
        let default_staleness_days = self.config.max_staleness_days;
        let verdict = catch_evaluator(&case.id, || {
            evaluate(&answer, &decision, case, now, default_staleness_days)
        });
        state = CaseState::Evaluated;
        tracing::debug!(case_id = %case.id, ?state, "Case evaluated");

        let (state, category, message) = match verdict {
            Ok(None) => (CaseState::Passed, None, None),
            Ok(Some((category, message))) => (CaseState::Failed, Some(category), Some(message)),
            Err(e) => (
                CaseState::Failed,
                Some(FailureCategory::EvaluatorError),
                Some(e.to_string()),
            ),
        };

        info!(
            case_id = %case.id,
            state = ?state,
            category = ?category,
            citations = citation_count,
            "Case evaluated"
        );

        CaseResult {
            case_id: case.id.clone(),
            state,
            category,
            message,
            citation_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Run evaluation, capturing panics as [`HarnessError::Evaluator`].
fn catch_evaluator<T>(
    case_id: &str,
    evaluation: impl FnOnce() -> T + std::panic::UnwindSafe,
) -> Result<T, HarnessError> {
    std::panic::catch_unwind(evaluation).map_err(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        HarnessError::Evaluator {
            case_id: case_id.to_string(),
            message,
        }
    })
}

/// Ordered checks; the first failure names the category.
fn evaluate(
    answer: &AnswerResponse,
    decision: &RoutingDecision,
    case: &GoldenCase,
    now: NaiveDateTime,
    default_staleness_days: i64,
) -> Option<(FailureCategory, String)> {
    // 1. Schema shape.
    if answer.text.trim().is_empty() {
        return Some((
            FailureCategory::SchemaMismatch,
            "answer text is empty".to_string(),
        ));
    }
    if answer.raw_completion.trim().is_empty() {
        return Some((
            FailureCategory::SchemaMismatch,
            "raw completion is empty".to_string(),
        ));
    }

    // 2. Minimum citation count.
    if answer.citations.len() < case.expect.min_citations {
        return Some((
            FailureCategory::CitationMissing,
            format!(
                "expected >= {} citations, found {}",
                case.expect.min_citations,
                answer.citations.len()
            ),
        ));
    }

    // 3. Freshness.
    let staleness_days = case
        .expect
        .max_staleness_days
        .unwrap_or(default_staleness_days);
    match answer.context.latest_timestamp {
        Some(latest) => {
            let age_days = (now - latest).num_days();
            if age_days > staleness_days {
                return Some((
                    FailureCategory::FreshnessStale,
                    format!(
                        "latest evidence is {} days old (bound {})",
                        age_days, staleness_days
                    ),
                ));
            }
        }
        None if case.expect.max_staleness_days.is_some() => {
            return Some((
                FailureCategory::FreshnessStale,
                "no timestamped evidence in context".to_string(),
            ));
        }
        None => {}
    }

    // 4. Scope correctness.
    if let Some(expected) = &case.expect.expected_country {
        if &decision.country != expected {
            return Some((
                FailureCategory::ScopeViolation,
                format!("resolved country {} != expected {}", decision.country, expected),
            ));
        }
    }

    // 5. Guardrail phrases.
    let lowercase = answer.text.to_lowercase();
    for phrase in &case.expect.required_phrases {
        if !lowercase.contains(&phrase.to_lowercase()) {
            return Some((
                FailureCategory::GuardrailViolation,
                format!("required phrase missing: {}", phrase),
            ));
        }
    }
    for phrase in &case.expect.forbidden_phrases {
        if lowercase.contains(&phrase.to_lowercase()) {
            return Some((
                FailureCategory::GuardrailViolation,
                format!("forbidden phrase present: {}", phrase),
            ));
        }
    }

    None
}
