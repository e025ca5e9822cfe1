//! SQL evidence branch.
//!
//! Template selection is prioritized, not first-match: candidates are
//! ranked against the resolved country, focus symbol, and route-selected
//! dataset kind, and a top-ranked template that returns zero rows falls
//! through to the next-ranked one. Every attempted target is recorded in
//! the result for diagnosability. A candidate that cannot apply the
//! decision's country filter still runs as a best-effort default, but the
//! result is demoted to `degraded`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{BranchExecutor, BranchPayload, BranchResult, BranchSource, BranchStatus};
use crate::flow::{FlowContext, FlowScope};
use crate::router::{DatasetKind, Question, RoutingDecision};
use crate::stores::SqlStore;

/// Bind slot within a query template, resolved from the routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateBind {
    /// Bind the resolved country scope.
    Country,
    /// Bind the focus symbol.
    Symbol,
}

/// A ranked SQL query template.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    /// Unique template identifier, recorded in `attempts`.
    pub id: String,
    /// Dataset family this template serves.
    pub kind: DatasetKind,
    /// Market specialization; `None` means the template is market-generic.
    pub country: Option<String>,
    /// Ordered binds for the `?` placeholders in `sql`.
    pub binds: Vec<TemplateBind>,
    /// Whether the result set is country-filtered (via specialization or a
    /// country bind). Unfiltered templates run as a degraded default.
    pub country_filtered: bool,
    /// The query text.
    pub sql: String,
}

impl QueryTemplate {
    fn requires_symbol(&self) -> bool {
        self.binds.contains(&TemplateBind::Symbol)
    }

    /// Rank this template against a routing decision.
    ///
    /// Returns `None` when the template cannot serve the decision at all
    /// (wrong market, or a symbol bind with no symbol available).
    fn score(&self, decision: &RoutingDecision, kind: DatasetKind) -> Option<u32> {
        let mut score = 0u32;

        if self.kind == kind {
            score += 8;
        } else if self.kind == DatasetKind::General {
            score += 1;
        } else {
            return None;
        }

        match &self.country {
            Some(market) if market == &decision.country => score += 4,
            Some(_) => return None,
            None => score += 1,
        }

        if self.requires_symbol() {
            if decision.symbol.is_none() {
                return None;
            }
            score += 2;
        }

        Some(score)
    }
}

/// Registry of SQL query templates.
///
/// Built-in templates are registered on creation; collectors may register
/// additional ones at runtime as new source tables come online.
pub struct TemplateRegistry {
    templates: RwLock<Vec<QueryTemplate>>,
}

impl TemplateRegistry {
    /// Create a registry with the built-in templates.
    pub fn new() -> Self {
        let registry = Self {
            templates: RwLock::new(Vec::new()),
        };
        registry.register_builtins();
        registry
    }

    /// Create an empty registry (tests and fixtures).
    pub fn empty() -> Self {
        Self {
            templates: RwLock::new(Vec::new()),
        }
    }

    /// Register a template.
    ///
    /// # Errors
    /// Returns error if the id is empty or already taken.
    pub fn register(&self, template: QueryTemplate) -> Result<(), String> {
        if template.id.is_empty() {
            return Err("Template ID is required".to_string());
        }
        if template.sql.is_empty() {
            return Err("Template SQL is required".to_string());
        }

        let mut templates = self.templates.write().unwrap();
        if templates.iter().any(|t| t.id == template.id) {
            return Err(format!("Template '{}' already exists", template.id));
        }

        templates.push(template);
        Ok(())
    }

    /// Rank candidates for a decision, best first. Ties keep registration order.
    pub fn candidates(&self, decision: &RoutingDecision, kind: DatasetKind) -> Vec<QueryTemplate> {
        let templates = self.templates.read().unwrap();
        let mut scored: Vec<(u32, usize, QueryTemplate)> = templates
            .iter()
            .enumerate()
            .filter_map(|(idx, t)| t.score(decision, kind).map(|s| (s, idx, t.clone())))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, _, t)| t).collect()
    }

    /// Number of registered templates.
    pub fn count(&self) -> usize {
        self.templates.read().unwrap().len()
    }

    fn register_builtins(&self) {
        let builtins = [
            QueryTemplate {
                id: "kr_apt_price_monthly".to_string(),
                kind: DatasetKind::RealEstate,
                country: Some("KR".to_string()),
                binds: vec![],
                country_filtered: true,
                sql: "SELECT region_code, period, avg_price, deal_count \
                      FROM apt_price_monthly ORDER BY period DESC LIMIT 24"
                    .to_string(),
            },
            QueryTemplate {
                id: "re_price_index_by_country".to_string(),
                kind: DatasetKind::RealEstate,
                country: None,
                binds: vec![TemplateBind::Country],
                country_filtered: true,
                sql: "SELECT country, period, price_index \
                      FROM re_price_index WHERE country = ? ORDER BY period DESC LIMIT 24"
                    .to_string(),
            },
            QueryTemplate {
                id: "re_price_index_global".to_string(),
                kind: DatasetKind::RealEstate,
                country: None,
                binds: vec![],
                country_filtered: false,
                sql: "SELECT country, period, price_index \
                      FROM re_price_index ORDER BY period DESC LIMIT 48"
                    .to_string(),
            },
            QueryTemplate {
                id: "us_equity_daily_by_symbol".to_string(),
                kind: DatasetKind::Equity,
                country: Some("US".to_string()),
                binds: vec![TemplateBind::Symbol],
                country_filtered: true,
                sql: "SELECT symbol, trade_date, close_price, volume \
                      FROM us_equity_daily WHERE symbol = ? ORDER BY trade_date DESC LIMIT 60"
                    .to_string(),
            },
            QueryTemplate {
                id: "kr_equity_daily_by_symbol".to_string(),
                kind: DatasetKind::Equity,
                country: Some("KR".to_string()),
                binds: vec![TemplateBind::Symbol],
                country_filtered: true,
                sql: "SELECT symbol, trade_date, close_price, volume \
                      FROM kr_equity_daily WHERE symbol = ? ORDER BY trade_date DESC LIMIT 60"
                    .to_string(),
            },
            QueryTemplate {
                id: "macro_indicator_monthly".to_string(),
                kind: DatasetKind::Macro,
                country: None,
                binds: vec![TemplateBind::Country],
                country_filtered: true,
                sql: "SELECT country, indicator, period, value \
                      FROM macro_indicator_monthly WHERE country = ? \
                      ORDER BY period DESC LIMIT 36"
                    .to_string(),
            },
            QueryTemplate {
                id: "market_summary_daily".to_string(),
                kind: DatasetKind::General,
                country: None,
                binds: vec![],
                country_filtered: false,
                sql: "SELECT market, trade_date, index_value, change_pct \
                      FROM market_summary_daily ORDER BY trade_date DESC LIMIT 20"
                    .to_string(),
            },
        ];

        for template in builtins {
            let id = template.id.clone();
            if let Err(e) = self.register(template) {
                warn!(template = %id, error = %e, "Failed to register builtin template");
            }
        }
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// SQL branch executor with prioritized template fallback.
pub struct SqlBranch {
    store: Arc<dyn SqlStore>,
    registry: Arc<TemplateRegistry>,
}

impl SqlBranch {
    /// Create a new SQL branch
    pub fn new(store: Arc<dyn SqlStore>, registry: Arc<TemplateRegistry>) -> Self {
        Self { store, registry }
    }

    fn resolve_binds(
        template: &QueryTemplate,
        decision: &RoutingDecision,
    ) -> (Vec<String>, BTreeMap<String, String>) {
        let mut binds = Vec::new();
        let mut filters = BTreeMap::new();
        for bind in &template.binds {
            match bind {
                TemplateBind::Country => {
                    binds.push(decision.country.clone());
                    filters.insert("country".to_string(), decision.country.clone());
                }
                TemplateBind::Symbol => {
                    // Candidates without a symbol were filtered out in ranking.
                    let symbol = decision.symbol.clone().unwrap_or_default();
                    filters.insert("symbol".to_string(), symbol.clone());
                    binds.push(symbol);
                }
            }
        }
        if template.country.is_some() {
            filters.insert("country".to_string(), decision.country.clone());
        }
        (binds, filters)
    }
}

#[async_trait]
impl BranchExecutor for SqlBranch {
    fn source(&self) -> BranchSource {
        BranchSource::Sql
    }

    async fn execute(
        &self,
        _question: &Question,
        decision: &RoutingDecision,
        flow: &FlowContext,
    ) -> BranchResult {
        let _scope = FlowScope::enter(flow.agent("sql_branch"));
        let start = Instant::now();

        let kind = decision.route.profile().dataset_kind;
        let candidates = self.registry.candidates(decision, kind);

        let mut result = BranchResult::empty(BranchSource::Sql);
        let mut store_errors: Vec<String> = Vec::new();

        if candidates.is_empty() {
            result.status = BranchStatus::Empty;
            result.message = Some(format!("no template matches kind {}", kind.as_str()));
            result.elapsed_ms = start.elapsed().as_millis() as u64;
            return result;
        }

        for template in &candidates {
            result.attempts.push(template.id.clone());
            let (binds, filters) = Self::resolve_binds(template, decision);

            match self.store.query(&template.sql, &binds).await {
                Ok(rows) if rows.is_empty() => {
                    debug!(template = %template.id, "Template returned zero rows, falling through");
                }
                Ok(rows) => {
                    let degraded =
                        !template.country_filtered && decision.country != "GLOBAL";
                    result.status = if degraded {
                        BranchStatus::Degraded
                    } else {
                        BranchStatus::Ok
                    };
                    if degraded {
                        result.message = Some(format!(
                            "country filter for {} unavailable in {}; returned unfiltered default",
                            decision.country, template.id
                        ));
                    }
                    info!(
                        flow_run_id = %flow.flow_run_id,
                        template = %template.id,
                        rows = rows.len(),
                        attempts = result.attempts.len(),
                        degraded,
                        "SQL branch resolved"
                    );
                    result.payload = BranchPayload::Rows(rows);
                    result.filters = filters;
                    result.elapsed_ms = start.elapsed().as_millis() as u64;
                    return result;
                }
                Err(e) => {
                    warn!(
                        template = %template.id,
                        error = %e,
                        "Template query failed, falling through to next candidate"
                    );
                    store_errors.push(format!("{}: {}", template.id, e));
                }
            }
        }

        result.elapsed_ms = start.elapsed().as_millis() as u64;
        if store_errors.is_empty() {
            result.status = BranchStatus::Empty;
            result.message = Some("all ranked templates returned zero rows".to_string());
        } else {
            result.status = BranchStatus::Error;
            result.message = Some(store_errors.join("; "));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowType;
    use crate::router::{IntentSource, RouteType};
    use crate::stores::{MockSqlStore, Row};

    fn decision(route: RouteType, country: &str, symbol: Option<&str>) -> RoutingDecision {
        RoutingDecision {
            route,
            country: country.to_string(),
            symbol: symbol.map(|s| s.to_string()),
            sql_need: true,
            graph_need: false,
            web_allowed: false,
            agents: vec!["sql_branch".to_string()],
            intent_source: IntentSource::Heuristic,
        }
    }

    fn sample_row() -> Row {
        Row::from_pairs([
            ("period", serde_json::json!("2025-06-01")),
            ("avg_price", serde_json::json!(98000.0)),
        ])
    }

    // ========================================================================
    // Ranking tests
    // ========================================================================

    #[test]
    fn test_candidates_rank_market_specialized_first() {
        let registry = TemplateRegistry::new();
        let decision = decision(RouteType::RealEstateDetail, "KR", None);
        let candidates = registry.candidates(&decision, DatasetKind::RealEstate);

        assert!(candidates.len() >= 3);
        assert_eq!(candidates[0].id, "kr_apt_price_monthly");
        assert_eq!(candidates[1].id, "re_price_index_by_country");
    }

    #[test]
    fn test_candidates_exclude_wrong_market() {
        let registry = TemplateRegistry::new();
        let decision = decision(RouteType::UsSingleStock, "US", Some("AAPL"));
        let candidates = registry.candidates(&decision, DatasetKind::Equity);

        assert!(candidates.iter().all(|t| t.id != "kr_equity_daily_by_symbol"));
        assert_eq!(candidates[0].id, "us_equity_daily_by_symbol");
    }

    #[test]
    fn test_candidates_exclude_symbol_templates_without_symbol() {
        let registry = TemplateRegistry::new();
        let decision = decision(RouteType::UsSingleStock, "US", None);
        let candidates = registry.candidates(&decision, DatasetKind::Equity);

        assert!(candidates.iter().all(|t| !t.requires_symbol()));
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let registry = TemplateRegistry::empty();
        let template = QueryTemplate {
            id: "t1".to_string(),
            kind: DatasetKind::General,
            country: None,
            binds: vec![],
            country_filtered: false,
            sql: "SELECT 1".to_string(),
        };
        assert!(registry.register(template.clone()).is_ok());
        assert!(registry.register(template).is_err());
    }

    #[test]
    fn test_registry_builtin_count() {
        let registry = TemplateRegistry::new();
        assert!(registry.count() >= 7);
    }

    // ========================================================================
    // Execution tests
    // ========================================================================

    #[tokio::test]
    async fn test_top_candidate_with_rows_wins() {
        let mut store = MockSqlStore::new();
        store
            .expect_query()
            .withf(|sql, _| sql.contains("apt_price_monthly"))
            .returning(|_, _| Ok(vec![sample_row()]));

        let branch = SqlBranch::new(Arc::new(store), Arc::new(TemplateRegistry::new()));
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, "KR", None);

        let result = branch.execute(&question, &decision, &flow).await;
        assert_eq!(result.status, BranchStatus::Ok);
        assert_eq!(result.attempts, vec!["kr_apt_price_monthly".to_string()]);
        assert_eq!(result.payload.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_rows_falls_through_and_records_both_attempts() {
        let mut store = MockSqlStore::new();
        store
            .expect_query()
            .withf(|sql, _| sql.contains("apt_price_monthly"))
            .returning(|_, _| Ok(vec![]));
        store
            .expect_query()
            .withf(|sql, _| sql.contains("re_price_index WHERE"))
            .returning(|_, _| Ok(vec![sample_row()]));

        let branch = SqlBranch::new(Arc::new(store), Arc::new(TemplateRegistry::new()));
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, "KR", None);

        let result = branch.execute(&question, &decision, &flow).await;
        assert_eq!(result.status, BranchStatus::Ok);
        assert_eq!(
            result.attempts,
            vec![
                "kr_apt_price_monthly".to_string(),
                "re_price_index_by_country".to_string()
            ]
        );
        assert_eq!(result.filters.get("country"), Some(&"KR".to_string()));
    }

    #[tokio::test]
    async fn test_unfiltered_fallback_is_degraded() {
        let mut store = MockSqlStore::new();
        store
            .expect_query()
            .withf(|sql, _| !sql.contains("re_price_index ORDER"))
            .returning(|_, _| Ok(vec![]));
        store
            .expect_query()
            .withf(|sql, _| sql.contains("re_price_index ORDER"))
            .returning(|_, _| Ok(vec![sample_row()]));

        let branch = SqlBranch::new(Arc::new(store), Arc::new(TemplateRegistry::new()));
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, "KR", None);

        let result = branch.execute(&question, &decision, &flow).await;
        assert_eq!(result.status, BranchStatus::Degraded);
        assert!(result.message.as_deref().unwrap().contains("unfiltered"));
        assert_eq!(result.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_store_error_falls_through_then_errors_when_exhausted() {
        let mut store = MockSqlStore::new();
        store.expect_query().returning(|_, _| {
            Err(crate::error::StoreError::Sql {
                message: "disk gone".to_string(),
            })
        });

        let branch = SqlBranch::new(Arc::new(store), Arc::new(TemplateRegistry::new()));
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, "KR", None);

        let result = branch.execute(&question, &decision, &flow).await;
        assert_eq!(result.status, BranchStatus::Error);
        assert!(result.attempts.len() >= 2);
        assert!(result.message.as_deref().unwrap().contains("disk gone"));
    }

    #[tokio::test]
    async fn test_all_empty_yields_empty_status() {
        let mut store = MockSqlStore::new();
        store.expect_query().returning(|_, _| Ok(vec![]));

        let branch = SqlBranch::new(Arc::new(store), Arc::new(TemplateRegistry::new()));
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, "KR", None);

        let result = branch.execute(&question, &decision, &flow).await;
        assert_eq!(result.status, BranchStatus::Empty);
        assert!(result.payload.is_empty());
    }

    #[tokio::test]
    async fn test_no_candidates_yields_empty_with_message() {
        let store = MockSqlStore::new();
        let branch = SqlBranch::new(Arc::new(store), Arc::new(TemplateRegistry::empty()));
        let flow = FlowContext::new(FlowType::Answer, "answer_pipeline");
        let question = Question::new("apartment prices");
        let decision = decision(RouteType::RealEstateDetail, "KR", None);

        let result = branch.execute(&question, &decision, &flow).await;
        assert_eq!(result.status, BranchStatus::Empty);
        assert!(result.message.as_deref().unwrap().contains("no template"));
    }
}
