//! Question routing.
//!
//! The router classifies intent with a cheap keyword pass first and only
//! escalates to the LLM intent classifier (`router_intent_classifier`,
//! a sub-agent under the invocation's flow context) when the heuristics are
//! inconclusive. Per-route behavior lives in one [`RouteProfile`] record per
//! [`RouteType`], looked up exactly once here; downstream components read
//! the resulting [`RoutingDecision`] instead of re-branching on route type.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::flow::{FlowContext, FlowScope};
use crate::inference::{InferenceClient, Message};
use crate::prompts::INTENT_CLASSIFIER_PROMPT;

/// A single prior turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// "user" or "assistant".
    pub role: String,
    /// The turn's text.
    pub text: String,
}

impl ConversationTurn {
    /// Create a user turn
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    /// Create an assistant turn
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            text: text.into(),
        }
    }
}

/// An incoming user question. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Raw question text.
    pub text: String,
    /// Explicit country scope, when the caller supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Explicit focus symbol (ticker), when the caller supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Ordered prior turns.
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

impl Question {
    /// Create a question with just text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            country: None,
            symbol: None,
            history: Vec::new(),
        }
    }

    /// Set the explicit country scope
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Set the focus symbol
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Attach conversation history
    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }
}

/// Question intent classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    /// Broad financial-macro question with no narrower match.
    General,
    /// Macro indicator lookup (rates, inflation, FX, GDP).
    MacroIndicator,
    /// Real-estate price/transaction detail in one market.
    RealEstateDetail,
    /// Home-market single-stock detail.
    DomesticStockDetail,
    /// US-listed single-stock detail.
    UsSingleStock,
    /// Recent-news digest.
    NewsDigest,
}

impl RouteType {
    /// Get the route type as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::General => "general",
            RouteType::MacroIndicator => "macro_indicator",
            RouteType::RealEstateDetail => "real_estate_detail",
            RouteType::DomesticStockDetail => "domestic_stock_detail",
            RouteType::UsSingleStock => "us_single_stock",
            RouteType::NewsDigest => "news_digest",
        }
    }

    /// Look up the behavior profile for this route.
    pub fn profile(&self) -> &'static RouteProfile {
        match self {
            RouteType::General => &GENERAL_PROFILE,
            RouteType::MacroIndicator => &MACRO_PROFILE,
            RouteType::RealEstateDetail => &REAL_ESTATE_PROFILE,
            RouteType::DomesticStockDetail => &DOMESTIC_STOCK_PROFILE,
            RouteType::UsSingleStock => &US_STOCK_PROFILE,
            RouteType::NewsDigest => &NEWS_PROFILE,
        }
    }
}

impl std::fmt::Display for RouteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RouteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "general" => Ok(RouteType::General),
            "macro_indicator" => Ok(RouteType::MacroIndicator),
            "real_estate_detail" => Ok(RouteType::RealEstateDetail),
            "domestic_stock_detail" => Ok(RouteType::DomesticStockDetail),
            "us_single_stock" => Ok(RouteType::UsSingleStock),
            "news_digest" => Ok(RouteType::NewsDigest),
            _ => Err(format!("Unknown route type: {}", s)),
        }
    }
}

/// Scope default policy applied when the question carries no explicit country.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeDefault {
    /// Default to the configured home market.
    HomeMarket,
    /// Default to the US market.
    UnitedStates,
    /// No single market; treat as global.
    Global,
}

/// Dataset family a route draws its SQL evidence from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Real-estate prices and transactions.
    RealEstate,
    /// Single-stock daily series.
    Equity,
    /// Macro indicator series.
    Macro,
    /// News summaries.
    News,
    /// Cross-market summaries usable as a last resort.
    General,
}

impl DatasetKind {
    /// Get the dataset kind as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::RealEstate => "real_estate",
            DatasetKind::Equity => "equity",
            DatasetKind::Macro => "macro",
            DatasetKind::News => "news",
            DatasetKind::General => "general",
        }
    }
}

/// Per-route behavior record, looked up once by the router.
#[derive(Debug, Clone)]
pub struct RouteProfile {
    /// Scope applied when the question has no explicit country.
    pub scope_default: ScopeDefault,
    /// Whether the SQL branch runs.
    pub sql_need: bool,
    /// Whether the graph branch runs by default. Conservative detail routes
    /// keep this off to bound cost; the pipeline escalates it when the SQL
    /// branch comes back empty or degraded.
    pub graph_need: bool,
    /// Whether the web fallback branch may run.
    pub web_allowed: bool,
    /// Dataset family used to rank SQL templates.
    pub dataset_kind: DatasetKind,
    /// Section labels the answer must carry, when the route mandates a layout.
    pub mandated_sections: &'static [&'static str],
    /// Whether a multi-period dataset must yield an explicit trend statement.
    pub requires_trend_statement: bool,
}

static GENERAL_PROFILE: RouteProfile = RouteProfile {
    scope_default: ScopeDefault::Global,
    sql_need: true,
    graph_need: true,
    web_allowed: true,
    dataset_kind: DatasetKind::General,
    mandated_sections: &[],
    requires_trend_statement: false,
};

static MACRO_PROFILE: RouteProfile = RouteProfile {
    scope_default: ScopeDefault::HomeMarket,
    sql_need: true,
    graph_need: true,
    web_allowed: false,
    dataset_kind: DatasetKind::Macro,
    mandated_sections: &[],
    requires_trend_statement: true,
};

static REAL_ESTATE_PROFILE: RouteProfile = RouteProfile {
    scope_default: ScopeDefault::HomeMarket,
    sql_need: true,
    graph_need: false,
    web_allowed: false,
    dataset_kind: DatasetKind::RealEstate,
    mandated_sections: &[],
    requires_trend_statement: true,
};

static DOMESTIC_STOCK_PROFILE: RouteProfile = RouteProfile {
    scope_default: ScopeDefault::HomeMarket,
    sql_need: true,
    graph_need: false,
    web_allowed: false,
    dataset_kind: DatasetKind::Equity,
    mandated_sections: &[],
    requires_trend_statement: false,
};

static US_STOCK_PROFILE: RouteProfile = RouteProfile {
    scope_default: ScopeDefault::UnitedStates,
    sql_need: true,
    graph_need: false,
    web_allowed: true,
    dataset_kind: DatasetKind::Equity,
    mandated_sections: &["Overview", "Recent Performance", "Key Drivers", "Risks"],
    requires_trend_statement: false,
};

static NEWS_PROFILE: RouteProfile = RouteProfile {
    scope_default: ScopeDefault::Global,
    sql_need: false,
    graph_need: true,
    web_allowed: true,
    dataset_kind: DatasetKind::News,
    mandated_sections: &[],
    requires_trend_statement: false,
};

/// Whether a question runs evidence tools or is answered directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// One or more evidence branches run.
    Tools,
    /// No branch is needed; the synthesizer answers from history alone.
    Direct,
}

/// How the route type was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    /// Keyword heuristics were conclusive.
    Heuristic,
    /// The LLM intent classifier decided.
    Classifier,
    /// The classifier failed; heuristic default applied.
    ClassifierFallback,
}

/// The routing outcome for one question. Produced exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Classified route type.
    pub route: RouteType,
    /// Resolved country scope (ISO code or "GLOBAL").
    pub country: String,
    /// Focus symbol carried over from the question.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Whether the SQL branch should run.
    pub sql_need: bool,
    /// Whether the graph branch should run.
    pub graph_need: bool,
    /// Whether the web fallback branch may run.
    pub web_allowed: bool,
    /// Branch agents selected for this question.
    pub agents: Vec<String>,
    /// How the route was determined.
    pub intent_source: IntentSource,
}

impl RoutingDecision {
    /// Tool mode derived from the branch needs.
    pub fn tool_mode(&self) -> ToolMode {
        if self.sql_need || self.graph_need || self.web_allowed {
            ToolMode::Tools
        } else {
            ToolMode::Direct
        }
    }
}

/// Classifier completion payload
#[derive(Debug, Deserialize)]
struct IntentResponse {
    route: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Extract JSON from a completion string, handling markdown code blocks.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Intent router
#[derive(Clone)]
pub struct Router {
    inference: InferenceClient,
    routing: RoutingConfig,
}

impl Router {
    /// Create a new router
    pub fn new(inference: InferenceClient, routing: RoutingConfig) -> Self {
        Self { inference, routing }
    }

    /// Produce the routing decision for a question.
    ///
    /// Classifier failures never abort the pipeline; the heuristic default
    /// is used instead.
    pub async fn route(&self, question: &Question, flow: &FlowContext) -> RoutingDecision {
        let start = Instant::now();

        let (route, intent_source) = match self.heuristic_route(question) {
            Some(route) => (route, IntentSource::Heuristic),
            None => match self.classify(question, flow).await {
                Ok(route) => (route, IntentSource::Classifier),
                Err(e) => {
                    warn!(
                        flow_run_id = %flow.flow_run_id,
                        error = %e,
                        "Intent classifier failed, falling back to heuristic default"
                    );
                    (RouteType::General, IntentSource::ClassifierFallback)
                }
            },
        };

        let decision = self.decide(route, question, intent_source);

        info!(
            flow_run_id = %flow.flow_run_id,
            route = %decision.route,
            country = %decision.country,
            sql_need = decision.sql_need,
            graph_need = decision.graph_need,
            source = ?decision.intent_source,
            latency_ms = start.elapsed().as_millis() as u64,
            "Question routed"
        );

        decision
    }

    /// Keyword pass over the question text. Returns None when inconclusive.
    fn heuristic_route(&self, question: &Question) -> Option<RouteType> {
        let text = question.text.to_lowercase();

        const REAL_ESTATE: [&str; 6] = [
            "real estate",
            "apartment",
            "housing",
            "property price",
            "jeonse",
            "home price",
        ];
        const MACRO: [&str; 8] = [
            "cpi",
            "inflation",
            "gdp",
            "interest rate",
            "base rate",
            "exchange rate",
            "unemployment",
            "yield curve",
        ];
        const NEWS: [&str; 3] = ["news", "headline", "latest on"];
        const STOCK: [&str; 5] = ["stock", "share price", "earnings", "ticker", "valuation"];
        const US_MARKET: [&str; 5] = ["nasdaq", "nyse", "s&p", "us stock", "wall street"];

        if REAL_ESTATE.iter().any(|k| text.contains(k)) {
            return Some(RouteType::RealEstateDetail);
        }
        if NEWS.iter().any(|k| text.contains(k)) {
            return Some(RouteType::NewsDigest);
        }
        if STOCK.iter().any(|k| text.contains(k)) || question.symbol.is_some() {
            let is_us = US_MARKET.iter().any(|k| text.contains(k))
                || question.country.as_deref() == Some("US");
            let is_home = self.matches_home_hint(&text)
                || question.country.as_deref() == Some(self.routing.home_market.as_str());
            if is_us {
                return Some(RouteType::UsSingleStock);
            }
            if is_home {
                return Some(RouteType::DomesticStockDetail);
            }
            // A stock question without a market hint stays inconclusive.
            return None;
        }
        if MACRO.iter().any(|k| text.contains(k)) {
            return Some(RouteType::MacroIndicator);
        }

        None
    }

    /// LLM escalation path, wrapped as the `router_intent_classifier` agent.
    async fn classify(
        &self,
        question: &Question,
        flow: &FlowContext,
    ) -> Result<RouteType, RoutingError> {
        let scope = FlowScope::enter(flow.agent("router_intent_classifier"));

        let messages = vec![
            Message::system(INTENT_CLASSIFIER_PROMPT),
            Message::user(format!("Classify this question:\n\n{}", question.text)),
        ];

        let completion = self
            .inference
            .complete(messages, scope.ctx())
            .await
            .map_err(|e| RoutingError::Classification {
                message: e.to_string(),
            })?;

        let json = extract_json_from_completion(&completion.text)
            .map_err(|message| RoutingError::InvalidClassification { message })?;

        let parsed: IntentResponse =
            serde_json::from_str(json).map_err(|e| RoutingError::InvalidClassification {
                message: format!("JSON parse error: {}", e),
            })?;

        debug!(
            route = %parsed.route,
            confidence = parsed.confidence.unwrap_or(0.0),
            "Classifier verdict"
        );

        parsed
            .route
            .parse()
            .map_err(|message| RoutingError::InvalidClassification { message })
    }

    /// Apply scope defaulting policy and derive branch needs from the profile.
    fn decide(
        &self,
        route: RouteType,
        question: &Question,
        intent_source: IntentSource,
    ) -> RoutingDecision {
        let profile = route.profile();
        let text = question.text.to_lowercase();

        let country = match &question.country {
            Some(explicit) => explicit.clone(),
            None if self.matches_home_hint(&text) => self.routing.home_market.clone(),
            None => match profile.scope_default {
                ScopeDefault::HomeMarket => self.routing.home_market.clone(),
                ScopeDefault::UnitedStates => "US".to_string(),
                ScopeDefault::Global => "GLOBAL".to_string(),
            },
        };

        let mut agents = Vec::new();
        if profile.sql_need {
            agents.push("sql_branch".to_string());
        }
        if profile.graph_need {
            agents.push("graph_branch".to_string());
        }
        if profile.web_allowed {
            agents.push("web_branch".to_string());
        }

        RoutingDecision {
            route,
            country,
            symbol: question.symbol.clone(),
            sql_need: profile.sql_need,
            graph_need: profile.graph_need,
            web_allowed: profile.web_allowed,
            agents,
            intent_source,
        }
    }

    fn matches_home_hint(&self, lowercased_text: &str) -> bool {
        self.routing
            .home_hint_keywords
            .iter()
            .any(|k| lowercased_text.contains(k.as_str()))
    }
}
