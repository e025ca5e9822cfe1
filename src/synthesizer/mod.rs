//! Supervisor synthesizer.
//!
//! The terminal agent of the pipeline: merges the routed question, the
//! structured evidence context, and the conversation history into one LLM
//! call, then post-processes the completion into a grounded
//! [`AnswerResponse`]. Post-processing guarantees mandated section layouts
//! (missing sections get a best-effort fallback sentence from the context),
//! classifies claim support by token/number overlap against the evidence,
//! sanitizes internal identifiers, and injects a templated trend sentence
//! when a multi-period dataset demands one and the model omitted it.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::ContextConfig;
use crate::context::{IdentifierHumanizer, StructuredDataContext};
use crate::error::{SynthesisError, SynthesisResult};
use crate::flow::{FlowContext, FlowScope};
use crate::inference::{InferenceClient, Message};
use crate::prompts::{SECTION_LAYOUT_INSTRUCTION, SUPERVISOR_PROMPT};
use crate::router::{DatasetKind, Question, RoutingDecision};

/// What a citation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationKind {
    /// A named dataset (table/template) with its filters.
    Dataset,
    /// A knowledge-graph node.
    Graph,
    /// A web result.
    Web,
}

/// A reference supporting claims in the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// What the reference points at.
    pub kind: CitationKind,
    /// Dataset name, graph node id, or URL.
    pub reference: String,
    /// Filters, source, or title detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Context metadata carried alongside the answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextMeta {
    /// Number of datasets in the merged context.
    pub datasets: usize,
    /// Number of graph passages.
    pub passages: usize,
    /// Number of web hits.
    pub web_hits: usize,
    /// Rendered context size in characters (after budgeting).
    pub size_chars: usize,
    /// Most recent evidence timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<NaiveDateTime>,
    /// Attempted targets per source.
    pub attempted: BTreeMap<String, Vec<String>>,
}

/// The terminal artifact of a pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    /// Final answer text after post-processing.
    pub text: String,
    /// Short key points extracted from the answer.
    pub key_points: Vec<String>,
    /// Structured citations.
    pub citations: Vec<Citation>,
    /// Context metadata.
    pub context: ContextMeta,
    /// Raw model output before post-processing.
    pub raw_completion: String,
    /// Mandated sections the model omitted (before fallback filling).
    pub missing_sections: Vec<String>,
    /// Sections filled by fallback sentences.
    pub fallback_sections: Vec<String>,
    /// Whether a mandated section layout was enforced.
    pub template_enforced: bool,
    /// Claims that could not be matched against the evidence. Flagged,
    /// never deleted.
    pub unsupported_claims: Vec<String>,
}

/// Supervisor synthesizer
#[derive(Clone)]
pub struct Synthesizer {
    inference: InferenceClient,
    config: ContextConfig,
    humanizer: IdentifierHumanizer,
}

impl Synthesizer {
    /// Create a new synthesizer
    pub fn new(inference: InferenceClient, config: ContextConfig) -> Self {
        Self {
            inference,
            config,
            humanizer: IdentifierHumanizer::new(),
        }
    }

    /// Produce the final grounded answer. One LLM call, no hot-path retry.
    pub async fn synthesize(
        &self,
        question: &Question,
        decision: &RoutingDecision,
        ctx: &StructuredDataContext,
        flow: &FlowContext,
    ) -> SynthesisResult<AnswerResponse> {
        let scope = FlowScope::enter(flow.agent("supervisor_synthesizer"));
        let start = Instant::now();

        let messages = self.build_messages(question, decision, ctx);
        let completion = self.inference.complete(messages, scope.ctx()).await?;

        if completion.text.trim().is_empty() {
            return Err(SynthesisError::EmptyCompletion);
        }

        let response = self.post_process(question, decision, ctx, completion.text);

        info!(
            flow_run_id = %flow.flow_run_id,
            route = %decision.route,
            citations = response.citations.len(),
            unsupported = response.unsupported_claims.len(),
            template_enforced = response.template_enforced,
            latency_ms = start.elapsed().as_millis() as u64,
            "Answer synthesized"
        );

        Ok(response)
    }

    /// Assemble the prompt: system rules, bounded history tail, question + context.
    fn build_messages(
        &self,
        question: &Question,
        decision: &RoutingDecision,
        ctx: &StructuredDataContext,
    ) -> Vec<Message> {
        let mut system = SUPERVISOR_PROMPT.to_string();
        let sections = decision.route.profile().mandated_sections;
        if !sections.is_empty() {
            system.push_str(&format!(
                "\n{}{}.",
                SECTION_LAYOUT_INSTRUCTION,
                sections.join(", ")
            ));
        }

        let mut messages = vec![Message::system(system)];

        // Bounded history tail, oldest dropped first.
        let tail_start = question
            .history
            .len()
            .saturating_sub(self.config.max_history_turns);
        for turn in &question.history[tail_start..] {
            if turn.role == "assistant" {
                messages.push(Message::assistant(&turn.text));
            } else {
                messages.push(Message::user(&turn.text));
            }
        }

        messages.push(Message::user(format!(
            "Question ({} scope): {}\n\nEvidence context:\n{}",
            decision.country,
            question.text,
            ctx.render()
        )));

        messages
    }

    /// All deterministic post-processing of the raw completion.
    fn post_process(
        &self,
        _question: &Question,
        decision: &RoutingDecision,
        ctx: &StructuredDataContext,
        raw_completion: String,
    ) -> AnswerResponse {
        let profile = decision.route.profile();

        let mut text = self.humanizer.strip_internal_tokens(&raw_completion);

        let (missing_sections, fallback_sections) =
            enforce_sections(&mut text, profile.mandated_sections, ctx);
        if !fallback_sections.is_empty() {
            warn!(
                route = %decision.route,
                sections = ?fallback_sections,
                "Model omitted mandated sections; fallback sentences injected"
            );
        }

        if profile.requires_trend_statement {
            inject_trend_statement(&mut text, ctx, self.config.min_trend_periods);
        }

        let citations = collect_citations(ctx);
        let unsupported_claims = classify_support(&text, ctx);
        let key_points = extract_key_points(&text, profile.mandated_sections);

        AnswerResponse {
            text,
            key_points,
            citations,
            context: ContextMeta {
                datasets: ctx.datasets.len(),
                passages: ctx.passages.len(),
                web_hits: ctx.web_hits.len(),
                size_chars: ctx.size_estimate,
                latest_timestamp: ctx.latest_timestamp(),
                attempted: ctx.attempted.clone(),
            },
            raw_completion,
            missing_sections,
            fallback_sections,
            template_enforced: !profile.mandated_sections.is_empty(),
            unsupported_claims,
        }
    }
}

/// Guarantee every mandated section label appears, filling gaps with
/// best-effort fallback sentences from the context.
///
/// Returns (sections initially missing, sections filled by fallback).
fn enforce_sections(
    text: &mut String,
    mandated: &[&str],
    ctx: &StructuredDataContext,
) -> (Vec<String>, Vec<String>) {
    let mut missing = Vec::new();
    let mut filled = Vec::new();

    for section in mandated {
        let lowercase = text.to_lowercase();
        if lowercase.contains(&section.to_lowercase()) {
            continue;
        }
        missing.push(section.to_string());
        text.push_str(&format!("\n\n{}: {}", section, fallback_sentence(section, ctx)));
        filled.push(section.to_string());
    }

    (missing, filled)
}

/// Best-effort sentence for an omitted section, from the evidence at hand.
fn fallback_sentence(section: &str, ctx: &StructuredDataContext) -> String {
    if let Some(dataset) = ctx.datasets.first() {
        let trend = dataset
            .signals
            .trend
            .map(|t| format!(" with a {} trend", t))
            .unwrap_or_default();
        return format!(
            "Based on {} covering {} periods{}, no further detail was available for {}.",
            dataset.name,
            dataset.signals.periods,
            trend,
            section.to_lowercase()
        );
    }
    if let Some(passage) = ctx.passages.first() {
        return format!(
            "The available reporting notes: {}",
            passage.text.chars().take(160).collect::<String>()
        );
    }
    format!(
        "No supporting data was available for {} at answer time.",
        section.to_lowercase()
    )
}

/// Words whose presence counts as an explicit trend reference.
const TREND_VOCABULARY: [&str; 10] = [
    "rising", "falling", "flat", "trend", "uptrend", "downtrend", "increasing", "decreasing",
    "upward", "downward",
];

/// Append a templated trend sentence when the dataset spans enough periods
/// and the text does not already reference one.
fn inject_trend_statement(text: &mut String, ctx: &StructuredDataContext, min_periods: usize) {
    let lowercase = text.to_lowercase();
    if TREND_VOCABULARY.iter().any(|w| lowercase.contains(w)) {
        return;
    }

    let candidate = ctx.datasets.iter().find_map(|d| {
        if d.signals.periods >= min_periods {
            d.signals.trend.map(|trend| (d, trend))
        } else {
            None
        }
    });

    if let Some((dataset, trend)) = candidate {
        let subject = match dataset.kind {
            DatasetKind::RealEstate => "the real-estate price series",
            DatasetKind::Equity => "the share price series",
            DatasetKind::Macro => "the indicator series",
            DatasetKind::News | DatasetKind::General => "the underlying series",
        };
        text.push_str(&format!("\n\n{}", trend.sentence(subject)));
    }
}

/// One citation per dataset, passage, and web hit.
fn collect_citations(ctx: &StructuredDataContext) -> Vec<Citation> {
    let mut citations = Vec::new();

    for dataset in &ctx.datasets {
        let detail = if dataset.filters.is_empty() {
            None
        } else {
            Some(
                dataset
                    .filters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };
        citations.push(Citation {
            kind: CitationKind::Dataset,
            reference: dataset.name.clone(),
            detail,
        });
    }

    for passage in &ctx.passages {
        citations.push(Citation {
            kind: CitationKind::Graph,
            reference: passage.node_id.clone(),
            detail: passage.source.clone(),
        });
    }

    for hit in &ctx.web_hits {
        citations.push(Citation {
            kind: CitationKind::Web,
            reference: hit.url.clone(),
            detail: Some(hit.title.clone()),
        });
    }

    citations
}

/// Flag sentences with no token/number overlap against the evidence.
///
/// A sentence counts as supported when it shares a number with the
/// evidence, or at least two content words. Unsupported sentences are
/// returned for flagging, never removed from the answer.
fn classify_support(text: &str, ctx: &StructuredDataContext) -> Vec<String> {
    let evidence = ctx.render();
    let evidence_numbers = number_tokens(&evidence);
    let evidence_words = content_words(&evidence);

    split_sentences(text)
        .into_iter()
        .filter(|sentence| {
            let numbers = number_tokens(sentence);
            if numbers.iter().any(|n| evidence_numbers.contains(n)) {
                return false;
            }
            let words = content_words(sentence);
            let overlap = words.intersection(&evidence_words).count();
            overlap < 2
        })
        .collect()
}

/// Key points: leading sentence per mandated section, or the first few
/// sentences of free-form text.
fn extract_key_points(text: &str, mandated: &[&str]) -> Vec<String> {
    if mandated.is_empty() {
        return split_sentences(text).into_iter().take(3).collect();
    }

    let mut points = Vec::new();
    for section in mandated {
        let lowercase = text.to_lowercase();
        if let Some(pos) = lowercase.find(&section.to_lowercase()) {
            let tail = &text[pos + section.len()..];
            let body = tail.trim_start_matches([':', ' ', '\n']);
            if let Some(first) = split_sentences(body).into_iter().next() {
                points.push(format!("{}: {}", section, first));
            }
        }
    }
    points
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(|s| s.trim())
        .filter(|s| s.len() > 8)
        .map(|s| s.to_string())
        .collect()
}

/// Digit-bearing tokens, normalized (commas, currency, percent stripped).
fn number_tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
        .map(|t| {
            t.chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect::<String>()
                .trim_matches(['.', '-'])
                .to_string()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Lowercased words of five or more letters.
fn content_words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 5 && w.chars().all(|c| c.is_alphabetic()))
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Dataset, Signals, TrendClass};
    use crate::stores::Row;

    fn trend_context() -> StructuredDataContext {
        let mut ctx = StructuredDataContext {
            datasets: vec![Dataset {
                name: "kr_apt_price_monthly".to_string(),
                kind: DatasetKind::RealEstate,
                filters: BTreeMap::from([("country".to_string(), "KR".to_string())]),
                sample_rows: vec![Row::from_pairs([
                    ("period", serde_json::json!("2025-06-01")),
                    ("avg_price", serde_json::json!(99500.0)),
                ])],
                row_count: 12,
                signals: Signals {
                    trend: Some(TrendClass::Rising),
                    pct_changes: BTreeMap::from([("12p".to_string(), 4.2)]),
                    event_delta: None,
                    periods: 12,
                },
                latest_period: None,
            }],
            ..Default::default()
        };
        ctx.recompute_size();
        ctx
    }

    // ========================================================================
    // Section enforcement tests
    // ========================================================================

    #[test]
    fn test_all_sections_present_nothing_filled() {
        let mut text = "Overview: fine.\nRecent Performance: up.\nKey Drivers: rates.\nRisks: few."
            .to_string();
        let sections = ["Overview", "Recent Performance", "Key Drivers", "Risks"];
        let (missing, filled) = enforce_sections(&mut text, &sections, &trend_context());
        assert!(missing.is_empty());
        assert!(filled.is_empty());
    }

    #[test]
    fn test_omitted_section_gets_fallback_sentence() {
        let mut text =
            "Overview: fine.\nRecent Performance: up 4.2%.\nRisks: competition.".to_string();
        let sections = ["Overview", "Recent Performance", "Key Drivers", "Risks"];
        let ctx = trend_context();
        let (missing, filled) = enforce_sections(&mut text, &sections, &ctx);

        assert_eq!(missing, vec!["Key Drivers".to_string()]);
        assert_eq!(filled, vec!["Key Drivers".to_string()]);
        assert!(text.contains("Key Drivers:"));
        assert!(text.contains("kr_apt_price_monthly"));
    }

    #[test]
    fn test_fallback_sentence_without_any_evidence() {
        let ctx = StructuredDataContext::default();
        let sentence = fallback_sentence("Risks", &ctx);
        assert!(sentence.contains("No supporting data"));
        assert!(sentence.contains("risks"));
    }

    #[test]
    fn test_section_matching_is_case_insensitive() {
        let mut text = "OVERVIEW: loud but present.".to_string();
        let (missing, _) = enforce_sections(&mut text, &["Overview"], &trend_context());
        assert!(missing.is_empty());
    }

    // ========================================================================
    // Trend injection tests
    // ========================================================================

    #[test]
    fn test_trend_injected_when_absent() {
        let mut text = "Prices moved around 99,500 in June according to the data.".to_string();
        inject_trend_statement(&mut text, &trend_context(), 3);
        assert!(text.to_lowercase().contains("rising trend"));
        assert!(text.contains("real-estate price series"));
    }

    #[test]
    fn test_trend_not_injected_when_referenced() {
        let mut text = "The series shows a rising trend through June.".to_string();
        let before = text.clone();
        inject_trend_statement(&mut text, &trend_context(), 3);
        assert_eq!(text, before);
    }

    #[test]
    fn test_trend_not_injected_below_min_periods() {
        let mut ctx = trend_context();
        ctx.datasets[0].signals.periods = 2;
        let mut text = "Prices moved around 99,500 in June.".to_string();
        let before = text.clone();
        inject_trend_statement(&mut text, &ctx, 3);
        assert_eq!(text, before);
    }

    // ========================================================================
    // Support classification tests
    // ========================================================================

    #[test]
    fn test_number_overlap_counts_as_supported() {
        let ctx = trend_context();
        let unsupported =
            classify_support("The average price reached 99,500.0 in the latest month.", &ctx);
        assert!(unsupported.is_empty());
    }

    #[test]
    fn test_fabricated_claim_is_flagged_not_deleted() {
        let ctx = trend_context();
        let text = "Gold exports doubled overnight according to whispers.";
        let unsupported = classify_support(text, &ctx);
        assert_eq!(unsupported.len(), 1);
        assert!(unsupported[0].contains("Gold exports"));
    }

    #[test]
    fn test_word_overlap_counts_as_supported() {
        let mut ctx = trend_context();
        ctx.passages.push(crate::branches::NormalizedPassage {
            node_id: "n1".to_string(),
            text: "Household lending standards tightened across regional banks".to_string(),
            source: None,
            timestamp: None,
        });
        ctx.recompute_size();
        let unsupported = classify_support(
            "Regional banks have tightened household lending standards.",
            &ctx,
        );
        assert!(unsupported.is_empty());
    }

    #[test]
    fn test_number_normalization_matches_formatted_figures() {
        let numbers = number_tokens("price of 99,500.0 and 4.2% change");
        assert!(numbers.contains("99500.0"));
        assert!(numbers.contains("4.2"));
    }

    // ========================================================================
    // Citation and key point tests
    // ========================================================================

    #[test]
    fn test_citations_cover_all_sources() {
        let mut ctx = trend_context();
        ctx.passages.push(crate::branches::NormalizedPassage {
            node_id: "node-9".to_string(),
            text: "passage".to_string(),
            source: Some("minutes".to_string()),
            timestamp: None,
        });
        ctx.web_hits.push(crate::stores::WebHit {
            title: "Title".to_string(),
            url: "https://example.com".to_string(),
            snippet: String::new(),
        });

        let citations = collect_citations(&ctx);
        assert_eq!(citations.len(), 3);
        assert_eq!(citations[0].kind, CitationKind::Dataset);
        assert_eq!(citations[0].detail.as_deref(), Some("country=KR"));
        assert_eq!(citations[1].kind, CitationKind::Graph);
        assert_eq!(citations[1].reference, "node-9");
        assert_eq!(citations[2].kind, CitationKind::Web);
    }

    #[test]
    fn test_key_points_from_sections() {
        let text = "Overview: Solid quarter overall for the company. More detail here.\n\
                    Risks: Competition is intensifying across segments.";
        let points = extract_key_points(text, &["Overview", "Risks"]);
        assert_eq!(points.len(), 2);
        assert!(points[0].starts_with("Overview: Solid quarter"));
        assert!(points[1].starts_with("Risks: Competition"));
    }

    #[test]
    fn test_key_points_free_form_takes_leading_sentences() {
        let text = "First observation about markets. Second observation about rates. \
                    Third observation about housing. Fourth is ignored.";
        let points = extract_key_points(text, &[]);
        assert_eq!(points.len(), 3);
        assert!(points[0].contains("First observation"));
    }

    // ========================================================================
    // Message building tests
    // ========================================================================

    #[test]
    fn test_build_messages_includes_history_tail() {
        use crate::config::InferenceConfig;
        use crate::router::{ConversationTurn, IntentSource, RouteType};

        let synthesizer = Synthesizer::new(
            InferenceClient::new(&InferenceConfig {
                api_key: "k".to_string(),
                ..InferenceConfig::default()
            })
            .unwrap(),
            ContextConfig {
                max_history_turns: 2,
                ..ContextConfig::default()
            },
        );

        let history: Vec<ConversationTurn> = (0..5)
            .map(|i| ConversationTurn::user(format!("turn {}", i)))
            .collect();
        let question = Question::new("current question").with_history(history);
        let decision = RoutingDecision {
            route: RouteType::General,
            country: "GLOBAL".to_string(),
            symbol: None,
            sql_need: true,
            graph_need: true,
            web_allowed: true,
            agents: vec![],
            intent_source: IntentSource::Heuristic,
        };

        let messages =
            synthesizer.build_messages(&question, &decision, &StructuredDataContext::default());
        // system + 2 history turns + final user message
        assert_eq!(messages.len(), 4);
        assert!(messages[1].content.contains("turn 3"));
        assert!(messages[2].content.contains("turn 4"));
        assert!(messages[3].content.contains("current question"));
    }

    #[test]
    fn test_build_messages_adds_section_instruction_for_mandated_routes() {
        use crate::config::InferenceConfig;
        use crate::router::{IntentSource, RouteType};

        let synthesizer = Synthesizer::new(
            InferenceClient::new(&InferenceConfig {
                api_key: "k".to_string(),
                ..InferenceConfig::default()
            })
            .unwrap(),
            ContextConfig::default(),
        );

        let decision = RoutingDecision {
            route: RouteType::UsSingleStock,
            country: "US".to_string(),
            symbol: Some("AAPL".to_string()),
            sql_need: true,
            graph_need: false,
            web_allowed: true,
            agents: vec![],
            intent_source: IntentSource::Heuristic,
        };

        let messages = synthesizer.build_messages(
            &Question::new("how is the stock doing?"),
            &decision,
            &StructuredDataContext::default(),
        );
        assert!(messages[0].content.contains("Overview, Recent Performance, Key Drivers, Risks"));
    }
}
