//! Structured evidence context.
//!
//! All branch results for a question are merged into one
//! [`StructuredDataContext`]: a named dataset per successful branch with
//! the filters actually applied, a bounded sample of rows, and signals
//! derived once here (trend classification, lookback percentage changes,
//! event deltas) so the synthesizer never re-derives numeric facts from
//! raw rows. Building is deterministic: the same branch results always
//! produce the same context.

mod budget;
mod builder;
mod humanize;

pub use budget::ContextBudgeter;
pub use builder::ContextBuilder;
pub use humanize::IdentifierHumanizer;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::branches::NormalizedPassage;
use crate::router::DatasetKind;
use crate::stores::{Row, WebHit};

/// Trend classification over a numeric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendClass {
    /// The recent window sits above the prior window.
    Rising,
    /// The recent window sits below the prior window.
    Falling,
    /// The windows differ by less than the flat threshold.
    Flat,
}

impl TrendClass {
    /// Get the trend as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendClass::Rising => "rising",
            TrendClass::Falling => "falling",
            TrendClass::Flat => "flat",
        }
    }

    /// Templated trend sentence used when the model omits one.
    pub fn sentence(&self, subject: &str) -> String {
        match self {
            TrendClass::Rising => format!("Over the covered periods, {} shows a rising trend.", subject),
            TrendClass::Falling => {
                format!("Over the covered periods, {} shows a falling trend.", subject)
            }
            TrendClass::Flat => format!(
                "Over the covered periods, {} has stayed broadly flat.",
                subject
            ),
        }
    }
}

impl std::fmt::Display for TrendClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Before/after delta around a dated event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventDelta {
    /// The reference event date.
    pub event_date: NaiveDate,
    /// Mean value over periods before the event.
    pub before_avg: f64,
    /// Mean value over periods on/after the event.
    pub after_avg: f64,
    /// Percentage change from before to after.
    pub change_pct: f64,
}

/// Signals derived from a dataset's raw rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    /// Trend over the moving-average window, when the series is long enough.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendClass>,
    /// Percentage changes keyed by lookback ("1p", "3p", "12p" periods).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pct_changes: BTreeMap<String, f64>,
    /// Before/after delta around a reference event, when one was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_delta: Option<EventDelta>,
    /// Number of periods the series spans.
    pub periods: usize,
}

/// One dataset entry, built from one successful branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset name (the winning template id or source tag).
    pub name: String,
    /// Dataset family.
    pub kind: DatasetKind,
    /// Filters actually applied to the evidence.
    pub filters: BTreeMap<String, String>,
    /// Bounded sample of rows (never the full result set).
    pub sample_rows: Vec<Row>,
    /// Total rows the branch returned.
    pub row_count: usize,
    /// Derived signals.
    pub signals: Signals,
    /// Most recent period covered, for freshness checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_period: Option<NaiveDateTime>,
}

/// Normalized, budgeted aggregation of all branch outputs for one question.
///
/// Owned exclusively by the current question's processing and discarded
/// once the answer is produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredDataContext {
    /// One entry per successful SQL-shaped branch.
    pub datasets: Vec<Dataset>,
    /// Graph passages (citation-bearing).
    pub passages: Vec<NormalizedPassage>,
    /// Web hits (citation-bearing).
    pub web_hits: Vec<WebHit>,
    /// Attempted targets per source, for diagnosability.
    pub attempted: BTreeMap<String, Vec<String>>,
    /// Rendered-size estimate used by the budgeter.
    pub size_estimate: usize,
}

impl StructuredDataContext {
    /// Recompute the size estimate from the rendered form.
    pub fn recompute_size(&mut self) {
        self.size_estimate = self.render().len();
    }

    /// Most recent timestamp across datasets and passages.
    pub fn latest_timestamp(&self) -> Option<NaiveDateTime> {
        let dataset_latest = self.datasets.iter().filter_map(|d| d.latest_period).max();
        let passage_latest = self.passages.iter().filter_map(|p| p.timestamp).max();
        dataset_latest.max(passage_latest)
    }

    /// Whether any evidence is present at all.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.passages.is_empty() && self.web_hits.is_empty()
    }

    /// Render the context as deterministic prompt text.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for dataset in &self.datasets {
            out.push_str(&format!(
                "## Dataset: {} ({})\n",
                dataset.name,
                dataset.kind.as_str()
            ));
            if !dataset.filters.is_empty() {
                let filters: Vec<String> = dataset
                    .filters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                out.push_str(&format!("filters: {}\n", filters.join(", ")));
            }
            out.push_str(&format!(
                "rows: {} (showing {})\n",
                dataset.row_count,
                dataset.sample_rows.len()
            ));
            if let Some(trend) = dataset.signals.trend {
                out.push_str(&format!("trend: {}\n", trend));
            }
            for (lookback, pct) in &dataset.signals.pct_changes {
                out.push_str(&format!("change {}: {:+.2}%\n", lookback, pct));
            }
            if let Some(delta) = &dataset.signals.event_delta {
                out.push_str(&format!(
                    "event {}: {:.2} before vs {:.2} after ({:+.2}%)\n",
                    delta.event_date, delta.before_avg, delta.after_avg, delta.change_pct
                ));
            }
            for row in &dataset.sample_rows {
                let cells: Vec<String> =
                    row.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                out.push_str(&format!("- {}\n", cells.join(" ")));
            }
            out.push('\n');
        }

        if !self.passages.is_empty() {
            out.push_str("## Graph passages\n");
            for passage in &self.passages {
                let stamp = passage
                    .timestamp
                    .map(|t| t.format(" (%Y-%m-%d)").to_string())
                    .unwrap_or_default();
                out.push_str(&format!(
                    "- [{}]{} {}\n",
                    passage.node_id, stamp, passage.text
                ));
            }
            out.push('\n');
        }

        if !self.web_hits.is_empty() {
            out.push_str("## Web results\n");
            for hit in &self.web_hits {
                if hit.snippet.is_empty() {
                    out.push_str(&format!("- {} <{}>\n", hit.title, hit.url));
                } else {
                    out.push_str(&format!("- {} <{}> {}\n", hit.title, hit.url, hit.snippet));
                }
            }
            out.push('\n');
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> Dataset {
        Dataset {
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
            latest_period: NaiveDate::from_ymd_opt(2025, 6, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        }
    }

    #[test]
    fn test_trend_sentence() {
        let s = TrendClass::Rising.sentence("the apartment price series");
        assert!(s.contains("rising trend"));
        assert!(TrendClass::Flat.sentence("x").contains("flat"));
    }

    #[test]
    fn test_render_includes_filters_signals_and_rows() {
        let mut ctx = StructuredDataContext {
            datasets: vec![sample_dataset()],
            ..Default::default()
        };
        ctx.recompute_size();
        let rendered = ctx.render();
        assert!(rendered.contains("kr_apt_price_monthly"));
        assert!(rendered.contains("country=KR"));
        assert!(rendered.contains("trend: rising"));
        assert!(rendered.contains("change 12p: +4.20%"));
        assert!(rendered.contains("rows: 12 (showing 1)"));
        assert_eq!(ctx.size_estimate, rendered.len());
    }

    #[test]
    fn test_render_is_deterministic() {
        let ctx = StructuredDataContext {
            datasets: vec![sample_dataset()],
            passages: vec![NormalizedPassage {
                node_id: "node-1".to_string(),
                text: "Policy rate held steady.".to_string(),
                source: None,
                timestamp: None,
            }],
            ..Default::default()
        };
        assert_eq!(ctx.render(), ctx.render());
    }

    #[test]
    fn test_latest_timestamp_prefers_newest() {
        let mut ctx = StructuredDataContext {
            datasets: vec![sample_dataset()],
            ..Default::default()
        };
        ctx.passages.push(NormalizedPassage {
            node_id: "n".to_string(),
            text: "t".to_string(),
            source: None,
            timestamp: NaiveDate::from_ymd_opt(2025, 7, 15).and_then(|d| d.and_hms_opt(0, 0, 0)),
        });
        assert_eq!(
            ctx.latest_timestamp().unwrap().date(),
            NaiveDate::from_ymd_opt(2025, 7, 15).unwrap()
        );
    }

    #[test]
    fn test_empty_context() {
        let ctx = StructuredDataContext::default();
        assert!(ctx.is_empty());
        assert!(ctx.latest_timestamp().is_none());
    }
}
