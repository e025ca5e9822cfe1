//! Structured data builder.
//!
//! Consumes the branch results for one question and produces the
//! [`StructuredDataContext`] fed to the synthesizer. Derived numeric
//! signals are computed exactly once here; identifier humanization and
//! internal-token stripping also happen here so nothing downstream ever
//! sees a raw code.

use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;

use super::{Dataset, EventDelta, IdentifierHumanizer, Signals, StructuredDataContext, TrendClass};
use crate::branches::{BranchPayload, BranchResult};
use crate::config::ContextConfig;
use crate::router::RoutingDecision;
use crate::stores::Row;

/// Column names tried, in order, when locating the value series.
const VALUE_COLUMNS: [&str; 6] = [
    "avg_price",
    "close_price",
    "price_index",
    "value",
    "index_value",
    "change_pct",
];

/// Column names tried, in order, when locating the period axis.
const PERIOD_COLUMNS: [&str; 3] = ["period", "trade_date", "date"];

/// Relative change below which a series counts as flat, in percent.
const FLAT_THRESHOLD_PCT: f64 = 0.5;

/// Fixed lookback windows (in periods) for percentage changes.
const LOOKBACKS: [usize; 3] = [1, 3, 12];

/// Builds the structured context from branch results.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    config: ContextConfig,
    humanizer: IdentifierHumanizer,
}

impl ContextBuilder {
    /// Create a builder
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            humanizer: IdentifierHumanizer::new(),
        }
    }

    /// Build the context from all branch results.
    ///
    /// Deterministic and idempotent: the same results always produce the
    /// same context.
    pub fn build(
        &self,
        decision: &RoutingDecision,
        results: &[BranchResult],
    ) -> StructuredDataContext {
        self.build_with_event(decision, results, None)
    }

    /// Build the context, additionally computing before/after deltas around
    /// a reference event date.
    pub fn build_with_event(
        &self,
        decision: &RoutingDecision,
        results: &[BranchResult],
        event_date: Option<NaiveDate>,
    ) -> StructuredDataContext {
        let mut ctx = StructuredDataContext::default();

        // Source order is fixed so rebuilding is byte-stable.
        let mut ordered: Vec<&BranchResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.source);

        for result in ordered {
            ctx.attempted
                .insert(result.source.as_str().to_string(), result.attempts.clone());

            if !result.status.has_evidence() {
                continue;
            }

            match &result.payload {
                BranchPayload::Rows(rows) => {
                    let dataset = self.build_dataset(decision, result, rows, event_date);
                    ctx.datasets.push(dataset);
                }
                BranchPayload::Passages(passages) => {
                    for passage in passages {
                        let mut cleaned = passage.clone();
                        cleaned.text = self.humanizer.strip_internal_tokens(&cleaned.text);
                        ctx.passages.push(cleaned);
                    }
                }
                BranchPayload::Hits(hits) => {
                    for hit in hits {
                        let mut cleaned = hit.clone();
                        cleaned.snippet = self.humanizer.strip_internal_tokens(&cleaned.snippet);
                        ctx.web_hits.push(cleaned);
                    }
                }
                BranchPayload::None => {}
            }
        }

        ctx.recompute_size();
        debug!(
            datasets = ctx.datasets.len(),
            passages = ctx.passages.len(),
            web_hits = ctx.web_hits.len(),
            size = ctx.size_estimate,
            "Structured context built"
        );
        ctx
    }

    fn build_dataset(
        &self,
        decision: &RoutingDecision,
        result: &BranchResult,
        rows: &[Row],
        event_date: Option<NaiveDate>,
    ) -> Dataset {
        let name = result
            .attempts
            .last()
            .cloned()
            .unwrap_or_else(|| result.source.as_str().to_string());

        let series = extract_series(rows);
        let signals = self.derive_signals(&series, event_date);

        // Most recent rows make the sample; humanize before packaging.
        let mut sorted: Vec<&Row> = rows.iter().collect();
        sorted.sort_by_key(|r| period_of(r));
        let sample_rows: Vec<Row> = sorted
            .iter()
            .rev()
            .take(self.config.max_sample_rows)
            .map(|r| self.humanizer.humanize_row(r))
            .collect();

        let latest_period = sorted.last().and_then(|r| period_of(r));

        Dataset {
            name,
            kind: decision.route.profile().dataset_kind,
            filters: result.filters.clone(),
            sample_rows,
            row_count: rows.len(),
            signals,
            latest_period,
        }
    }

    /// Derive trend, lookback changes, and event deltas from a dated series.
    fn derive_signals(
        &self,
        series: &[(NaiveDateTime, f64)],
        event_date: Option<NaiveDate>,
    ) -> Signals {
        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        let n = values.len();

        let mut signals = Signals {
            periods: n,
            ..Signals::default()
        };

        if n >= 2 {
            signals.trend = Some(self.classify_trend(&values));

            for lookback in LOOKBACKS {
                if n > lookback {
                    let last = values[n - 1];
                    let base = values[n - 1 - lookback];
                    if base != 0.0 {
                        signals
                            .pct_changes
                            .insert(format!("{}p", lookback), (last - base) / base * 100.0);
                    }
                }
            }
        }

        if let Some(event) = event_date {
            signals.event_delta = event_delta(series, event);
        }

        signals
    }

    /// Classify trend by comparing the moving-average window at the end of
    /// the series against the window before it.
    fn classify_trend(&self, values: &[f64]) -> TrendClass {
        let n = values.len();
        let window = self.config.trend_window.clamp(1, n / 2).max(1);

        let recent: f64 = values[n - window..].iter().sum::<f64>() / window as f64;
        let prior_slice = &values[..n - window];
        let prior: f64 = prior_slice.iter().sum::<f64>() / prior_slice.len() as f64;

        if prior == 0.0 {
            return TrendClass::Flat;
        }
        let change_pct = (recent - prior) / prior * 100.0;
        if change_pct > FLAT_THRESHOLD_PCT {
            TrendClass::Rising
        } else if change_pct < -FLAT_THRESHOLD_PCT {
            TrendClass::Falling
        } else {
            TrendClass::Flat
        }
    }
}

/// Extract the (period, value) series from rows, sorted by period ascending.
fn extract_series(rows: &[Row]) -> Vec<(NaiveDateTime, f64)> {
    let mut series: Vec<(NaiveDateTime, f64)> = rows
        .iter()
        .filter_map(|row| {
            let period = period_of(row)?;
            let value = value_of(row)?;
            Some((period, value))
        })
        .collect();
    series.sort_by_key(|(period, _)| *period);
    series
}

fn period_of(row: &Row) -> Option<NaiveDateTime> {
    PERIOD_COLUMNS
        .iter()
        .find_map(|col| row.get_date(col))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn value_of(row: &Row) -> Option<f64> {
    VALUE_COLUMNS.iter().find_map(|col| row.get_f64(col))
}

/// Mean value before vs on/after a dated event.
fn event_delta(series: &[(NaiveDateTime, f64)], event: NaiveDate) -> Option<EventDelta> {
    let cutoff = event.and_hms_opt(0, 0, 0)?;
    let before: Vec<f64> = series
        .iter()
        .filter(|(p, _)| *p < cutoff)
        .map(|(_, v)| *v)
        .collect();
    let after: Vec<f64> = series
        .iter()
        .filter(|(p, _)| *p >= cutoff)
        .map(|(_, v)| *v)
        .collect();

    if before.is_empty() || after.is_empty() {
        return None;
    }

    let before_avg = before.iter().sum::<f64>() / before.len() as f64;
    let after_avg = after.iter().sum::<f64>() / after.len() as f64;
    if before_avg == 0.0 {
        return None;
    }

    Some(EventDelta {
        event_date: event,
        before_avg,
        after_avg,
        change_pct: (after_avg - before_avg) / before_avg * 100.0,
    })
}
