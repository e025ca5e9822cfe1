//! External store collaborators.
//!
//! The orchestrator core talks to three read-only evidence stores: a SQL
//! analytics store, a knowledge-graph store, and a web-search endpoint.
//! Each sits behind a trait so branch executors stay uniform and tests can
//! substitute fakes. Two boundary normalizations live here because every
//! branch depends on them:
//!
//! - [`Row`]: column access is case-insensitive, since different drivers
//!   return differing casing for the same logical column.
//! - [`coerce_utc_naive`]: graph timestamps arrive as ISO strings (with or
//!   without sub-second precision or offsets), store-native temporal
//!   objects, or chrono datetimes, and are all folded into one UTC-naive
//!   representation before any recency math.

mod http;
mod sqlite;

pub use http::{HttpGraphStore, HttpWebSearch};
pub use sqlite::SqliteDataStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{StoreError, StoreResult};

/// A single result row with case-insensitive column access.
///
/// Keys are folded to lowercase on insert; lookups fold the requested name
/// the same way, so `TABLE_NAME` and `table_name` resolve identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<String, serde_json::Value>,
}

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from (column, value) pairs
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let mut row = Self::new();
        for (key, value) in pairs {
            row.insert(key, value);
        }
        row
    }

    /// Insert a value under a case-folded column name
    pub fn insert(&mut self, column: impl Into<String>, value: serde_json::Value) {
        self.columns.insert(column.into().to_lowercase(), value);
    }

    /// Look up a column, ignoring case
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.columns.get(&column.to_lowercase())
    }

    /// Look up a column as a string
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(|v| v.as_str())
    }

    /// Look up a column as a float, accepting numeric strings
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.replace(',', "").parse().ok(),
            _ => None,
        }
    }

    /// Look up a column as a date (`YYYY-MM-DD` or full datetime)
    pub fn get_date(&self, column: &str) -> Option<NaiveDate> {
        let raw = self.get_str(column)?;
        coerce_utc_naive(&TemporalValue::Iso(raw.to_string()))
            .ok()
            .map(|dt| dt.date())
    }

    /// Number of columns in the row
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate columns in deterministic (sorted) order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.columns.iter()
    }
}

/// A store-native temporal object, as some graph drivers return instead of
/// ISO strings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NativeTemporal {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
    #[serde(default)]
    pub nanosecond: u32,
    /// Offset from UTC in seconds, when the store reports one.
    #[serde(default)]
    pub tz_offset_seconds: Option<i32>,
}

impl NativeTemporal {
    /// Convert to a naive datetime in the store's local representation.
    pub fn to_native(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)?
            .and_hms_nano_opt(self.hour, self.minute, self.second, self.nanosecond)
    }
}

/// A timestamp as delivered by a collaborator, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum TemporalValue {
    /// ISO-8601 string, with or without sub-second precision or offset.
    Iso(String),
    /// Already-naive datetime.
    Naive(NaiveDateTime),
    /// Timezone-aware datetime.
    Aware(DateTime<Utc>),
    /// Store-native temporal object.
    Native(NativeTemporal),
}

impl<'de> Deserialize<'de> for TemporalValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Ok(TemporalValue::Iso(s)),
            other => serde_json::from_value::<NativeTemporal>(other)
                .map(TemporalValue::Native)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for TemporalValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            TemporalValue::Iso(s) => serializer.serialize_str(s),
            TemporalValue::Naive(dt) => {
                serializer.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            TemporalValue::Aware(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            TemporalValue::Native(n) => n.serialize(serializer),
        }
    }
}

/// Normalize any collaborator timestamp into UTC-naive.
///
/// Total over the forms stores actually emit: ISO strings down to
/// nanosecond precision (with or without offset), bare dates, native
/// temporal objects (offset applied when present), naive datetimes, and
/// timezone-aware datetimes.
pub fn coerce_utc_naive(value: &TemporalValue) -> StoreResult<NaiveDateTime> {
    match value {
        TemporalValue::Naive(dt) => Ok(*dt),
        TemporalValue::Aware(dt) => Ok(dt.naive_utc()),
        TemporalValue::Native(native) => {
            let local = native.to_native().ok_or_else(|| StoreError::Temporal {
                value: format!("{:?}", native),
            })?;
            let offset = native.tz_offset_seconds.unwrap_or(0);
            Ok(local - chrono::Duration::seconds(offset as i64))
        }
        TemporalValue::Iso(raw) => {
            let trimmed = raw.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                return Ok(dt.naive_utc());
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
                    return Ok(dt);
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                    return Ok(dt);
                }
            }
            Err(StoreError::Temporal {
                value: trimmed.to_string(),
            })
        }
    }
}

/// A retrieved knowledge-graph passage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPassage {
    /// Graph node identifier.
    pub node_id: String,
    /// Passage text.
    pub text: String,
    /// Source document or feed, when known.
    #[serde(default)]
    pub source: Option<String>,
    /// Publication/ingestion timestamp in whatever form the store emits.
    #[serde(default)]
    pub timestamp: Option<TemporalValue>,
}

/// A web-search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Read-only SQL analytics store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SqlStore: Send + Sync {
    /// Run a query with positional binds, returning case-insensitive rows.
    async fn query(&self, sql: &str, binds: &[String]) -> StoreResult<Vec<Row>>;
}

/// Read-only knowledge-graph store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Retrieve passages relevant to a query within a country scope.
    async fn retrieve(
        &self,
        query: &str,
        country: &str,
        top_k: usize,
    ) -> StoreResult<Vec<GraphPassage>>;
}

/// Web-search fallback collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Search the web for a query.
    async fn search(&self, query: &str, max_results: usize) -> StoreResult<Vec<WebHit>>;
}
