//! Identifier humanization.
//!
//! Raw rows and passages carry internal codes (administrative region codes,
//! document ids) that must never reach the synthesizer: codes with known
//! names are replaced with the human-readable name, and internal-only
//! identifier tokens are stripped outright.

use std::collections::BTreeMap;

use crate::stores::Row;

/// Column names whose values are region codes subject to humanization.
const REGION_CODE_COLUMNS: [&str; 3] = ["region_code", "lawd_cd", "admin_code"];

/// Token prefixes that mark internal-only identifiers.
const INTERNAL_PREFIXES: [&str; 4] = ["DOC#", "LAWD_CD:", "NODE#", "__"];

/// Replaces known internal codes with readable names and strips
/// internal-only tokens.
#[derive(Debug, Clone)]
pub struct IdentifierHumanizer {
    region_names: BTreeMap<String, String>,
}

impl IdentifierHumanizer {
    /// Create a humanizer with the built-in region table.
    pub fn new() -> Self {
        let region_names = [
            ("11110", "Seoul Jongno-gu"),
            ("11680", "Seoul Gangnam-gu"),
            ("11650", "Seoul Seocho-gu"),
            ("26110", "Busan Jung-gu"),
            ("41135", "Seongnam Bundang-gu"),
        ]
        .iter()
        .map(|(code, name)| (code.to_string(), name.to_string()))
        .collect();

        Self { region_names }
    }

    /// Register an additional code → name mapping.
    pub fn register(&mut self, code: impl Into<String>, name: impl Into<String>) {
        self.region_names.insert(code.into(), name.into());
    }

    /// Look up the readable name for a region code.
    pub fn region_name(&self, code: &str) -> Option<&str> {
        self.region_names.get(code).map(|s| s.as_str())
    }

    /// Humanize region-code columns in a row. Codes without a known name
    /// are left as-is; renaming a value never drops the column.
    pub fn humanize_row(&self, row: &Row) -> Row {
        let mut out = Row::new();
        for (column, value) in row.iter() {
            let humanized = if REGION_CODE_COLUMNS.contains(&column.as_str()) {
                value
                    .as_str()
                    .and_then(|code| self.region_name(code))
                    .map(|name| serde_json::json!(name))
                    .unwrap_or_else(|| value.clone())
            } else {
                value.clone()
            };
            if REGION_CODE_COLUMNS.contains(&column.as_str()) {
                out.insert("region", humanized);
            } else {
                out.insert(column.clone(), humanized);
            }
        }
        out
    }

    /// Strip internal-only identifier tokens from free text.
    ///
    /// Tokens are whitespace-delimited; a token starting with any internal
    /// prefix is removed entirely.
    pub fn strip_internal_tokens(&self, text: &str) -> String {
        let kept: Vec<&str> = text
            .split_whitespace()
            .filter(|token| {
                !INTERNAL_PREFIXES
                    .iter()
                    .any(|prefix| token.starts_with(prefix))
            })
            .collect();
        kept.join(" ")
    }

    /// Whether a text still contains internal identifier tokens.
    pub fn contains_internal_tokens(&self, text: &str) -> bool {
        text.split_whitespace().any(|token| {
            INTERNAL_PREFIXES
                .iter()
                .any(|prefix| token.starts_with(prefix))
        })
    }
}

impl Default for IdentifierHumanizer {
    fn default() -> Self {
        Self::new()
    }
}
