use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub inference: InferenceConfig,
    pub data_store: DataStoreConfig,
    pub graph_store: GraphStoreConfig,
    pub web_search: WebSearchConfig,
    pub routing: RoutingConfig,
    pub context: ContextConfig,
    pub branch: BranchConfig,
    pub harness: HarnessConfig,
    pub logging: LoggingConfig,
}

/// LLM inference endpoint configuration
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

/// SQL data store configuration
#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Graph store collaborator configuration
#[derive(Debug, Clone)]
pub struct GraphStoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub top_k: usize,
}

/// Web search fallback configuration.
///
/// An empty base URL disables the web branch entirely.
#[derive(Debug, Clone)]
pub struct WebSearchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_results: usize,
}

/// Routing policy configuration
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// ISO country code of the home market.
    pub home_market: String,
    /// Keywords that force the home-market scope even when unspecified.
    pub home_hint_keywords: Vec<String>,
}

/// Context building and budgeting configuration.
///
/// These are operationally tuned values; defaults here are starting points,
/// not the tuned production numbers.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Target size (chars) for the budgeted context handed to the synthesizer.
    pub max_chars: usize,
    /// Sample rows kept per dataset.
    pub max_sample_rows: usize,
    /// Moving-average window used for trend classification.
    pub trend_window: usize,
    /// Minimum number of periods before a trend statement is required.
    pub min_trend_periods: usize,
    /// Conversation-history turns included in the synthesis prompt.
    pub max_history_turns: usize,
}

/// Branch execution configuration
#[derive(Debug, Clone)]
pub struct BranchConfig {
    /// Per-branch timeout; a branch that exceeds it contributes a degraded result.
    pub timeout_ms: u64,
}

/// Regression harness configuration
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Default staleness bound for freshness checks, overridable per case.
    pub max_staleness_days: i64,
    /// Cap on failing-case debug entries kept in a run report.
    pub max_debug_entries: usize,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let inference = InferenceConfig {
            api_key: env::var("INFERENCE_API_KEY").map_err(|_| AppError::Config {
                message: "INFERENCE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("INFERENCE_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            model: env::var("INFERENCE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout_ms: env_parse("INFERENCE_TIMEOUT_MS", 30000),
            max_tokens: env_parse("INFERENCE_MAX_TOKENS", 2000),
        };

        let data_store = DataStoreConfig {
            path: PathBuf::from(
                env::var("DATA_STORE_PATH").unwrap_or_else(|_| "./data/analytics.db".to_string()),
            ),
            max_connections: env_parse("DATA_STORE_MAX_CONNECTIONS", 5),
        };

        let graph_store = GraphStoreConfig {
            base_url: env::var("GRAPH_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:7474".to_string()),
            api_key: env::var("GRAPH_STORE_API_KEY").ok(),
            top_k: env_parse("GRAPH_STORE_TOP_K", 6),
        };

        let web_search = WebSearchConfig {
            base_url: env::var("WEB_SEARCH_URL").unwrap_or_default(),
            api_key: env::var("WEB_SEARCH_API_KEY").ok(),
            max_results: env_parse("WEB_SEARCH_MAX_RESULTS", 5),
        };

        let routing = RoutingConfig {
            home_market: env::var("HOME_MARKET").unwrap_or_else(|_| "KR".to_string()),
            home_hint_keywords: env::var("HOME_HINT_KEYWORDS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| {
                    ["domestic", "home market", "korea", "korean", "seoul", "kospi"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
        };

        let context = ContextConfig {
            max_chars: env_parse("CONTEXT_MAX_CHARS", 6000),
            max_sample_rows: env_parse("CONTEXT_MAX_SAMPLE_ROWS", 8),
            trend_window: env_parse("CONTEXT_TREND_WINDOW", 3),
            min_trend_periods: env_parse("CONTEXT_MIN_TREND_PERIODS", 3),
            max_history_turns: env_parse("CONTEXT_MAX_HISTORY_TURNS", 6),
        };

        let branch = BranchConfig {
            timeout_ms: env_parse("BRANCH_TIMEOUT_MS", 8000),
        };

        let harness = HarnessConfig {
            max_staleness_days: env_parse("FRESHNESS_MAX_AGE_DAYS", 45),
            max_debug_entries: env_parse("HARNESS_MAX_DEBUG_ENTRIES", 20),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(Config {
            inference,
            data_store,
            graph_store,
            web_search,
            routing,
            context,
            branch,
            harness,
            logging,
        })
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 30000,
            max_tokens: 2000,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            home_market: "KR".to_string(),
            home_hint_keywords: ["domestic", "home market", "korea", "korean", "seoul", "kospi"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: 6000,
            max_sample_rows: 8,
            trend_window: 3,
            min_trend_periods: 3,
            max_history_turns: 6,
        }
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self { timeout_ms: 8000 }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_staleness_days: 45,
            max_debug_entries: 20,
        }
    }
}

impl WebSearchConfig {
    /// Whether the web branch can run at all.
    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }
}
