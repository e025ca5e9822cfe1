use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Branch error: {0}")]
    Branch(#[from] BranchError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Harness error: {0}")]
    Harness(#[from] HarnessError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// LLM inference endpoint errors.
///
/// The inference call is single-shot in the hot path; callers see the cost
/// of a failure directly instead of a hidden retry loop.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// External store collaborator errors (SQL / graph / web search)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQL store error: {message}")]
    Sql { message: String },

    #[error("Graph store error: {message}")]
    Graph { message: String },

    #[error("Web search error: {message}")]
    Web { message: String },

    #[error("Timestamp coercion failed: {value}")]
    Temporal { value: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Branch execution errors.
///
/// `Store` errors are recovered locally by falling through to the next
/// ranked candidate; `Timeout` is recovered by proceeding without the
/// branch. Neither aborts a question.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("Branch store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Branch {branch} timed out after {timeout_ms}ms")]
    Timeout { branch: String, timeout_ms: u64 },

    #[error("Branch {branch} cannot run: {message}")]
    Unavailable { branch: String, message: String },
}

/// Routing errors
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Intent classification failed: {message}")]
    Classification { message: String },

    #[error("Classifier returned unusable output: {message}")]
    InvalidClassification { message: String },
}

/// Synthesis errors, surfaced to the caller as a terminal error event
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Model returned an empty completion")]
    EmptyCompletion,

    #[error("Failed to assemble answer: {message}")]
    Assembly { message: String },
}

/// Regression harness errors
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Fixture error: {message}")]
    Fixture { message: String },

    #[error("Evaluator error for case {case_id}: {message}")]
    Evaluator { case_id: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RoutingError> for SynthesisError {
    fn from(err: RoutingError) -> Self {
        SynthesisError::Assembly {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for synthesis operations
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_inference_error_display() {
        let err = InferenceError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 401 - unauthorized");

        let err = InferenceError::InvalidResponse {
            message: "malformed JSON".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid response: malformed JSON");

        let err = InferenceError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Sql {
            message: "table missing".to_string(),
        };
        assert_eq!(err.to_string(), "SQL store error: table missing");

        let err = StoreError::Temporal {
            value: "not-a-date".to_string(),
        };
        assert_eq!(err.to_string(), "Timestamp coercion failed: not-a-date");
    }

    #[test]
    fn test_branch_error_display() {
        let err = BranchError::Timeout {
            branch: "graph".to_string(),
            timeout_ms: 8000,
        };
        assert_eq!(err.to_string(), "Branch graph timed out after 8000ms");

        let err = BranchError::Unavailable {
            branch: "web".to_string(),
            message: "no endpoint configured".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Branch web cannot run: no endpoint configured"
        );
    }

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::Classification {
            message: "endpoint down".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Intent classification failed: endpoint down"
        );
    }

    #[test]
    fn test_synthesis_error_display() {
        let err = SynthesisError::EmptyCompletion;
        assert_eq!(err.to_string(), "Model returned an empty completion");

        let err = SynthesisError::Assembly {
            message: "no datasets".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to assemble answer: no datasets");
    }

    #[test]
    fn test_harness_error_display() {
        let err = HarnessError::Fixture {
            message: "file not found".to_string(),
        };
        assert_eq!(err.to_string(), "Fixture error: file not found");

        let err = HarnessError::Evaluator {
            case_id: "case-3".to_string(),
            message: "panic".to_string(),
        };
        assert_eq!(err.to_string(), "Evaluator error for case case-3: panic");
    }

    #[test]
    fn test_store_error_conversion_to_app_error() {
        let store_err = StoreError::Sql {
            message: "boom".to_string(),
        };
        let app_err: AppError = store_err.into();
        assert!(matches!(app_err, AppError::Store(_)));
    }

    #[test]
    fn test_inference_error_conversion_to_synthesis_error() {
        let inf_err = InferenceError::Timeout { timeout_ms: 1000 };
        let syn_err: SynthesisError = inf_err.into();
        assert!(matches!(syn_err, SynthesisError::Inference(_)));
        assert!(syn_err.to_string().contains("1000ms"));
    }

    #[test]
    fn test_branch_error_conversion_to_app_error() {
        let branch_err = BranchError::Timeout {
            branch: "sql".to_string(),
            timeout_ms: 500,
        };
        let app_err: AppError = branch_err.into();
        assert!(matches!(app_err, AppError::Branch(_)));
    }

    #[test]
    fn test_synthesis_error_conversion_to_app_error() {
        let syn_err = SynthesisError::EmptyCompletion;
        let app_err: AppError = syn_err.into();
        assert!(matches!(app_err, AppError::Synthesis(_)));
    }

    #[test]
    fn test_routing_error_conversion_to_synthesis_error() {
        let routing_err = RoutingError::Classification {
            message: "bad output".to_string(),
        };
        let syn_err: SynthesisError = routing_err.into();
        assert!(matches!(syn_err, SynthesisError::Assembly { .. }));
    }
}
