//! # Finmacro Answer Orchestrator
//!
//! Retrieval-and-synthesis answer orchestrator for a financial-macro
//! assistant: routes each question to the evidence branches it needs,
//! runs them concurrently under a time budget, merges the partial results
//! into one grounded, citation-bearing answer, and streams it
//! incrementally.
//!
//! ## Features
//!
//! - **Routing**: keyword heuristics first, LLM intent classification only
//!   when inconclusive, per-route behavior profiles
//! - **Evidence branches**: SQL analytics with prioritized template
//!   fallback, knowledge-graph retrieval, web-search fallback
//! - **Structured context**: typed datasets with derived signals (trend,
//!   lookback changes, event deltas), identifier humanization, and a
//!   deterministic size budgeter
//! - **Supervised synthesis**: template-enforced sections, claim-support
//!   classification, trend-statement injection
//! - **Streaming**: NDJSON `started`/`delta`/`done`/`error` events with a
//!   single-shot fallback
//! - **Regression harness**: golden cases with a failure taxonomy
//!
//! ## Architecture
//!
//! ```text
//! Question → Router → (parallel) Branch Executors → Data Builder
//!                 ↓                                      ↓
//!          Flow Context ───────────────────────→ Supervisor Synthesizer
//!                                                        ↓
//!                                                Streaming Gateway
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use finmacro_orchestrator::{AnswerServer, AppState, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = Arc::new(AppState::new(config).await?);
//!     let server = AnswerServer::new(state);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Evidence-gathering branch executors (SQL, graph, web).
pub mod branches;
/// Configuration management for the orchestrator.
pub mod config;
/// Structured context building and budgeting.
pub mod context;
/// Error types and result aliases for the application.
pub mod error;
/// Per-invocation flow/trace context propagation.
pub mod flow;
/// Streaming gateway and event model.
pub mod gateway;
/// Regression harness with golden cases and failure taxonomy.
pub mod harness;
/// LLM inference collaborator client and types.
pub mod inference;
/// The end-to-end answer pipeline.
pub mod pipeline;
/// System prompts for the pipeline's LLM calls.
pub mod prompts;
/// Question routing and per-route behavior profiles.
pub mod router;
/// Application state and NDJSON stdio server.
pub mod server;
/// External store collaborators and boundary normalization.
pub mod stores;
/// Supervisor synthesizer producing the final grounded answer.
pub mod synthesizer;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AnswerServer, AppState, SharedState};
