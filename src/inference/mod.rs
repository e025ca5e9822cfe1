//! LLM inference collaborator.
//!
//! The inference endpoint is the only non-deterministic component in the
//! pipeline and is invoked at most twice per question in the steady-state
//! path: once by the router's intent classifier (and only when heuristics
//! are inconclusive) and once by the supervisor synthesizer.

mod client;
mod types;

pub use client::InferenceClient;
pub use types::*;
