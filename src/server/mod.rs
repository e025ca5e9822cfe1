//! Server module.
//!
//! This module provides:
//! - Shared application state wiring every pipeline stage together
//! - The NDJSON stdio server loop

mod stdio;

pub use stdio::*;

use std::sync::Arc;

use crate::branches::{BranchExecutor, GraphBranch, SqlBranch, TemplateRegistry, WebBranch};
use crate::config::Config;
use crate::context::{ContextBudgeter, ContextBuilder};
use crate::error::AppResult;
use crate::gateway::StreamingGateway;
use crate::inference::InferenceClient;
use crate::pipeline::AnswerPipeline;
use crate::router::Router;
use crate::stores::{HttpGraphStore, HttpWebSearch, SqliteDataStore};
use crate::synthesizer::Synthesizer;

/// Application state shared across request handling.
///
/// Owns the assembled pipeline and its streaming facade. Collaborator
/// clients are wired in once here; request handling only reads.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQL query template registry (runtime-extensible).
    pub templates: Arc<TemplateRegistry>,
    /// The assembled answer pipeline.
    pub pipeline: Arc<AnswerPipeline>,
    /// Streaming facade over the pipeline.
    pub gateway: StreamingGateway,
}

impl AppState {
    /// Wire up collaborators and assemble the pipeline.
    pub async fn new(config: Config) -> AppResult<Self> {
        let inference = InferenceClient::new(&config.inference)?;
        let templates = Arc::new(TemplateRegistry::new());

        let sql_store = SqliteDataStore::new(&config.data_store).await?;
        let graph_store = HttpGraphStore::new(&config.graph_store)?;

        let mut branches: Vec<Arc<dyn BranchExecutor>> = vec![
            Arc::new(SqlBranch::new(Arc::new(sql_store), Arc::clone(&templates))),
            Arc::new(GraphBranch::new(
                Arc::new(graph_store),
                config.graph_store.top_k,
            )),
        ];

        if config.web_search.enabled() {
            let web = HttpWebSearch::new(&config.web_search)?;
            branches.push(Arc::new(WebBranch::new(
                Arc::new(web),
                config.web_search.max_results,
            )));
        } else {
            tracing::info!("Web search endpoint not configured; web branch disabled");
        }

        let pipeline = Arc::new(AnswerPipeline::new(
            Router::new(inference.clone(), config.routing.clone()),
            branches,
            ContextBuilder::new(config.context.clone()),
            ContextBudgeter::from_config(&config.context),
            Synthesizer::new(inference, config.context.clone()),
            &config.branch,
        ));

        let gateway = StreamingGateway::new(pipeline.clone());

        Ok(Self {
            config,
            templates,
            pipeline,
            gateway,
        })
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
