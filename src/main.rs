use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use finmacro_orchestrator::{
    config::Config,
    gateway::StreamEvent,
    harness::{load_cases, RegressionHarness},
    router::Question,
    server::{AnswerServer, AppState},
};

#[derive(Parser)]
#[command(name = "finmacro-orchestrator", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the NDJSON stdio server
    Serve,
    /// Answer a single question and print the event stream
    Ask {
        /// The question text
        question: String,
        /// Explicit country scope
        #[arg(long)]
        country: Option<String>,
        /// Explicit focus symbol
        #[arg(long)]
        symbol: Option<String>,
        /// Stream deltas instead of a single done event
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Replay the golden regression cases
    Regress {
        /// Path to the JSON fixture file
        #[arg(long, default_value = "./fixtures/golden_cases.json")]
        fixtures: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    let cli = Cli::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Finmacro orchestrator starting..."
    );

    let state = match AppState::new(config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to initialize application state");
            return Err(e.into());
        }
    };

    match cli.command {
        Command::Serve => {
            let server = AnswerServer::new(state);
            if let Err(e) = server.run().await {
                error!(error = %e, "Server error");
                return Err(e.into());
            }
            info!("Server shutdown complete");
        }
        Command::Ask {
            question,
            country,
            symbol,
            stream,
        } => {
            let mut q = Question::new(question);
            if let Some(country) = country {
                q = q.with_country(country);
            }
            if let Some(symbol) = symbol {
                q = q.with_symbol(symbol);
            }

            if stream {
                let mut rx = state.gateway.stream(q);
                while let Some(event) = rx.recv().await {
                    println!("{}", event.to_ndjson()?);
                }
            } else {
                match state.gateway.answer_once(&q).await {
                    Ok((_decision, answer)) => {
                        let event = StreamEvent::Done {
                            answer: Box::new(answer),
                        };
                        println!("{}", event.to_ndjson()?);
                    }
                    Err(e) => {
                        let event = StreamEvent::Error {
                            message: e.to_string(),
                        };
                        println!("{}", event.to_ndjson()?);
                        std::process::exit(1);
                    }
                }
            }
        }
        Command::Regress { fixtures } => {
            let cases = load_cases(&fixtures)?;
            info!(cases = cases.len(), fixtures = %fixtures.display(), "Running regression suite");

            let harness = RegressionHarness::new(
                state.pipeline.clone(),
                state.config.harness.clone(),
            );
            let report = harness.run(&cases).await;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        finmacro_orchestrator::config::LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        finmacro_orchestrator::config::LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
