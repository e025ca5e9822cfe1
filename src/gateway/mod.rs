//! Streaming gateway.
//!
//! Presents the pipeline as an ordered event stream: `started`, zero or
//! more `delta` text chunks, then exactly one terminal `done` (carrying the
//! full [`AnswerResponse`]) or `error`. Chunking preserves word boundaries
//! and overall order; chunk sizes are not uniform and consumers must not
//! assume they are. The gateway never retries silently — a consumer that
//! loses the stream mid-flight re-requests via the single-shot endpoint,
//! so no synthesis is ever billed twice behind the caller's back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::SynthesisResult;
use crate::flow::FlowType;
use crate::pipeline::AnswerPipeline;
use crate::router::{Question, RoutingDecision};
use crate::synthesizer::AnswerResponse;

/// Default target size for delta chunks, in characters.
const DEFAULT_CHUNK_CHARS: usize = 48;

/// One event on the answer stream, NDJSON-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The pipeline accepted the question.
    Started,
    /// An incremental text chunk, in order.
    Delta {
        /// The chunk text.
        text: String,
    },
    /// Terminal success event carrying the full answer.
    Done {
        /// The complete answer payload.
        answer: Box<AnswerResponse>,
    },
    /// Terminal failure event.
    Error {
        /// Failure description.
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event terminates the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Encode as one NDJSON line (without trailing newline)
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Anything that can answer a question. Lets the gateway be exercised
/// without a live pipeline behind it.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    /// Produce a full answer for a question.
    async fn answer(
        &self,
        question: &Question,
        flow_type: FlowType,
    ) -> SynthesisResult<(RoutingDecision, AnswerResponse)>;
}

#[async_trait]
impl AnswerSource for AnswerPipeline {
    async fn answer(
        &self,
        question: &Question,
        flow_type: FlowType,
    ) -> SynthesisResult<(RoutingDecision, AnswerResponse)> {
        AnswerPipeline::answer(self, question, flow_type).await
    }
}

/// Streaming facade over an [`AnswerSource`].
#[derive(Clone)]
pub struct StreamingGateway {
    source: Arc<dyn AnswerSource>,
    chunk_chars: usize,
}

impl StreamingGateway {
    /// Create a gateway over an answer source
    pub fn new(source: Arc<dyn AnswerSource>) -> Self {
        Self {
            source,
            chunk_chars: DEFAULT_CHUNK_CHARS,
        }
    }

    /// Override the delta chunk target size
    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    /// Answer as an event stream.
    ///
    /// Single producer, single consumer. The stream always ends with a
    /// terminal event unless the consumer hangs up first; a hang-up stops
    /// the producer without any re-send of the synthesis payload.
    pub fn stream(&self, question: Question) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let source = Arc::clone(&self.source);
        let chunk_chars = self.chunk_chars;

        tokio::spawn(async move {
            if tx.send(StreamEvent::Started).await.is_err() {
                debug!("Stream consumer gone before start");
                return;
            }

            match source.answer(&question, FlowType::Answer).await {
                Ok((_decision, answer)) => {
                    for chunk in chunk_text(&answer.text, chunk_chars) {
                        if tx.send(StreamEvent::Delta { text: chunk }).await.is_err() {
                            // Consumer disconnected mid-stream: close
                            // without re-sending the payload.
                            info!("Stream consumer disconnected mid-delta");
                            return;
                        }
                    }
                    let _ = tx
                        .send(StreamEvent::Done {
                            answer: Box::new(answer),
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });

        rx
    }

    /// Single-shot equivalent of [`stream`](Self::stream); the retry path
    /// after a transport failure.
    pub async fn answer_once(
        &self,
        question: &Question,
    ) -> SynthesisResult<(RoutingDecision, AnswerResponse)> {
        self.source.answer(question, FlowType::Answer).await
    }
}

/// Split text into ordered chunks at word boundaries.
///
/// Concatenating the chunks reproduces the input exactly. A single token
/// longer than the target becomes its own oversized chunk rather than
/// being split mid-word.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for token in text.split_inclusive(char::is_whitespace) {
        if !current.is_empty() && current.chars().count() + token.chars().count() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(token);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
