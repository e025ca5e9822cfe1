//! NDJSON stdio server.
//!
//! Reads one JSON request per line from stdin and writes line-delimited
//! stream events to stdout. Every request receives a terminal `done` or
//! `error` event; a stream is never left open. Requests default to
//! streaming; `"stream": false` selects the single-shot path, which is
//! also the caller's retry path after a transport failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use super::SharedState;
use crate::gateway::StreamEvent;
use crate::router::{ConversationTurn, Question};

/// One request line on stdin.
#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    /// Caller-chosen correlation id, echoed on every event.
    #[serde(default)]
    pub id: Option<Value>,
    /// The question text.
    pub question: String,
    /// Explicit country scope.
    #[serde(default)]
    pub country: Option<String>,
    /// Explicit focus symbol.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Prior conversation turns.
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    /// Streaming (default) or single-shot.
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

impl AnswerRequest {
    /// Convert into the pipeline's question type
    pub fn into_question(self) -> (Option<Value>, bool, Question) {
        let mut question = Question::new(self.question).with_history(self.history);
        if let Some(country) = self.country {
            question = question.with_country(country);
        }
        if let Some(symbol) = self.symbol {
            question = question.with_symbol(symbol);
        }
        (self.id, self.stream, question)
    }
}

/// An event line on stdout: the stream event plus the request correlation id.
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Value>,
    #[serde(flatten)]
    event: &'a StreamEvent,
}

/// NDJSON server running over stdio.
pub struct AnswerServer {
    state: SharedState,
}

impl AnswerServer {
    /// Create a new server
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the server until stdin reaches EOF.
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Answer server ready, waiting for requests on stdin...");

        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            // EOF reached
            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            match serde_json::from_str::<AnswerRequest>(trimmed) {
                Ok(request) => {
                    self.handle_request(request, &mut stdout).await?;
                }
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    let event = StreamEvent::Error {
                        message: format!("Parse error: {}", e),
                    };
                    write_event(&mut stdout, None, &event).await?;
                }
            }
        }

        Ok(())
    }

    /// Handle one request, writing its full event sequence.
    async fn handle_request<W>(&self, request: AnswerRequest, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let (id, stream, question) = request.into_question();

        if stream {
            let mut rx = self.state.gateway.stream(question);
            while let Some(event) = rx.recv().await {
                write_event(out, id.as_ref(), &event).await?;
            }
        } else {
            let event = match self.state.gateway.answer_once(&question).await {
                Ok((_decision, answer)) => StreamEvent::Done {
                    answer: Box::new(answer),
                },
                Err(e) => StreamEvent::Error {
                    message: e.to_string(),
                },
            };
            write_event(out, id.as_ref(), &event).await?;
        }

        Ok(())
    }
}

async fn write_event<W>(out: &mut W, id: Option<&Value>, event: &StreamEvent) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(&EventLine { id, event })?;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_minimal() {
        let request: AnswerRequest = serde_json::from_str(r#"{"question": "hello"}"#).unwrap();
        assert_eq!(request.question, "hello");
        assert!(request.stream);
        assert!(request.id.is_none());
    }

    #[test]
    fn test_request_parses_full() {
        let request: AnswerRequest = serde_json::from_str(
            r#"{
                "id": 7,
                "question": "how is the stock doing?",
                "country": "US",
                "symbol": "AAPL",
                "history": [{"role": "user", "text": "hi"}],
                "stream": false
            }"#,
        )
        .unwrap();
        assert_eq!(request.id, Some(serde_json::json!(7)));
        assert!(!request.stream);

        let (id, stream, question) = request.into_question();
        assert_eq!(id, Some(serde_json::json!(7)));
        assert!(!stream);
        assert_eq!(question.country.as_deref(), Some("US"));
        assert_eq!(question.symbol.as_deref(), Some("AAPL"));
        assert_eq!(question.history.len(), 1);
    }

    #[test]
    fn test_event_line_includes_id_and_flattened_event() {
        let id = serde_json::json!("req-1");
        let event = StreamEvent::Delta {
            text: "chunk".to_string(),
        };
        let line = serde_json::to_string(&EventLine {
            id: Some(&id),
            event: &event,
        })
        .unwrap();
        assert_eq!(line, r#"{"id":"req-1","type":"delta","text":"chunk"}"#);
    }

    #[tokio::test]
    async fn test_write_event_emits_one_line() {
        let mut buffer = Vec::new();
        let event = StreamEvent::Started;
        write_event(&mut buffer, None, &event).await.unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "{\"type\":\"started\"}\n");
    }
}
