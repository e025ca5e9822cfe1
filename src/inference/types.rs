use serde::{Deserialize, Serialize};

/// Message in a model conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction.
    System,
    /// End-user content.
    User,
    /// Prior model output.
    Assistant,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request to the chat-completion endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    /// Create a new request with model and messages
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Set the completion token cap
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Response from the chat-completion endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
}

/// A single completion choice
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
    pub finish_reason: Option<String>,
}

/// The message body of a completion choice
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    pub content: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// The text and usage extracted from a completion response
#[derive(Debug, Clone)]
pub struct Completion {
    /// The model's output text.
    pub text: String,
    /// Token usage, when the endpoint reports it.
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builders() {
        let sys = Message::system("be brief");
        assert!(matches!(sys.role, MessageRole::System));
        assert_eq!(sys.content, "be brief");

        let user = Message::user("question");
        assert!(matches!(user.role, MessageRole::User));

        let assistant = Message::assistant("answer");
        assert!(matches!(assistant.role, MessageRole::Assistant));
    }

    #[test]
    fn test_message_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::system("x")).unwrap();
        assert!(json.contains(r#""role":"system""#));
    }

    #[test]
    fn test_completion_request_builder_chain() {
        let request = CompletionRequest::new("gpt-4o-mini", vec![Message::user("hi")])
            .with_max_tokens(512)
            .with_temperature(0.2);
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.max_tokens, Some(512));
        assert_eq!(request.temperature, Some(0.2));
    }

    #[test]
    fn test_completion_request_omits_unset_fields() {
        let request = CompletionRequest::new("m", vec![]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("max_tokens"));
        assert!(!json.contains("temperature"));
    }

    #[test]
    fn test_completion_response_deserialize() {
        let json = r#"{
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
            "model": "gpt-4o-mini"
        }"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(resp.usage.unwrap().total_tokens, Some(15));
    }

    #[test]
    fn test_completion_response_minimal() {
        let json = r#"{"choices": [{"message": {"content": null}, "finish_reason": null}]}"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert!(resp.choices[0].message.content.is_none());
        assert!(resp.usage.is_none());
    }
}
