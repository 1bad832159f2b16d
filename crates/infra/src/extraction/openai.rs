//! OpenAI-compatible chat-completions engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ExtractedResult, ExtractionEngine, ExtractionError, PermanentReason, TransientReason};

/// Default OpenAI API URL.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Default generation model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You extract the key information from documents. \
Reply with a concise plain-text summary of the document the user sends.";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Hard ceiling for a single HTTP exchange. The Extraction Client applies
    /// its own, usually tighter, deadline on top.
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct OpenAiEngine {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiEngine {
    pub fn new(config: OpenAiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        info!(base_url = %config.base_url, model = %config.model, "initializing extraction engine");
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Classify a non-success HTTP status.
fn classify_status(status: StatusCode, message: String) -> ExtractionError {
    match status.as_u16() {
        408 => ExtractionError::transient(TransientReason::Timeout, message),
        429 => ExtractionError::transient(TransientReason::RateLimited, message),
        500..=599 => ExtractionError::transient(TransientReason::EngineUnavailable, message),
        413 => ExtractionError::permanent(PermanentReason::InputTooLarge, message),
        415 => ExtractionError::permanent(PermanentReason::UnsupportedFormat, message),
        400 | 422 => ExtractionError::permanent(PermanentReason::MalformedInput, message),
        _ => ExtractionError::permanent(PermanentReason::Rejected, message),
    }
}

fn classify_transport(err: reqwest::Error) -> ExtractionError {
    if err.is_timeout() {
        ExtractionError::transient(TransientReason::Timeout, err.to_string())
    } else {
        ExtractionError::transient(TransientReason::Network, err.to_string())
    }
}

#[async_trait]
impl ExtractionEngine for OpenAiEngine {
    async fn extract(&self, input: &[u8]) -> Result<ExtractedResult, ExtractionError> {
        let document = std::str::from_utf8(input).map_err(|_| {
            ExtractionError::permanent(PermanentReason::UnsupportedFormat, "document is not UTF-8 text")
        })?;
        if document.trim().is_empty() {
            return Err(ExtractionError::permanent(PermanentReason::MalformedInput, "document has no text"));
        }

        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: document,
                },
            ],
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error.message,
                Err(_) => format!("engine returned {}", status),
            };
            return Err(classify_status(status, message));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                ExtractionError::transient(TransientReason::EngineUnavailable, format!("unreadable engine reply: {}", e))
            } else {
                classify_transport(e)
            }
        })?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                ExtractionError::transient(TransientReason::EngineUnavailable, "engine returned no content")
            })?;

        debug!(chars = text.len(), "extraction complete");
        Ok(ExtractedResult::new(text))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn engine_for(server: &MockServer) -> OpenAiEngine {
        OpenAiEngine::new(OpenAiConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: Some("sk-test".to_string()),
            model: "test-model".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn completion(text: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": text }, "finish_reason": "stop" }]
        })
    }

    #[tokio::test]
    async fn returns_the_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "test-model" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("summary text")))
            .expect(1)
            .mount(&server)
            .await;

        let result = engine_for(&server).extract(b"doc-42").await.unwrap();
        assert_eq!(result, ExtractedResult::new("summary text"));
    }

    #[tokio::test]
    async fn rate_limit_and_server_errors_are_transient() {
        for (status, reason) in [
            (429, TransientReason::RateLimited),
            (503, TransientReason::EngineUnavailable),
            (408, TransientReason::Timeout),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(status).set_body_json(json!({ "error": { "message": "busy", "type": "x" } })),
                )
                .mount(&server)
                .await;

            let err = engine_for(&server).extract(b"doc").await.unwrap_err();
            assert_eq!(err, ExtractionError::transient(reason, "busy"), "status {status}");
        }
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        for (status, reason) in [
            (400, PermanentReason::MalformedInput),
            (413, PermanentReason::InputTooLarge),
            (415, PermanentReason::UnsupportedFormat),
            (401, PermanentReason::Rejected),
            (404, PermanentReason::Rejected),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;

            let err = engine_for(&server).extract(b"doc").await.unwrap_err();
            assert!(
                matches!(&err, ExtractionError::Permanent { reason: r, .. } if *r == reason),
                "status {status}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn binary_input_is_rejected_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("x")))
            .expect(0)
            .mount(&server)
            .await;

        let err = engine_for(&server).extract(&[0xff, 0xfe, 0x00]).await.unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Permanent { reason: PermanentReason::UnsupportedFormat, .. }
        ));
    }

    #[tokio::test]
    async fn unreachable_engine_is_a_network_error() {
        let engine = OpenAiEngine::new(OpenAiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Duration::from_secs(2),
            ..OpenAiConfig::default()
        })
        .unwrap();

        let err = engine.extract(b"doc").await.unwrap_err();
        assert!(err.is_transient());
    }
}
