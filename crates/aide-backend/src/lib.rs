//! Chat backend client speaking the Ollama `/api/chat` protocol.

use std::time::Duration;

use aide_protocol::{BackendError, ChatBackend, ChatRequest, ChatResponse};
use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, instrument, warn};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    /// Applied to every chat call.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|err| BackendError::Unavailable(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(&config.base_url)?,
            timeout: config.timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if err.is_connect() {
            BackendError::Unavailable(err.to_string())
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

/// Accepts a bare host (`http://localhost:11434`), an `/api` root, or the
/// full `/api/chat` endpoint.
fn chat_endpoint(base_url: &str) -> Result<Url, BackendError> {
    let sanitized = base_url.trim().trim_end_matches('/');
    let full = if sanitized.ends_with("/api/chat") {
        sanitized.to_owned()
    } else if sanitized.ends_with("/api") {
        format!("{sanitized}/chat")
    } else {
        format!("{sanitized}/api/chat")
    };
    Url::parse(&full)
        .map_err(|err| BackendError::Unavailable(format!("invalid backend URL '{base_url}': {err}")))
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    #[instrument(
        skip(self, request),
        fields(model = %request.model, messages = request.messages.len(), tools = request.tools.len())
    )]
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| err.to_string());
            warn!(status = status.as_u16(), "backend returned an error status");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;
        let parsed: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        debug!(
            tool_calls = parsed.message.tool_calls.len(),
            prompt_eval_count = parsed.prompt_eval_count,
            eval_count = parsed.eval_count,
            "backend replied"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use aide_protocol::{ChatMessage, ToolDefinition};
    use anyhow::Result;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn backend_for(server: &MockServer, timeout: Duration) -> Result<OllamaBackend> {
        Ok(OllamaBackend::new(BackendConfig {
            base_url: server.uri(),
            timeout,
            connect_timeout: Duration::from_secs(1),
        })?)
    }

    #[test]
    fn endpoint_accepts_common_base_url_shapes() -> Result<()> {
        assert_eq!(chat_endpoint("http://localhost:11434")?.path(), "/api/chat");
        assert_eq!(chat_endpoint("http://localhost:11434/")?.path(), "/api/chat");
        assert_eq!(chat_endpoint("http://gpu-box:11434/api")?.path(), "/api/chat");
        assert_eq!(chat_endpoint("http://gpu-box:11434/api/chat")?.path(), "/api/chat");
        assert!(chat_endpoint("not a url").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn sends_wire_request_and_parses_tool_calls() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.2",
                "stream": false,
                "tools": [{"type": "function", "function": {"name": "recall"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {"name": "recall", "arguments": "{\"query\":\"tea\"}"}}]
                },
                "prompt_eval_count": 120,
                "eval_count": 8
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server, Duration::from_secs(5))?;
        let request = ChatRequest::new("llama3.2", vec![ChatMessage::user("what tea do I like?")])
            .with_tools([ToolDefinition::new("recall", "Recall facts", json!({"type": "object"}))]);
        let response = backend.chat(request).await?;

        assert_eq!(response.prompt_eval_count, 120);
        assert_eq!(response.eval_count, 8);
        assert_eq!(response.message.tool_calls[0].function.name, "recall");
        Ok(())
    }

    #[tokio::test]
    async fn error_statuses_are_typed() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let backend = backend_for(&server, Duration::from_secs(5))?;
        let error = backend
            .chat(ChatRequest::new("missing", vec![ChatMessage::user("hi")]))
            .await
            .err();
        assert!(matches!(
            error,
            Some(BackendError::Status { status: 404, ref body }) if body == "model not found"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn slow_backends_time_out() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"message": {"role": "assistant", "content": "late"}}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let backend = backend_for(&server, Duration::from_millis(200))?;
        let error = backend
            .chat(ChatRequest::new("llama3.2", vec![ChatMessage::user("hi")]))
            .await
            .err();
        assert!(matches!(error, Some(BackendError::Timeout(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_backends_are_unavailable() -> Result<()> {
        let backend = OllamaBackend::new(BackendConfig {
            base_url: "http://127.0.0.1:9".to_owned(),
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
        })?;
        let error = backend
            .chat(ChatRequest::new("llama3.2", vec![ChatMessage::user("hi")]))
            .await
            .err();
        assert!(matches!(error, Some(BackendError::Unavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_bodies_fail_to_decode() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
            .mount(&server)
            .await;

        let backend = backend_for(&server, Duration::from_secs(5))?;
        let error = backend
            .chat(ChatRequest::new("llama3.2", vec![ChatMessage::user("hi")]))
            .await
            .err();
        assert!(matches!(error, Some(BackendError::Decode(_))));
        Ok(())
    }
}
