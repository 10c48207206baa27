use crate::error::{ExtractionError, Result};
use crate::llm::client::{Oracle, OracleError};
use crate::llm::types::{OracleReply, OracleRequest, TokenUsage};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl OracleSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Reads `ORACLE_API_KEY` (or `OPENAI_API_KEY`), `ORACLE_BASE_URL`,
    /// `ORACLE_MODEL` and `ORACLE_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ORACLE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                ExtractionError::ConfigurationError(
                    "ORACLE_API_KEY or OPENAI_API_KEY must be set".to_string(),
                )
            })?;

        let mut settings = Self::new(api_key);
        if let Ok(base_url) = std::env::var("ORACLE_BASE_URL") {
            settings.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("ORACLE_MODEL") {
            settings.model = model;
        }
        if let Ok(secs) = std::env::var("ORACLE_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                ExtractionError::ConfigurationError(format!(
                    "ORACLE_TIMEOUT_SECS is not a number: {}",
                    secs
                ))
            })?;
            settings.timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Oracle backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    client: Client,
    settings: OracleSettings,
}

impl ChatCompletionsClient {
    pub fn new(settings: OracleSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { client, settings })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }
}

#[async_trait]
impl Oracle for ChatCompletionsClient {
    async fn complete(&self, request: &OracleRequest) -> std::result::Result<OracleReply, OracleError> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let payload = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if !status.is_success() {
            let err_text = res.text().await.unwrap_or_default();
            return Err(status_error(status, &err_text));
        }

        let body: ChatResponse = res
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("Unreadable completion body: {}", e)))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::Malformed("No content in completion".to_string()))?;

        debug!("Completion from {}: {} chars", self.settings.model, text.len());

        Ok(OracleReply {
            text,
            usage: body.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }
}

fn transport_error(e: reqwest::Error) -> OracleError {
    if e.is_timeout() {
        OracleError::Timeout
    } else {
        OracleError::Unavailable(e.to_string())
    }
}

/// Auth, quota and server failures end the document; a rejected request only costs the field.
fn status_error(status: StatusCode, body: &str) -> OracleError {
    let message = format!("status {}: {}", status, body);
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        OracleError::Timeout
    } else if status.is_server_error()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::NOT_FOUND
    {
        OracleError::Unavailable(message)
    } else {
        OracleError::Malformed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_error(StatusCode::GATEWAY_TIMEOUT, ""),
            OracleError::Timeout
        );
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "bad key"),
            OracleError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "context too long"),
            OracleError::Malformed(_)
        ));
    }

    #[test]
    fn test_request_payload_shape() {
        let payload = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.0,
            max_tokens: 10,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
