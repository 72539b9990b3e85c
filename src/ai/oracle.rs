use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::retry::{RetryClass, Retryable};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl Retryable for OracleError {
    fn retry_class(&self) -> RetryClass {
        match self {
            OracleError::RateLimited(_) => RetryClass::RateLimited,
            _ => RetryClass::Transient,
        }
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        OracleError::Transport(err.to_string())
    }
}

/// External text-to-structure service. Returns the raw JSON object it
/// produced; shape validation is the caller's job.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn extract(&self, text: &str, url: &str) -> Result<serde_json::Value, OracleError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    categories: Vec<String>,
}

impl OpenAiOracle {
    pub fn new(api_key: String, model: String, categories: Vec<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            api_key,
            model,
            base_url: OPENAI_API_URL.to_string(),
            categories,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            r#"You extract facts about a single funding opportunity (grant) from web page text.
Return ONLY a JSON object with exactly these fields:
- "title": the name of the opportunity, as a string.
- "deadline": the application deadline formatted as DD-MM-YYYY, or null if the grant has no deadline.
- "category": exactly one of the following categories, or null if none fits: {}.
Never invent new categories. Example: {{"title": "Grant name", "deadline": "31-12-2024", "category": "освіта"}}"#,
            self.categories.join(", ")
        )
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn extract(&self, text: &str, url: &str) -> Result<serde_json::Value, OracleError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt(),
                },
                Message {
                    role: "user".to_string(),
                    content: format!("Page URL: {}\n\nText:\n\"{}\"", url, text),
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(OracleError::RateLimited(message));
            }
            return Err(OracleError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::Malformed("empty completion".to_string()))?;

        parse_reply(&content)
    }
}

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*").expect("valid code fence regex"))
}

/// Parses the model reply, tolerating Markdown code fences around the JSON.
pub(crate) fn parse_reply(content: &str) -> Result<serde_json::Value, OracleError> {
    let cleaned = code_fence_re().replace_all(content, "");
    let value: serde_json::Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| OracleError::Malformed(format!("{}: {}", e, cleaned.trim())))?;
    if !value.is_object() {
        return Err(OracleError::Malformed("expected a JSON object".to_string()));
    }
    Ok(value)
}
