//! OpenAI-compatible chat completions client

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::AppState;

const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 1_000;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

/// Client for the hosted LLM
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(http: Client, api_base: &str, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_url: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Client for the configured provider; 503 when no key is set
    pub fn from_state(state: &AppState) -> Result<Self> {
        let api_key = state
            .config
            .llm_api_key
            .as_deref()
            .ok_or(AppError::NotConfigured("AI assistant"))?;
        Ok(Self::new(
            state.http.clone(),
            &state.config.llm_api_base,
            api_key,
            &state.config.llm_model,
        ))
    }

    /// Ask for a JSON object and return it parsed
    ///
    /// Transport and API failures are upstream errors (502); a reply that is
    /// not a JSON object is an [`AppError::AiResponse`].
    pub async fn chat_json(&self, system: &str, user: &str) -> Result<Value> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("LLM responded with {}", status);

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Upstream(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::AiResponse(format!("unreadable completion: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::AiResponse("completion contained no message".to_string()))?;

        parse_json_content(&content)
    }
}

/// Parse model output, tolerating a Markdown code fence around the JSON
pub fn parse_json_content(content: &str) -> Result<Value> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(unfenced)
        .map_err(|e| AppError::AiResponse(format!("{}: {}", e, content)))?;

    if !value.is_object() {
        return Err(AppError::AiResponse(format!("expected a JSON object: {}", content)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_content() {
        assert_eq!(parse_json_content(r#"{"a":1}"#).unwrap()["a"], 1);
        assert_eq!(parse_json_content("```json\n{\"a\":2}\n```").unwrap()["a"], 2);
        assert_eq!(parse_json_content("```\n{\"a\":3}\n```").unwrap()["a"], 3);
    }

    #[test]
    fn test_parse_json_content_rejects_non_objects() {
        assert!(matches!(
            parse_json_content("Sure! Here is your event."),
            Err(AppError::AiResponse(_))
        ));
        assert!(matches!(parse_json_content("[1, 2]"), Err(AppError::AiResponse(_))));
    }

    #[test]
    fn test_api_url() {
        let client = LlmClient::new(Client::new(), "https://llm.example.com/v1/", "k", "m");
        assert_eq!(client.api_url, "https://llm.example.com/v1/chat/completions");
    }
}
