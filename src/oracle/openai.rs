use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::prompt::RelationPromptBuilder;
use super::{parse_verdict, ConfidenceOracle, EvaluationContext, OracleVerdict};
use crate::config::OracleConfig;
use crate::error::{Result, ReldiscoError};

/// Request structure for the chat completions API
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Response structure from the chat completions API
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Oracle backed by an OpenAI-compatible chat completions endpoint.
///
/// Retries rate limits (429) and server errors (5xx) with exponential
/// backoff; every other failure is returned immediately.
pub struct OpenAIOracle {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_retries: usize,
    prompts: RelationPromptBuilder,
}

impl OpenAIOracle {
    pub fn new(api_key: String, config: &OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ReldiscoError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            max_retries: config.max_retries,
            prompts: RelationPromptBuilder::new(),
        })
    }

    /// Make a single API request and return the assistant message text.
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
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
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ReldiscoError::Oracle(format!("Network error: {}", e)))?;

        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            return Err(ReldiscoError::Oracle(format!("Oracle API error {}: {}", status.as_u16(), body)));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReldiscoError::Oracle(format!("Failed to parse response: {}", e)))?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ReldiscoError::Oracle("Empty response from oracle API".to_string()))
    }

    async fn complete_with_retry(&self, system: &str, user: &str) -> Result<String> {
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.complete(system, user).await {
                Ok(text) => {
                    log::debug!("Oracle call took {:?} (attempt {})", start.elapsed(), attempt + 1);
                    return Ok(text);
                }
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, self.max_retries, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Rate limits, server errors and transport failures are worth another try.
fn is_retryable(error: &ReldiscoError) -> bool {
    let ReldiscoError::Oracle(message) = error else {
        return false;
    };
    if message.starts_with("Network error") {
        return true;
    }
    message
        .strip_prefix("Oracle API error ")
        .and_then(|rest| rest.split(':').next())
        .and_then(|code| code.trim().parse::<u16>().ok())
        .map(|code| code == 429 || (500..600).contains(&code))
        .unwrap_or(false)
}

#[async_trait]
impl ConfidenceOracle for OpenAIOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn evaluate(&self, context: &EvaluationContext) -> Result<OracleVerdict> {
        let user = self.prompts.user_prompt(context);
        let text = self
            .complete_with_retry(self.prompts.system_prompt(), &user)
            .await?;
        parse_verdict(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_new() {
        let config = OracleConfig {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_retries: 2,
            ..OracleConfig::default()
        };
        let oracle = OpenAIOracle::new("test-key".to_string(), &config).unwrap();
        assert_eq!(oracle.name(), "gpt-4o-mini");
        assert_eq!(oracle.max_retries, 2);
        assert_eq!(oracle.endpoint, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_retry_classification() {
        assert!(is_retryable(&ReldiscoError::Oracle("Oracle API error 429: slow down".into())));
        assert!(is_retryable(&ReldiscoError::Oracle("Oracle API error 503: unavailable".into())));
        assert!(is_retryable(&ReldiscoError::Oracle("Network error: reset".into())));
        assert!(!is_retryable(&ReldiscoError::Oracle("Oracle API error 401: bad key".into())));
        assert!(!is_retryable(&ReldiscoError::Oracle("Malformed oracle response".into())));
        assert!(!is_retryable(&ReldiscoError::Config("x".into())));
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    // Calls against a live endpoint need a real API key and run outside the unit suite.
}
