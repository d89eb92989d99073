use super::{ChatMessage, Llm, LlmResponse};
use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Provider for OpenAI-compatible chat completion endpoints.
///
/// Covers OpenAI itself plus the compatible gateways (Qwen, DeepSeek, Groq,
/// LM Studio) that expose the same `/v1/chat/completions` contract.
pub struct OpenAiCompatProvider {
    config: LlmConfig,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: u32,
}

impl OpenAiCompatProvider {
    pub fn new(config: LlmConfig, model: String) -> Result<Self> {
        if let Some(endpoint) = &config.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| PipelineError::Config(format!("bad LLM endpoint: {}", e)))?;
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            model,
            client,
        })
    }
}

#[async_trait]
impl Llm for OpenAiCompatProvider {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse> {
        let endpoint = self
            .config
            .endpoint
            .as_ref()
            .ok_or_else(|| PipelineError::Config("LLM endpoint not configured".to_string()))?;

        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        debug!("Sending chat request to {}", endpoint);

        let mut builder = self.client.post(endpoint).json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key.trim()));
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Llm(format!("API error {}: {}", status, text)));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("malformed response: {}", e)))?;

        let content = completion
            .choices
            .first()
            .ok_or_else(|| PipelineError::Llm("empty choices in response".to_string()))?
            .message
            .content
            .clone();

        let tokens_used = completion.usage.map(|u| u.total_tokens);

        Ok(LlmResponse {
            content,
            tokens_used,
        })
    }

    async fn is_available(&self) -> bool {
        let endpoint = match &self.config.endpoint {
            Some(ep) => ep,
            None => return false,
        };

        let models_endpoint = endpoint.replace("/chat/completions", "/models");

        let mut builder = self.client.get(&models_endpoint);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key.trim()));
        }

        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_request_serialization() {
        let request = CompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::user("hello")],
            max_tokens: 64,
            temperature: 0.7,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_response_deserialization() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"total_tokens": 12}
        }"#;

        let parsed: CompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
        assert_eq!(parsed.usage.unwrap().total_tokens, 12);
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_config_error() {
        let mut llm_config = Config::default().llm;
        llm_config.endpoint = None;

        let provider = OpenAiCompatProvider::new(llm_config, "m".to_string()).unwrap();
        let err = provider.chat(vec![ChatMessage::user("q")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
