//! LLM client with schema-constrained structured output
//!
//! The orchestrator and step executor only ever talk to the [`LlmClient`]
//! trait; the shipped implementation targets the Anthropic Messages API and
//! forces a tool call so every response is valid JSON for the stage's
//! declared schema.

use std::time::Instant;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{EngineError, Result};

/// Model tier a prompt template selects; resolved to a concrete model id by
/// the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Weak,
    Planning,
    Developer,
}

impl Default for ModelTier {
    fn default() -> Self {
        Self::Planning
    }
}

/// Concrete model ids per tier, env-overridable
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub weak_model: String,
    pub planning_model: String,
    pub developer_model: String,
    pub max_tokens: u32,
}

impl LlmSettings {
    pub fn from_env() -> Self {
        let get = |var: &str, default: &str| {
            std::env::var(var).unwrap_or_else(|_| default.to_string())
        };
        Self {
            weak_model: get("ANTHROPIC_WEAK_MODEL", "claude-haiku-4-5"),
            planning_model: get("ANTHROPIC_PLANNING_MODEL", "claude-sonnet-4-5"),
            developer_model: get("ANTHROPIC_DEVELOPER_MODEL", "claude-sonnet-4-5"),
            max_tokens: std::env::var("ANTHROPIC_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4096),
        }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Weak => &self.weak_model,
            ModelTier::Planning => &self.planning_model,
            ModelTier::Developer => &self.developer_model,
        }
    }
}

/// A message in the conversation sent to the model
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Tool definition used to force structured output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters
    pub parameters: Value,
}

/// Token and latency accounting for one LLM call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub elapsed_ms: u64,
}

/// Structured-output invocation contract
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Invoke the model with a forced tool call; returns the tool's input
    /// value plus usage metrics. The value is not yet validated against the
    /// target schema type.
    async fn invoke_structured(
        &self,
        messages: &[ConversationMessage],
        system_prompt: &str,
        tool: &ToolDefinition,
        tier: ModelTier,
        temperature: f32,
    ) -> AnyResult<(Value, LlmUsage)>;

    /// Concrete model id for a tier, for telemetry
    fn model_for(&self, tier: ModelTier) -> String;

    fn provider_name(&self) -> &str;
}

/// Invoke a structured call and validate the result into the target schema
/// type. A value the schema rejects is a hard failure of that stage, never a
/// silently substituted default.
pub async fn invoke<T: serde::de::DeserializeOwned>(
    client: &dyn LlmClient,
    messages: &[ConversationMessage],
    system_prompt: &str,
    tool: &ToolDefinition,
    tier: ModelTier,
    temperature: f32,
) -> Result<(T, LlmUsage)> {
    let (value, usage) = client
        .invoke_structured(messages, system_prompt, tool, tier, temperature)
        .await
        .map_err(EngineError::Llm)?;

    let parsed = serde_json::from_value::<T>(value.clone()).map_err(|e| {
        error!(
            "Structured output failed validation for tool '{}': {e}",
            tool.name
        );
        debug!("Rejected tool input: {value}");
        EngineError::StructuredOutput {
            schema: tool.name.clone(),
            message: e.to_string(),
        }
    })?;

    Ok((parsed, usage))
}

/// Anthropic Claude client
pub struct AnthropicClient {
    api_key: String,
    client: reqwest::Client,
    settings: LlmSettings,
}

impl AnthropicClient {
    pub fn new(api_key: String, settings: LlmSettings) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn from_env() -> AnyResult<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key, LlmSettings::from_env()))
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn invoke_structured(
        &self,
        messages: &[ConversationMessage],
        system_prompt: &str,
        tool: &ToolDefinition,
        tier: ModelTier,
        temperature: f32,
    ) -> AnyResult<(Value, LlmUsage)> {
        let model = self.settings.model_for(tier);

        let start = Instant::now();
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&serde_json::json!({
                "model": model,
                "max_tokens": self.settings.max_tokens,
                "system": system_prompt,
                "messages": messages,
                "temperature": temperature,
                "tools": [{
                    "name": &tool.name,
                    "description": &tool.description,
                    "input_schema": &tool.parameters
                }],
                "tool_choice": {"type": "tool", "name": &tool.name}
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Anthropic API error {status}: {body}"));
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(rename = "type")]
            kind: String,
            input: Option<Value>,
        }
        #[derive(Deserialize)]
        struct ApiUsage {
            input_tokens: u64,
            output_tokens: u64,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
            usage: ApiUsage,
        }

        let api_response: ApiResponse = response.json().await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let tool_input = api_response
            .content
            .iter()
            .find(|block| block.kind == "tool_use")
            .and_then(|block| block.input.clone())
            .ok_or_else(|| anyhow!("No tool use found in response"))?;

        debug!(
            "Anthropic tool '{}' returned {} input / {} output tokens in {elapsed_ms}ms",
            tool.name, api_response.usage.input_tokens, api_response.usage.output_tokens
        );

        let usage = LlmUsage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
            total_tokens: api_response.usage.input_tokens + api_response.usage.output_tokens,
            elapsed_ms,
        };

        Ok((tool_input, usage))
    }

    fn model_for(&self, tier: ModelTier) -> String {
        self.settings.model_for(tier).to_string()
    }

    fn provider_name(&self) -> &str {
        "Anthropic"
    }
}
