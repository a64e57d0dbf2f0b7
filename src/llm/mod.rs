//! LLM-driven pipeline: client, prompt templates, structured schemas, the
//! agentic step executor, and the top-level query orchestrator.

use std::sync::Arc;

use serde::Serialize;

pub mod client;
pub mod executor;
pub mod orchestrator;
pub mod prompts;
pub mod schemas;

pub use client::{
    AnthropicClient, ConversationMessage, LlmClient, LlmSettings, LlmUsage, ModelTier,
    ToolDefinition,
};
pub use executor::{StepExecutor, MAX_ATTEMPTS};
pub use orchestrator::{ConversationTurn, EngineResponse, QueryOrchestrator, ResponseKind};
pub use prompts::{PromptStore, PromptTemplate};

/// One per-stage debug record; observability only, never control flow
#[derive(Debug, Clone, Serialize)]
pub struct DebugRecord {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub model: String,
    pub elapsed_ms: u64,
    pub tokens: LlmUsage,
    /// Total pipeline elapsed time, filled in when the request finishes
    pub pipeline_time_ms: u64,
}

/// Injected token-usage hook, called after every LLM invocation
pub type UsageCallback = Arc<dyn Fn(&LlmUsage) + Send + Sync>;
