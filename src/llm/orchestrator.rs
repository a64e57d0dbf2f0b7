//! Query orchestrator: the multi-stage pipeline
//!
//! Routes a question through validate -> decide -> plan -> execute ->
//! summarize, with early exits at every decision point. Each request gets a
//! fresh orchestrator (and executor); the only shared state is the injected
//! registry, catalog, prompt store, and client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::catalog::{Catalog, SchemaStore};
use crate::datasource::DatasourceRegistry;
use crate::error::Result;
use crate::llm::client::{self, ConversationMessage, LlmClient, LlmUsage, ModelTier};
use crate::llm::executor::StepExecutor;
use crate::llm::prompts::PromptStore;
use crate::llm::schemas::{
    ClarificationQuestion, DecisionAction, DecisionResult, QueryPlan, ValidationResult,
};
use crate::llm::{DebugRecord, UsageCallback};

const REJECTION_FALLBACK: &str = "I can only help with queries about financial and banking data. \
                                  Your question appears to be outside this scope.";
const GENERIC_ERROR: &str =
    "I encountered an issue processing your question. Please try again.";

/// One prior message in the conversation thread
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub sender: String,
    pub content: String,
}

/// Terminal branch of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Rejection,
    DirectAnswer,
    Clarification,
    DatasourceError,
    ExecutionError,
    Answer,
    Error,
}

/// Uniform response envelope returned to the calling layer
#[derive(Debug, Clone, Serialize)]
pub struct EngineResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub message: String,
    pub metadata: Value,
}

impl EngineResponse {
    fn new(kind: ResponseKind, message: impl Into<String>, metadata: Value) -> Self {
        Self {
            kind,
            message: message.into(),
            metadata,
        }
    }
}

pub struct QueryOrchestrator {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    registry: Arc<DatasourceRegistry>,
    catalog: Arc<Catalog>,
    schemas: Arc<SchemaStore>,
    thread_id: Option<String>,
    usage_callback: Option<UsageCallback>,
    debug_info: Vec<DebugRecord>,
}

impl QueryOrchestrator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        registry: Arc<DatasourceRegistry>,
        catalog: Arc<Catalog>,
        schemas: Arc<SchemaStore>,
    ) -> Self {
        Self {
            client,
            prompts,
            registry,
            catalog,
            schemas,
            thread_id: None,
            usage_callback: None,
            debug_info: Vec::new(),
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_usage_callback(mut self, callback: UsageCallback) -> Self {
        self.usage_callback = Some(callback);
        self
    }

    /// Process one question through the full pipeline. Never panics or
    /// returns an error: every failure becomes an envelope.
    pub async fn process_question(
        &mut self,
        question: &str,
        conversation_history: &[ConversationTurn],
    ) -> EngineResponse {
        let pipeline_start = Instant::now();
        if let Some(thread_id) = &self.thread_id {
            info!("Processing question for thread {thread_id}");
        }

        let response = match self.run_pipeline(question, conversation_history).await {
            Ok(response) => response,
            Err(e) => {
                error!("Pipeline stage failed: {e}");
                EngineResponse::new(
                    ResponseKind::Error,
                    GENERIC_ERROR,
                    json!({ "error": e.to_string() }),
                )
            }
        };

        self.finalize(response, pipeline_start)
    }

    /// Annotate every debug record and the metadata with total elapsed time
    fn finalize(&mut self, mut response: EngineResponse, start: Instant) -> EngineResponse {
        let pipeline_time_ms = start.elapsed().as_millis() as u64;
        for record in &mut self.debug_info {
            record.pipeline_time_ms = pipeline_time_ms;
        }

        if let Value::Object(map) = &mut response.metadata {
            map.insert("pipeline_time_ms".to_string(), json!(pipeline_time_ms));
            map.insert(
                "debug_info".to_string(),
                serde_json::to_value(&self.debug_info).unwrap_or(Value::Null),
            );
        }

        response
    }

    async fn run_pipeline(
        &mut self,
        question: &str,
        conversation_history: &[ConversationTurn],
    ) -> Result<EngineResponse> {
        // Stage 1: validate the question against the catalog
        let validation = self.validate_question(question, conversation_history).await?;

        if !validation.is_relevant {
            let message = validation
                .suggested_response
                .clone()
                .unwrap_or_else(|| REJECTION_FALLBACK.to_string());
            return Ok(EngineResponse::new(
                ResponseKind::Rejection,
                message,
                json!({ "validation": validation }),
            ));
        }

        // Stage 2: decide how to respond
        let decision = self
            .decide_action(question, &validation, conversation_history)
            .await?;

        match decision.action {
            DecisionAction::AnswerDirectly => Ok(EngineResponse::new(
                ResponseKind::DirectAnswer,
                decision.message.clone().unwrap_or_default(),
                json!({ "validation": validation, "decision": decision }),
            )),
            DecisionAction::AskClarification => Ok(EngineResponse::new(
                ResponseKind::Clarification,
                decision.message.clone().unwrap_or_default(),
                json!({ "validation": validation, "decision": decision }),
            )),
            DecisionAction::CreatePlan => {
                self.plan_and_execute(question, conversation_history, validation, decision)
                    .await
            }
            // No dedicated handling for reject; it lands on the generic
            // error response like the fallback branch.
            DecisionAction::Reject => Ok(EngineResponse::new(
                ResponseKind::Error,
                GENERIC_ERROR,
                json!({ "validation": validation, "decision": decision }),
            )),
        }
    }

    async fn plan_and_execute(
        &mut self,
        question: &str,
        conversation_history: &[ConversationTurn],
        validation: ValidationResult,
        decision: DecisionResult,
    ) -> Result<EngineResponse> {
        // Datasource compatibility is checked before spending the planning
        // call on an impossible plan.
        let datasource_check = self.registry.validate(&validation.relevant_databases);
        if !datasource_check.valid {
            let message = datasource_check
                .error
                .clone()
                .unwrap_or_else(|| "Datasource validation failed".to_string());
            return Ok(EngineResponse::new(
                ResponseKind::DatasourceError,
                message,
                json!({
                    "validation": validation,
                    "decision": decision,
                    "datasource_check": datasource_check,
                }),
            ));
        }

        // Stage 3: create the query plan
        let plan = self
            .create_plan(question, &validation, conversation_history)
            .await?;

        if plan.needs_clarification {
            let message = format_clarification_questions(&plan.clarification_questions);
            return Ok(EngineResponse::new(
                ResponseKind::Clarification,
                message,
                json!({ "validation": validation, "decision": decision, "plan": plan }),
            ));
        }

        // The plan itself may touch databases beyond the validated set; the
        // single-datasource invariant is re-checked once for the whole plan
        // before any SQL generation.
        let plan_databases = plan.all_databases();
        let plan_check = self.registry.validate(&plan_databases);
        if !plan_check.valid {
            let message = plan_check
                .error
                .clone()
                .unwrap_or_else(|| "Datasource validation failed".to_string());
            return Ok(EngineResponse::new(
                ResponseKind::DatasourceError,
                message,
                json!({
                    "validation": validation,
                    "decision": decision,
                    "plan": plan,
                    "datasource_check": plan_check,
                }),
            ));
        }

        // Stage 4: execute each step in order, fail-fast
        let mut executor = StepExecutor::new(
            self.client.clone(),
            self.prompts.clone(),
            self.registry.clone(),
            self.schemas.clone(),
        );
        if let Some(callback) = &self.usage_callback {
            executor = executor.with_usage_callback(callback.clone());
        }

        let execution_results = executor.execute_plan(question, &plan).await;

        if let Some(failed) = execution_results.iter().find(|result| !result.success) {
            let message = format!(
                "I wasn't able to complete the query. Step {} failed: {}",
                failed.step_number,
                failed.error.as_deref().unwrap_or("unknown error")
            );
            self.debug_info.extend(executor.take_debug_info());
            return Ok(EngineResponse::new(
                ResponseKind::ExecutionError,
                message,
                json!({
                    "validation": validation,
                    "decision": decision,
                    "plan": plan,
                    "execution_results": execution_results,
                }),
            ));
        }

        // Stage 5: summarize; only reached when every step succeeded
        let summary = executor
            .generate_summary(question, &plan, &execution_results)
            .await;
        self.debug_info.extend(executor.take_debug_info());
        let summary = summary?;

        Ok(EngineResponse::new(
            ResponseKind::Answer,
            summary.answer.clone(),
            json!({
                "validation": validation,
                "decision": decision,
                "plan": plan,
                "execution_results": execution_results,
                "summary": summary,
            }),
        ))
    }

    async fn validate_question(
        &mut self,
        question: &str,
        conversation_history: &[ConversationTurn],
    ) -> Result<ValidationResult> {
        let template = self.prompts.load("validate_question")?;

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("question", question.to_string());
        params.insert("data_sources", self.catalog.format_data_sources());
        params.insert(
            "conversation_history",
            format_conversation_history(conversation_history),
        );

        let user_prompt = template.render_user(&params)?;
        let system_prompt = template.render_system(&params)?;
        let messages = [ConversationMessage::user(user_prompt)];

        let (result, usage) = client::invoke::<ValidationResult>(
            self.client.as_ref(),
            &messages,
            &system_prompt,
            &ValidationResult::tool(),
            template.model,
            template.temperature,
        )
        .await?;

        self.record("validation", template.model, &usage);
        Ok(result)
    }

    async fn decide_action(
        &mut self,
        question: &str,
        validation: &ValidationResult,
        conversation_history: &[ConversationTurn],
    ) -> Result<DecisionResult> {
        let template = self.prompts.load("decide_action")?;

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("question", question.to_string());
        params.insert("is_relevant", validation.is_relevant.to_string());
        params.insert(
            "relevant_databases",
            validation.relevant_databases.join(", "),
        );
        params.insert("validation_reasoning", validation.reasoning.clone());
        params.insert("data_sources", self.catalog.format_data_sources());
        params.insert(
            "conversation_history",
            format_conversation_history(conversation_history),
        );

        let user_prompt = template.render_user(&params)?;
        let system_prompt = template.render_system(&params)?;
        let messages = [ConversationMessage::user(user_prompt)];

        let (result, usage) = client::invoke::<DecisionResult>(
            self.client.as_ref(),
            &messages,
            &system_prompt,
            &DecisionResult::tool(),
            template.model,
            template.temperature,
        )
        .await?;

        self.record("decision", template.model, &usage);
        Ok(result)
    }

    async fn create_plan(
        &mut self,
        question: &str,
        validation: &ValidationResult,
        conversation_history: &[ConversationTurn],
    ) -> Result<QueryPlan> {
        let template = self.prompts.load("create_plan")?;

        let database_schemas = self
            .schemas
            .format_for_databases(&validation.relevant_databases);

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("question", question.to_string());
        params.insert(
            "relevant_databases",
            validation.relevant_databases.join(", "),
        );
        params.insert("database_schemas", database_schemas);
        params.insert(
            "conversation_history",
            format_conversation_history(conversation_history),
        );

        let user_prompt = template.render_user(&params)?;
        let system_prompt = template.render_system(&params)?;
        let messages = [ConversationMessage::user(user_prompt)];

        let (result, usage) = client::invoke::<QueryPlan>(
            self.client.as_ref(),
            &messages,
            &system_prompt,
            &QueryPlan::tool(),
            template.model,
            template.temperature,
        )
        .await?;

        self.record("planning", template.model, &usage);
        Ok(result)
    }

    fn record(&mut self, stage: &str, tier: ModelTier, usage: &LlmUsage) {
        self.debug_info.push(DebugRecord {
            stage: stage.to_string(),
            step: None,
            attempt: None,
            model: self.client.model_for(tier),
            elapsed_ms: usage.elapsed_ms,
            tokens: usage.clone(),
            pipeline_time_ms: 0,
        });

        if let Some(callback) = &self.usage_callback {
            callback(usage);
        }
    }
}

/// Last five turns, newest last, rendered as `SENDER: content`
fn format_conversation_history(conversation: &[ConversationTurn]) -> String {
    if conversation.is_empty() {
        return "No previous conversation.".to_string();
    }

    let start = conversation.len().saturating_sub(5);
    conversation[start..]
        .iter()
        .map(|turn| format!("{}: {}", turn.sender.to_uppercase(), turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 1-indexed clarification list under a fixed header
fn format_clarification_questions(questions: &[ClarificationQuestion]) -> String {
    let mut lines = vec!["I need some clarification to answer your question:\n".to_string()];
    for (i, q) in questions.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, q.question));
    }
    lines.join("\n")
}
