//! Agentic step executor
//!
//! Drives one plan step through a bounded generate -> execute -> diagnose ->
//! retry loop. SQL generation happens once per step; every retry executes the
//! corrected statement the error analysis supplied. The attempt budget is a
//! hard cap with no runtime override.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::catalog::SchemaStore;
use crate::datasource::{DatasourceRegistry, Row};
use crate::error::Result;
use crate::llm::client::{self, ConversationMessage, LlmClient, LlmUsage, ModelTier};
use crate::llm::prompts::PromptStore;
use crate::llm::schemas::{
    ErrorAnalysisResult, QueryPlan, QueryPlanStep, SqlGenerationResult, StepExecutionResult,
    SummaryResult,
};
use crate::llm::{DebugRecord, UsageCallback};

/// Hard cap on attempts per step
pub const MAX_ATTEMPTS: u32 = 5;

/// One failed attempt, kept for error-analysis context
#[derive(Debug, Clone)]
struct FailedAttempt {
    sql: String,
    error: String,
}

pub struct StepExecutor {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    registry: Arc<DatasourceRegistry>,
    schemas: Arc<SchemaStore>,
    usage_callback: Option<UsageCallback>,
    debug_info: Vec<DebugRecord>,
}

impl StepExecutor {
    pub fn new(
        client: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        registry: Arc<DatasourceRegistry>,
        schemas: Arc<SchemaStore>,
    ) -> Self {
        Self {
            client,
            prompts,
            registry,
            schemas,
            usage_callback: None,
            debug_info: Vec::new(),
        }
    }

    pub fn with_usage_callback(mut self, callback: UsageCallback) -> Self {
        self.usage_callback = Some(callback);
        self
    }

    pub fn debug_info(&self) -> &[DebugRecord] {
        &self.debug_info
    }

    pub fn take_debug_info(&mut self) -> Vec<DebugRecord> {
        std::mem::take(&mut self.debug_info)
    }

    /// Execute every plan step in order, feeding each step the results of the
    /// ones before it. Stops at the first failing step; later steps are never
    /// attempted.
    pub async fn execute_plan(
        &mut self,
        original_question: &str,
        plan: &QueryPlan,
    ) -> Vec<StepExecutionResult> {
        let mut results: Vec<StepExecutionResult> = Vec::new();

        for step in &plan.steps {
            info!("Executing step {}/{}", step.step_number, plan.steps.len());

            let step_result = self
                .execute_step_with_retry(original_question, step, &results)
                .await;
            let failed = !step_result.success;
            results.push(step_result);

            if failed {
                error!(
                    "Step {} failed, stopping execution",
                    step.step_number
                );
                break;
            }
        }

        results
    }

    /// The agentic retry loop for one step
    pub async fn execute_step_with_retry(
        &mut self,
        original_question: &str,
        step: &QueryPlanStep,
        previous_results: &[StepExecutionResult],
    ) -> StepExecutionResult {
        let mut attempts: Vec<FailedAttempt> = Vec::new();
        let mut current_sql: Option<String> = None;
        let mut database = String::new();

        for attempt_num in 1..=MAX_ATTEMPTS {
            if attempt_num == 1 {
                info!("Generating SQL for step {}", step.step_number);
                match self
                    .generate_sql(original_question, step, previous_results)
                    .await
                {
                    Ok(generation) => {
                        current_sql = Some(generation.sql);
                        database = generation.database;
                    }
                    Err(e) => {
                        error!(
                            "Unexpected error in step {} attempt {attempt_num}: {e}",
                            step.step_number
                        );
                        return Self::failed_step(
                            step,
                            current_sql,
                            format!("Unexpected error: {e}"),
                            attempt_num,
                        );
                    }
                }
            } else {
                // The corrected SQL from the previous analysis is the next
                // statement to execute; no new generation call.
                info!(
                    "Retrying step {} with corrected SQL (attempt {attempt_num})",
                    step.step_number
                );
            }

            let sql = current_sql.clone().unwrap_or_default();
            let query_result = self.registry.execute(&sql, &database, None).await;

            if query_result.success {
                info!(
                    "Step {} executed successfully on attempt {attempt_num}",
                    step.step_number
                );
                let (result_data, result_value) = classify_result(query_result.data);
                return StepExecutionResult {
                    step_number: step.step_number,
                    success: true,
                    sql: current_sql,
                    result_data,
                    result_value,
                    error: None,
                    attempts: attempt_num,
                };
            }

            let error_message = query_result
                .error
                .unwrap_or_else(|| "unknown execution error".to_string());
            warn!(
                "Step {} failed on attempt {attempt_num}: {error_message}",
                step.step_number
            );

            attempts.push(FailedAttempt {
                sql: sql.clone(),
                error: error_message.clone(),
            });

            if attempt_num == MAX_ATTEMPTS {
                error!(
                    "Step {} failed after {MAX_ATTEMPTS} attempts",
                    step.step_number
                );
                return Self::failed_step(
                    step,
                    current_sql,
                    format!("Failed after {MAX_ATTEMPTS} attempts. Last error: {error_message}"),
                    attempt_num,
                );
            }

            // Only the immediately preceding failed attempt goes into the
            // analysis prompt, keeping prompt size bounded.
            let last_attempt = if attempts.len() >= 2 {
                attempts.get(attempts.len() - 2)
            } else {
                None
            };

            let analysis = match self
                .analyze_error(
                    original_question,
                    step,
                    &sql,
                    &error_message,
                    attempt_num,
                    last_attempt,
                )
                .await
            {
                Ok(analysis) => analysis,
                Err(e) => {
                    error!(
                        "Unexpected error in step {} attempt {attempt_num}: {e}",
                        step.step_number
                    );
                    return Self::failed_step(
                        step,
                        current_sql,
                        format!("Unexpected error: {e}"),
                        attempt_num,
                    );
                }
            };

            if !analysis.is_recoverable {
                error!(
                    "Step {} has non-recoverable error: {}",
                    step.step_number, analysis.reasoning
                );
                return Self::failed_step(
                    step,
                    current_sql,
                    format!(
                        "Non-recoverable error ({}): {}",
                        analysis.error_type.as_str(),
                        analysis.reasoning
                    ),
                    attempt_num,
                );
            }

            match analysis.suggested_sql {
                Some(suggested) => {
                    // Keep the same database; only the statement changes.
                    current_sql = Some(suggested);
                }
                None => {
                    error!("Error marked as recoverable but no suggested SQL provided");
                    return Self::failed_step(
                        step,
                        current_sql,
                        format!(
                            "Error analysis failed to provide corrected SQL: {}",
                            analysis.reasoning
                        ),
                        attempt_num,
                    );
                }
            }
        }

        Self::failed_step(
            step,
            current_sql,
            "Maximum retry attempts exceeded".to_string(),
            MAX_ATTEMPTS,
        )
    }

    fn failed_step(
        step: &QueryPlanStep,
        sql: Option<String>,
        error: String,
        attempts: u32,
    ) -> StepExecutionResult {
        StepExecutionResult {
            step_number: step.step_number,
            success: false,
            sql,
            result_data: None,
            result_value: None,
            error: Some(error),
            attempts,
        }
    }

    async fn generate_sql(
        &mut self,
        original_question: &str,
        step: &QueryPlanStep,
        previous_results: &[StepExecutionResult],
    ) -> Result<SqlGenerationResult> {
        let template = self.prompts.load("generate_sql")?;

        let database_schemas = self.schemas.format_for_databases(&step.databases);
        let previous_results_text = format_previous_results(previous_results);

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("original_question", original_question.to_string());
        params.insert("step_number", step.step_number.to_string());
        params.insert("step_description", step.description.clone());
        params.insert("step_databases", step.databases.join(", "));
        params.insert("step_tables", step.tables.join(", "));
        params.insert("step_operation", step.operation.as_str().to_string());
        params.insert("previous_results", previous_results_text);
        params.insert("database_schemas", database_schemas);

        let user_prompt = template.render_user(&params)?;
        let system_prompt = template.render_system(&params)?;
        let messages = [ConversationMessage::user(user_prompt)];

        let (result, usage) = client::invoke::<SqlGenerationResult>(
            self.client.as_ref(),
            &messages,
            &system_prompt,
            &SqlGenerationResult::tool(),
            template.model,
            template.temperature,
        )
        .await?;

        self.record(
            "sql_generation",
            Some(step.step_number),
            None,
            template.model,
            &usage,
        );

        Ok(result)
    }

    async fn analyze_error(
        &mut self,
        original_question: &str,
        step: &QueryPlanStep,
        failed_sql: &str,
        error_message: &str,
        attempt_number: u32,
        last_attempt: Option<&FailedAttempt>,
    ) -> Result<ErrorAnalysisResult> {
        let template = self.prompts.load("analyze_error")?;

        let database_schemas = self.schemas.format_for_databases(&step.databases);
        let previous_attempt_text = match last_attempt {
            Some(attempt) => format!(
                "Previous SQL:\n{}\n\nPrevious Error:\n{}",
                attempt.sql, attempt.error
            ),
            None => "This is the first attempt.".to_string(),
        };

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("original_question", original_question.to_string());
        params.insert("step_number", step.step_number.to_string());
        params.insert("step_description", step.description.clone());
        params.insert("failed_sql", failed_sql.to_string());
        params.insert("error_message", error_message.to_string());
        params.insert("attempt_number", attempt_number.to_string());
        params.insert("previous_attempts", previous_attempt_text);
        params.insert("database_schemas", database_schemas);

        let user_prompt = template.render_user(&params)?;
        let system_prompt = template.render_system(&params)?;
        let messages = [ConversationMessage::user(user_prompt)];

        let (result, usage) = client::invoke::<ErrorAnalysisResult>(
            self.client.as_ref(),
            &messages,
            &system_prompt,
            &ErrorAnalysisResult::tool(),
            template.model,
            template.temperature,
        )
        .await?;

        self.record(
            "error_analysis",
            Some(step.step_number),
            Some(attempt_number),
            template.model,
            &usage,
        );

        Ok(result)
    }

    /// Generate the final summary from a fully successful execution
    pub async fn generate_summary(
        &mut self,
        original_question: &str,
        plan: &QueryPlan,
        execution_results: &[StepExecutionResult],
    ) -> Result<SummaryResult> {
        let template = self.prompts.load("write_summary")?;

        let execution_results_text = format_execution_report(plan, execution_results);

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("original_question", original_question.to_string());
        params.insert("plan_summary", plan.summary.clone());
        params.insert("execution_results", execution_results_text);

        let user_prompt = template.render_user(&params)?;
        let system_prompt = template.render_system(&params)?;
        let messages = [ConversationMessage::user(user_prompt)];

        let (result, usage) = client::invoke::<SummaryResult>(
            self.client.as_ref(),
            &messages,
            &system_prompt,
            &SummaryResult::tool(),
            template.model,
            template.temperature,
        )
        .await?;

        self.record("summary", None, None, template.model, &usage);

        Ok(result)
    }

    fn record(
        &mut self,
        stage: &str,
        step: Option<i32>,
        attempt: Option<u32>,
        tier: ModelTier,
        usage: &LlmUsage,
    ) {
        self.debug_info.push(DebugRecord {
            stage: stage.to_string(),
            step,
            attempt,
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

/// Scalar extraction rule: exactly one row with exactly one field becomes a
/// stringified scalar; any other shape stays a row set.
pub(crate) fn classify_result(data: Option<Vec<Row>>) -> (Option<Vec<Row>>, Option<String>) {
    match data {
        Some(rows) if rows.len() == 1 && rows[0].len() == 1 => {
            let value = rows[0].values().next().cloned().unwrap_or(Value::Null);
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (None, Some(text))
        }
        Some(rows) => (Some(rows), None),
        None => (None, None),
    }
}

/// Render prior-step results for the generation prompt: row counts plus a
/// sample of at most three rows, or the scalar value.
pub(crate) fn format_previous_results(previous_results: &[StepExecutionResult]) -> String {
    if previous_results.is_empty() {
        return "No previous results available.".to_string();
    }

    let mut lines = vec!["Previous step results:".to_string()];
    for result in previous_results {
        lines.push(format!("\nStep {}:", result.step_number));
        lines.push(format!("Success: {}", result.success));

        if result.success {
            if let Some(value) = &result.result_value {
                lines.push(format!("Result: {value}"));
            } else if let Some(data) = &result.result_data {
                lines.push(format!("Rows returned: {}", data.len()));
                if !data.is_empty() {
                    lines.push("Sample data:".to_string());
                    for (i, row) in data.iter().take(3).enumerate() {
                        lines.push(format!("  Row {}: {}", i + 1, Value::Object(row.clone())));
                    }
                    if data.len() > 3 {
                        lines.push(format!("  ... and {} more rows", data.len() - 3));
                    }
                }
            }
        } else if let Some(error) = &result.error {
            lines.push(format!("Error: {error}"));
        }
    }

    lines.join("\n")
}

/// Render the per-step report for the summary prompt: status, SQL, and either
/// the scalar value or up to ten rows as a markdown table.
pub(crate) fn format_execution_report(
    plan: &QueryPlan,
    execution_results: &[StepExecutionResult],
) -> String {
    let mut lines = Vec::new();

    for result in execution_results {
        let step = plan
            .steps
            .iter()
            .find(|s| s.step_number == result.step_number);

        lines.push(format!("\n**Step {}**", result.step_number));
        if let Some(step) = step {
            lines.push(format!("Description: {}", step.description));
        }

        let status = if result.success { "✓ Success" } else { "✗ Failed" };
        lines.push(format!("Status: {status}"));

        if result.success {
            if let Some(value) = &result.result_value {
                lines.push(format!("Result: {value}"));
            } else if let Some(data) = &result.result_data {
                lines.push(format!("Rows returned: {}", data.len()));
                if let Some(first) = data.first() {
                    lines.push("Data:".to_string());
                    let cols: Vec<&String> = first.keys().collect();
                    lines.push(format!(
                        "| {} |",
                        cols.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" | ")
                    ));
                    lines.push(format!("|{}|", vec!["---"; cols.len()].join("|")));
                    for row in data.iter().take(10) {
                        let cells: Vec<String> = cols
                            .iter()
                            .map(|c| match row.get(*c) {
                                Some(Value::String(s)) => s.clone(),
                                Some(v) => v.to_string(),
                                None => String::new(),
                            })
                            .collect();
                        lines.push(format!("| {} |", cells.join(" | ")));
                    }
                    if data.len() > 10 {
                        lines.push(format!("... and {} more rows", data.len() - 10));
                    }
                }
            }
            if let Some(sql) = &result.sql {
                lines.push(format!("SQL executed: ```sql\n{sql}\n```"));
            }
        } else if let Some(error) = &result.error {
            lines.push(format!("Error: {error}"));
        }
    }

    lines.join("\n")
}
