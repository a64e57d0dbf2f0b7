//! End-to-end pipeline tests
//!
//! Drive the orchestrator and step executor with a scripted LLM client and
//! scripted datasources, using the prompt templates and catalog shipped in
//! `knowledge/`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};

use askdb::catalog::{Catalog, SchemaStore};
use askdb::datasource::{DataSource, DatasourceRegistry, QueryResult, Row};
use askdb::llm::client::{ConversationMessage, LlmClient, LlmUsage, ModelTier, ToolDefinition};
use askdb::llm::prompts::PromptStore;
use askdb::llm::schemas::{QueryPlan, QueryPlanStep, StepOperation};
use askdb::llm::{QueryOrchestrator, ResponseKind, StepExecutor};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct ScriptedLlm {
    responses: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn invoke_structured(
        &self,
        _messages: &[ConversationMessage],
        _system_prompt: &str,
        tool: &ToolDefinition,
        _tier: ModelTier,
        _temperature: f32,
    ) -> anyhow::Result<(Value, LlmUsage)> {
        self.calls.lock().unwrap().push(tool.name.clone());
        let value = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted for tool '{}'", tool.name))?;
        Ok((
            value,
            LlmUsage {
                input_tokens: 100,
                output_tokens: 20,
                total_tokens: 120,
                elapsed_ms: 3,
            },
        ))
    }

    fn model_for(&self, _tier: ModelTier) -> String {
        "scripted-model".to_string()
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedSource {
    name: String,
    databases: Vec<String>,
    results: Mutex<VecDeque<QueryResult>>,
    executed: Mutex<Vec<(String, String)>>,
}

impl ScriptedSource {
    fn new(name: &str, databases: &[&str], results: Vec<QueryResult>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            databases: databases.iter().map(|s| s.to_string()).collect(),
            results: Mutex::new(results.into()),
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn databases(&self) -> &[String] {
        &self.databases
    }

    async fn connect(&self) -> askdb::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn test_connection(&self) -> bool {
        true
    }

    async fn execute_query(
        &self,
        sql: &str,
        database: &str,
        _params: Option<&[Value]>,
    ) -> QueryResult {
        self.executed
            .lock()
            .unwrap()
            .push((sql.to_string(), database.to_string()));
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| QueryResult::failed("script exhausted"))
    }

    async fn get_schema_info(&self, _database: &str) -> askdb::Result<Value> {
        Ok(Value::Null)
    }
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn rows_result(rows: Vec<Row>) -> QueryResult {
    let columns = rows
        .first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default();
    QueryResult::rows(rows, columns, 1)
}

fn knowledge_path(rel: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(rel)
}

fn build_registry(sources: Vec<Arc<ScriptedSource>>) -> Arc<DatasourceRegistry> {
    init_tracing();
    let mut registry = DatasourceRegistry::new();
    for source in sources {
        registry.register(source).unwrap();
    }
    Arc::new(registry)
}

fn build_orchestrator(
    llm: Arc<ScriptedLlm>,
    registry: Arc<DatasourceRegistry>,
) -> QueryOrchestrator {
    let prompts = Arc::new(PromptStore::new(knowledge_path("knowledge/prompts")));
    let catalog =
        Arc::new(Catalog::load(&knowledge_path("knowledge/data_schemas/summary.yaml")).unwrap());
    let schemas = Arc::new(SchemaStore::load_dir(&knowledge_path("knowledge/data_schemas")).unwrap());
    QueryOrchestrator::new(llm, prompts, registry, catalog, schemas)
}

fn validation_json(databases: &[&str]) -> Value {
    json!({
        "is_relevant": true,
        "reasoning": "question maps onto the listed databases",
        "relevant_databases": databases,
    })
}

fn plan_json(steps: Value) -> Value {
    json!({
        "summary": "query the warehouse",
        "steps": steps,
        "expected_output": "the requested figures",
    })
}

fn test_step(number: i32, databases: &[&str]) -> QueryPlanStep {
    QueryPlanStep {
        step_number: number,
        description: format!("step {number}"),
        databases: databases.iter().map(|s| s.to_string()).collect(),
        tables: vec!["t".to_string()],
        operation: StepOperation::SingleQuery,
    }
}

fn empty_plan_with(steps: Vec<QueryPlanStep>) -> QueryPlan {
    QueryPlan {
        summary: "s".to_string(),
        steps,
        expected_output: "e".to_string(),
        needs_clarification: false,
        clarification_questions: vec![],
    }
}

fn build_executor(llm: Arc<ScriptedLlm>, registry: Arc<DatasourceRegistry>) -> StepExecutor {
    let prompts = Arc::new(PromptStore::new(knowledge_path("knowledge/prompts")));
    let schemas =
        Arc::new(SchemaStore::load_dir(&knowledge_path("knowledge/data_schemas")).unwrap());
    StepExecutor::new(llm, prompts, registry, schemas)
}

// Scenario A: two-step plan where the second step is repaired once by the
// error-analysis stage.
#[tokio::test]
async fn two_step_plan_with_one_correction_answers() {
    let llm = ScriptedLlm::new(vec![
        validation_json(&["customer_db", "accounts_db"]),
        json!({ "action": "create_plan", "reasoning": "needs data" }),
        plan_json(json!([
            {
                "step_number": 1,
                "description": "list customers",
                "databases": ["customer_db"],
                "tables": ["customers"],
                "operation": "single_query"
            },
            {
                "step_number": 2,
                "description": "total balances",
                "databases": ["accounts_db"],
                "tables": ["accounts"],
                "operation": "aggregation"
            }
        ])),
        json!({ "sql": "SELECT customer_id, full_name FROM customers", "database": "customer_db", "reasoning": "" }),
        json!({ "sql": "SELEC SUM(balance) FROM accounts", "database": "accounts_db", "reasoning": "" }),
        json!({
            "is_recoverable": true,
            "reasoning": "typo in SELECT keyword",
            "suggested_sql": "SELECT SUM(balance) FROM accounts",
            "error_type": "syntax"
        }),
        json!({
            "answer": "Total balance is 123 across 2 customers.",
            "is_answerable": true,
            "confidence": "high",
            "data_sources_used": ["customer_db", "accounts_db"]
        }),
    ]);

    let source = ScriptedSource::new(
        "main_postgres",
        &["customer_db", "accounts_db"],
        vec![
            rows_result(vec![
                row(&[("customer_id", json!(1)), ("full_name", json!("Alice"))]),
                row(&[("customer_id", json!(2)), ("full_name", json!("Bob"))]),
            ]),
            QueryResult::failed("PostgreSQL error: syntax error at or near \"SELEC\""),
            rows_result(vec![row(&[("sum", json!("123"))])]),
        ],
    );

    let registry = build_registry(vec![source.clone()]);
    let mut orchestrator = build_orchestrator(llm.clone(), registry);

    let usage_calls = Arc::new(AtomicUsize::new(0));
    let counter = usage_calls.clone();
    orchestrator = orchestrator.with_usage_callback(Arc::new(move |_usage| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let response = orchestrator
        .process_question("What is the total balance?", &[])
        .await;

    assert_eq!(response.kind, ResponseKind::Answer);
    assert_eq!(response.message, "Total balance is 123 across 2 customers.");

    let results = response.metadata["execution_results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["attempts"], json!(1));
    assert_eq!(results[0]["success"], json!(true));
    assert_eq!(results[1]["attempts"], json!(2));
    assert_eq!(results[1]["success"], json!(true));
    assert_eq!(results[1]["result_value"], json!("123"));
    assert_eq!(
        results[1]["sql"],
        json!("SELECT SUM(balance) FROM accounts")
    );

    // One usage callback per LLM invocation.
    assert_eq!(usage_calls.load(Ordering::SeqCst), 7);
    assert_eq!(llm.remaining(), 0);

    // Every execution went to the single datasource, scoped per database.
    let executed = source.executed();
    assert_eq!(executed.len(), 3);
    assert_eq!(executed[0].1, "customer_db");
    assert_eq!(executed[2].1, "accounts_db");

    // Debug records exist for every stage and carry the pipeline time.
    let debug = response.metadata["debug_info"].as_array().unwrap();
    let stages: Vec<&str> = debug
        .iter()
        .map(|d| d["stage"].as_str().unwrap())
        .collect();
    assert_eq!(
        stages,
        vec![
            "validation",
            "decision",
            "planning",
            "sql_generation",
            "sql_generation",
            "error_analysis",
            "summary"
        ]
    );
    assert!(response.metadata["pipeline_time_ms"].is_u64());
}

// Scenario B: relevant databases span two datasources; the pipeline stops
// before any planning call.
#[tokio::test]
async fn cross_datasource_databases_fail_before_planning() {
    let llm = ScriptedLlm::new(vec![
        validation_json(&["customer_db", "employees_db"]),
        json!({ "action": "create_plan", "reasoning": "needs data" }),
    ]);

    let main = ScriptedSource::new("main_postgres", &["customer_db"], vec![]);
    let hr = ScriptedSource::new("hr_postgres", &["employees_db"], vec![]);
    let registry = build_registry(vec![main, hr]);
    let mut orchestrator = build_orchestrator(llm.clone(), registry);

    let response = orchestrator
        .process_question("Compare staff and customers per branch", &[])
        .await;

    assert_eq!(response.kind, ResponseKind::DatasourceError);
    assert!(response.message.contains("Cannot query across different datasources"));
    assert!(response.message.contains("main_postgres"));
    assert!(response.message.contains("hr_postgres"));

    // The planning template was never invoked.
    assert_eq!(llm.remaining(), 0);
    assert_eq!(
        llm.calls(),
        vec!["provide_validation_result", "provide_decision_result"]
    );
}

// Scenario C: scalar extraction vs tabular results through the whole
// pipeline.
#[tokio::test]
async fn scalar_and_tabular_results_classify_correctly() {
    let llm = ScriptedLlm::new(vec![
        validation_json(&["customer_db"]),
        json!({ "action": "create_plan", "reasoning": "needs data" }),
        plan_json(json!([
            {
                "step_number": 1,
                "description": "list rows",
                "databases": ["customer_db"],
                "tables": ["customers"],
                "operation": "single_query"
            },
            {
                "step_number": 2,
                "description": "count rows",
                "databases": ["customer_db"],
                "tables": ["customers"],
                "operation": "aggregation"
            }
        ])),
        json!({ "sql": "SELECT a, b, c FROM customers", "database": "customer_db", "reasoning": "" }),
        json!({ "sql": "SELECT COUNT(*) AS count FROM customers", "database": "customer_db", "reasoning": "" }),
        json!({
            "answer": "There are 42 customers.",
            "is_answerable": true,
            "confidence": "high",
            "data_sources_used": ["customer_db"]
        }),
    ]);

    let five_rows: Vec<Row> = (0..5)
        .map(|i| {
            row(&[
                ("a", json!(i)),
                ("b", json!(i * 2)),
                ("c", json!(format!("r{i}"))),
            ])
        })
        .collect();

    let source = ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![
            rows_result(five_rows),
            rows_result(vec![row(&[("count", json!(42))])]),
        ],
    );

    let registry = build_registry(vec![source]);
    let mut orchestrator = build_orchestrator(llm, registry);

    let response = orchestrator.process_question("How many customers?", &[]).await;

    assert_eq!(response.kind, ResponseKind::Answer);
    let results = response.metadata["execution_results"].as_array().unwrap();
    assert_eq!(results[0]["result_data"].as_array().unwrap().len(), 5);
    assert_eq!(results[0]["result_value"], Value::Null);
    assert_eq!(results[1]["result_value"], json!("42"));
    assert_eq!(results[1]["result_data"], Value::Null);
}

#[tokio::test]
async fn rejection_uses_suggested_response() {
    let llm = ScriptedLlm::new(vec![json!({
        "is_relevant": false,
        "reasoning": "general knowledge question",
        "suggested_response": "I can only answer questions about the bank's data.",
        "relevant_databases": []
    })]);

    let registry = build_registry(vec![ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![],
    )]);
    let mut orchestrator = build_orchestrator(llm.clone(), registry);

    let response = orchestrator
        .process_question("Who won the world cup?", &[])
        .await;

    assert_eq!(response.kind, ResponseKind::Rejection);
    assert_eq!(
        response.message,
        "I can only answer questions about the bank's data."
    );
    assert_eq!(llm.remaining(), 0);
}

#[tokio::test]
async fn direct_answer_short_circuits() {
    let llm = ScriptedLlm::new(vec![
        validation_json(&["customer_db"]),
        json!({
            "action": "answer_directly",
            "reasoning": "already answered above",
            "message": "As mentioned, there are six databases."
        }),
    ]);

    let registry = build_registry(vec![ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![],
    )]);
    let mut orchestrator = build_orchestrator(llm, registry);

    let response = orchestrator
        .process_question("What data do you have?", &[])
        .await;

    assert_eq!(response.kind, ResponseKind::DirectAnswer);
    assert_eq!(response.message, "As mentioned, there are six databases.");
}

#[tokio::test]
async fn plan_clarification_lists_questions() {
    let llm = ScriptedLlm::new(vec![
        validation_json(&["customer_db"]),
        json!({ "action": "create_plan", "reasoning": "needs data" }),
        json!({
            "summary": "ambiguous",
            "steps": [],
            "expected_output": "n/a",
            "needs_clarification": true,
            "clarification_questions": [
                { "question": "Which year?", "reason": "multiple years present" },
                { "question": "Which branch?", "reason": "branch not specified" }
            ]
        }),
    ]);

    let registry = build_registry(vec![ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![],
    )]);
    let mut orchestrator = build_orchestrator(llm, registry);

    let response = orchestrator.process_question("Show growth", &[]).await;

    assert_eq!(response.kind, ResponseKind::Clarification);
    assert!(response
        .message
        .starts_with("I need some clarification to answer your question:"));
    assert!(response.message.contains("1. Which year?"));
    assert!(response.message.contains("2. Which branch?"));
}

#[tokio::test]
async fn retry_budget_is_capped_at_five_attempts() {
    let recoverable = || {
        json!({
            "is_recoverable": true,
            "reasoning": "try again",
            "suggested_sql": "SELECT 1",
            "error_type": "syntax"
        })
    };

    let llm = ScriptedLlm::new(vec![
        json!({ "sql": "SELECT broken", "database": "customer_db", "reasoning": "" }),
        recoverable(),
        recoverable(),
        recoverable(),
        recoverable(),
    ]);

    let source = ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![
            QueryResult::failed("error 1"),
            QueryResult::failed("error 2"),
            QueryResult::failed("error 3"),
            QueryResult::failed("error 4"),
            QueryResult::failed("error 5"),
        ],
    );

    let registry = build_registry(vec![source.clone()]);
    let mut executor = build_executor(llm.clone(), registry);

    let step = test_step(1, &["customer_db"]);
    let result = executor
        .execute_step_with_retry("q", &step, &[])
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 5);
    let error = result.error.unwrap();
    assert!(error.contains("Failed after 5 attempts"));
    assert!(error.contains("error 5"));
    assert_eq!(source.executed().len(), 5);
    assert_eq!(llm.remaining(), 0);
}

#[tokio::test]
async fn non_recoverable_analysis_stops_early() {
    let llm = ScriptedLlm::new(vec![
        json!({ "sql": "SELECT secret FROM vault", "database": "customer_db", "reasoning": "" }),
        json!({
            "is_recoverable": true,
            "reasoning": "maybe a typo",
            "suggested_sql": "SELECT secret FROM vaults",
            "error_type": "schema"
        }),
        json!({
            "is_recoverable": false,
            "reasoning": "role lacks SELECT on this table",
            "error_type": "permission"
        }),
    ]);

    let source = ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![
            QueryResult::failed("permission denied for table vault"),
            QueryResult::failed("permission denied for table vaults"),
        ],
    );

    let registry = build_registry(vec![source.clone()]);
    let mut executor = build_executor(llm, registry);

    let step = test_step(1, &["customer_db"]);
    let result = executor.execute_step_with_retry("q", &step, &[]).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    let error = result.error.unwrap();
    assert!(error.starts_with("Non-recoverable error (permission):"));
    assert!(error.contains("role lacks SELECT"));
    // Attempt 3 never ran.
    assert_eq!(source.executed().len(), 2);
}

#[tokio::test]
async fn recoverable_without_suggestion_fails_immediately() {
    let llm = ScriptedLlm::new(vec![
        json!({ "sql": "SELECT 1", "database": "customer_db", "reasoning": "" }),
        json!({
            "is_recoverable": true,
            "reasoning": "should be fixable",
            "error_type": "other"
        }),
    ]);

    let source = ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![QueryResult::failed("boom")],
    );

    let registry = build_registry(vec![source]);
    let mut executor = build_executor(llm, registry);

    let step = test_step(1, &["customer_db"]);
    let result = executor.execute_step_with_retry("q", &step, &[]).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(result
        .error
        .unwrap()
        .contains("Error analysis failed to provide corrected SQL"));
}

#[tokio::test]
async fn plan_execution_is_fail_fast() {
    let llm = ScriptedLlm::new(vec![
        json!({ "sql": "SELECT 1 AS one", "database": "customer_db", "reasoning": "" }),
        json!({ "sql": "SELECT nope", "database": "customer_db", "reasoning": "" }),
        json!({
            "is_recoverable": false,
            "reasoning": "table does not exist",
            "error_type": "schema"
        }),
    ]);

    let source = ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![
            rows_result(vec![row(&[("one", json!(1))])]),
            QueryResult::failed("relation \"nope\" does not exist"),
        ],
    );

    let registry = build_registry(vec![source.clone()]);
    let mut executor = build_executor(llm.clone(), registry);

    let plan = empty_plan_with(vec![
        test_step(1, &["customer_db"]),
        test_step(2, &["customer_db"]),
        test_step(3, &["customer_db"]),
    ]);

    let results = executor.execute_plan("q", &plan).await;

    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert!(!results[1].success);
    // Step 3 never generated SQL or touched the datasource.
    assert_eq!(llm.remaining(), 0);
    assert_eq!(source.executed().len(), 2);
}

#[tokio::test]
async fn execution_failure_returns_execution_error_envelope() {
    let llm = ScriptedLlm::new(vec![
        validation_json(&["customer_db"]),
        json!({ "action": "create_plan", "reasoning": "needs data" }),
        plan_json(json!([
            {
                "step_number": 1,
                "description": "bad step",
                "databases": ["customer_db"],
                "tables": ["customers"],
                "operation": "single_query"
            }
        ])),
        json!({ "sql": "SELECT x", "database": "customer_db", "reasoning": "" }),
        json!({
            "is_recoverable": false,
            "reasoning": "column does not exist",
            "error_type": "schema"
        }),
    ]);

    let registry = build_registry(vec![ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![QueryResult::failed("column \"x\" does not exist")],
    )]);
    let mut orchestrator = build_orchestrator(llm, registry);

    let response = orchestrator.process_question("Show x", &[]).await;

    assert_eq!(response.kind, ResponseKind::ExecutionError);
    assert!(response.message.contains("Step 1 failed"));
    let results = response.metadata["execution_results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["success"], json!(false));
}

// An exhausted script surfaces as an anyhow error from the client, which the
// orchestrator must convert into the generic error envelope instead of
// panicking.
#[tokio::test]
async fn llm_failure_becomes_error_envelope() {
    let llm = ScriptedLlm::new(vec![]);
    let registry = build_registry(vec![ScriptedSource::new(
        "main_postgres",
        &["customer_db"],
        vec![],
    )]);
    let mut orchestrator = build_orchestrator(llm, registry);

    let response = orchestrator.process_question("Anything", &[]).await;

    assert_eq!(response.kind, ResponseKind::Error);
    assert!(response.metadata["error"].is_string());
    assert!(response.metadata["pipeline_time_ms"].is_u64());
}
