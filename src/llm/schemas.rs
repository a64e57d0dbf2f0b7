//! Structured output schemas for LLM stages
//!
//! Each stage constrains the model to one of these shapes via a forced tool
//! call; the tool parameter schemas are declared by hand next to the types
//! they mirror.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::datasource::Row;
use crate::llm::client::ToolDefinition;

/// Result of validating a question against the available data sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_relevant: bool,
    pub reasoning: String,
    #[serde(default)]
    pub suggested_response: Option<String>,
    #[serde(default)]
    pub relevant_databases: Vec<String>,
}

impl ValidationResult {
    pub fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "provide_validation_result".to_string(),
            description: "Record whether the question is answerable from the available data sources".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "is_relevant": {
                        "type": "boolean",
                        "description": "Whether the question is relevant to available data sources"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Explanation of why the question is or isn't relevant"
                    },
                    "suggested_response": {
                        "type": "string",
                        "description": "Suggested response if the question is not relevant"
                    },
                    "relevant_databases": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Database IDs relevant to answering the question"
                    }
                },
                "required": ["is_relevant", "reasoning"]
            }),
        }
    }
}

/// Pipeline branch chosen by the decision stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    AskClarification,
    CreatePlan,
    AnswerDirectly,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub action: DecisionAction,
    pub reasoning: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl DecisionResult {
    pub fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "provide_decision_result".to_string(),
            description: "Decide what action to take next for this question".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["ask_clarification", "create_plan", "answer_directly", "reject"],
                        "description": "The action to take"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Why this action was chosen"
                    },
                    "message": {
                        "type": "string",
                        "description": "Message to send to the user (for ask_clarification, answer_directly, or reject)"
                    }
                },
                "required": ["action", "reasoning"]
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub question: String,
    #[serde(default)]
    pub reason: String,
}

/// Kind of SQL work one plan step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOperation {
    SingleQuery,
    JoinQuery,
    Aggregation,
    Calculation,
}

impl StepOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleQuery => "single_query",
            Self::JoinQuery => "join_query",
            Self::Aggregation => "aggregation",
            Self::Calculation => "calculation",
        }
    }
}

/// One atomic unit of SQL work within an ordered plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlanStep {
    /// 1-based sequence number; steps execute strictly in this order
    pub step_number: i32,
    pub description: String,
    /// Must all resolve to a single datasource
    pub databases: Vec<String>,
    pub tables: Vec<String>,
    pub operation: StepOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub summary: String,
    pub steps: Vec<QueryPlanStep>,
    pub expected_output: String,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_questions: Vec<ClarificationQuestion>,
}

impl QueryPlan {
    /// Union of every step's databases, deduplicated, for the one-shot
    /// single-datasource check.
    pub fn all_databases(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        self.steps
            .iter()
            .flat_map(|step| step.databases.iter())
            .filter(|db| seen.insert(db.as_str().to_string()))
            .cloned()
            .collect()
    }

    pub fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "provide_query_plan".to_string(),
            description: "Provide the ordered plan of SQL steps that answers the question".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "summary": {
                        "type": "string",
                        "description": "High-level summary of how to answer the question"
                    },
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "step_number": {
                                    "type": "integer",
                                    "description": "Sequential step number starting from 1"
                                },
                                "description": { "type": "string" },
                                "databases": {
                                    "type": "array",
                                    "items": { "type": "string" },
                                    "description": "Database names involved, e.g. ['customer_db']"
                                },
                                "tables": {
                                    "type": "array",
                                    "items": { "type": "string" }
                                },
                                "operation": {
                                    "type": "string",
                                    "enum": ["single_query", "join_query", "aggregation", "calculation"]
                                }
                            },
                            "required": ["step_number", "description", "databases", "tables", "operation"]
                        }
                    },
                    "expected_output": {
                        "type": "string",
                        "description": "What the final result will contain"
                    },
                    "needs_clarification": { "type": "boolean" },
                    "clarification_questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "question": { "type": "string" },
                                "reason": { "type": "string" }
                            },
                            "required": ["question"]
                        }
                    }
                },
                "required": ["summary", "steps", "expected_output"]
            }),
        }
    }
}

/// SQL produced for one plan step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlGenerationResult {
    pub sql: String,
    /// Logical database the statement must run against
    pub database: String,
    #[serde(default)]
    pub reasoning: String,
}

impl SqlGenerationResult {
    pub fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "provide_sql".to_string(),
            description: "Provide the SQL statement for this plan step".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "The SQL statement to execute"
                    },
                    "database": {
                        "type": "string",
                        "description": "Logical database to run the statement against"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Why this SQL answers the step"
                    }
                },
                "required": ["sql", "database"]
            }),
        }
    }
}

/// Post-hoc classification of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorKind {
    Syntax,
    Schema,
    Permission,
    Connection,
    Data,
    Other,
}

impl SqlErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Schema => "schema",
            Self::Permission => "permission",
            Self::Connection => "connection",
            Self::Data => "data",
            Self::Other => "other",
        }
    }
}

/// Diagnosis of a failed attempt; drives retry continuation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysisResult {
    pub is_recoverable: bool,
    pub reasoning: String,
    #[serde(default)]
    pub suggested_sql: Option<String>,
    pub error_type: SqlErrorKind,
}

impl ErrorAnalysisResult {
    pub fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "provide_error_analysis".to_string(),
            description: "Diagnose the failed SQL and suggest a correction if possible".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "is_recoverable": {
                        "type": "boolean",
                        "description": "Whether a corrected statement could succeed"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Diagnosis of what went wrong"
                    },
                    "suggested_sql": {
                        "type": "string",
                        "description": "Corrected SQL to try next, if recoverable"
                    },
                    "error_type": {
                        "type": "string",
                        "enum": ["syntax", "schema", "permission", "connection", "data", "other"]
                    }
                },
                "required": ["is_recoverable", "reasoning", "error_type"]
            }),
        }
    }
}

/// Outcome of one plan step after the retry loop finishes. Exactly one of
/// `result_data` / `result_value` is populated on success; both are empty on
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_number: i32,
    pub success: bool,
    /// Final SQL, post-correction
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub result_data: Option<Vec<Row>>,
    #[serde(default)]
    pub result_value: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
}

/// Confidence of the final answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Terminal artifact of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub answer: String,
    pub is_answerable: bool,
    pub confidence: Confidence,
    #[serde(default)]
    pub data_sources_used: Vec<String>,
}

impl SummaryResult {
    pub fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "provide_summary".to_string(),
            description: "Write the final answer from the executed results".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "string",
                        "description": "Natural-language answer to the original question"
                    },
                    "is_answerable": {
                        "type": "boolean",
                        "description": "Whether the results actually answer the question"
                    },
                    "confidence": {
                        "type": "string",
                        "enum": ["high", "medium", "low"]
                    },
                    "data_sources_used": {
                        "type": "array",
                        "items": { "type": "string" }
                    }
                },
                "required": ["answer", "is_answerable", "confidence"]
            }),
        }
    }
}
