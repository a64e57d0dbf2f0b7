//! Error types for the query orchestration engine
//!
//! SQL execution failures are modeled as data (`QueryResult` with
//! `success = false`) and step failures as `StepExecutionResult`; the
//! variants here cover everything that terminates a pipeline stage.

use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad datasource or schema setup, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unknown or cross-datasource database references
    #[error("Datasource resolution error: {0}")]
    DatasourceResolution(String),

    /// Prompt template missing, malformed, or left a placeholder unresolved
    #[error("Prompt template error: {0}")]
    PromptTemplate(String),

    /// The LLM response could not be parsed into the target schema
    #[error("Structured output validation failed for {schema}: {message}")]
    StructuredOutput { schema: String, message: String },

    /// Provider or transport failure from the LLM client
    #[error("LLM request failed: {0}")]
    Llm(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for failures with no better category; converted to a
    /// failed step or an `error` envelope at the request boundary
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
