//! askdb — multi-stage LLM query orchestration over named relational
//! datasources
//!
//! Turns a natural-language question about a fixed set of logical databases
//! into a verified answer: a validate/decide/plan pipeline of structured LLM
//! calls, an agentic executor that generates and repairs SQL against pooled
//! connections, and a registry that routes logical database names to the
//! physical backend hosting them.
//!
//! The HTTP surface, message persistence, and process bootstrap live in the
//! calling application; this crate's public output is the
//! [`llm::EngineResponse`] envelope.

pub mod catalog;
pub mod config;
pub mod datasource;
pub mod error;
pub mod llm;

pub use catalog::{Catalog, SchemaStore};
pub use config::DatasourcesConfig;
pub use datasource::{
    DataSource, DatasourceRegistry, DatasourceValidation, PostgresDataSource, QueryResult, Row,
};
pub use error::{EngineError, Result};
pub use llm::{
    AnthropicClient, ConversationTurn, EngineResponse, LlmClient, QueryOrchestrator, ResponseKind,
    StepExecutor,
};
