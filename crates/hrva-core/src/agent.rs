//! Query agent seam. The stub echoes the question back until a model-backed
//! agent is wired in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub answer: String,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent backend failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait QueryAgent: Send + Sync {
    /// Answer a user question written in Russian or English.
    async fn answer(&self, text: &str) -> Result<AgentResult, AgentError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StubAgent;

#[async_trait]
impl QueryAgent for StubAgent {
    async fn answer(&self, text: &str) -> Result<AgentResult, AgentError> {
        let cleaned = text.trim();
        let answer = if cleaned.is_empty() {
            "Empty request text.".to_string()
        } else {
            format!("Received by agent: {cleaned}")
        };
        Ok(AgentResult {
            answer,
            metadata: None,
        })
    }
}
