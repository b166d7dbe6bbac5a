//! Agent service interfaces.
//!
//! An [`Agent`] backend knows how to reach named agents: the HTTP backend
//! talks to a hosted agent service, the stub backend answers offline with
//! recorded replies. Retry and decoding live above this layer in the invoker.

pub mod http;
pub mod stub;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use http::HttpAgent;
pub use stub::StubAgent;

/// A request to a named agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// System instructions from the agent's profile (filled in by the invoker)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// User-facing prompt
    pub message: String,

    /// Structured context (payment, prior results, evidence)
    #[serde(default)]
    pub context: Value,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            instructions: None,
            message: message.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Look up a string field in the context
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// Static metadata describing an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Trait for agent service backends
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Prefix for invocation ids minted against this backend
    fn call_prefix(&self) -> &str {
        "call"
    }

    /// Send one request to `agent` and return its raw reply text
    async fn invoke(&self, agent: &str, request: &AgentRequest) -> Result<String>;

    /// Fetch the agent's profile
    async fn describe(&self, agent: &str) -> Result<AgentProfile>;

    /// Health check (for HTTP backends)
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
