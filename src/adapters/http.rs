//! HTTP client for a hosted agent service.
//!
//! Endpoints:
//! - POST {endpoint}/agents/{name}/invoke  -> { "output": "..." }
//! - GET  {endpoint}/agents/{name}         -> AgentProfile
//! - GET  {endpoint}/health
//!
//! Auth: optional Bearer token

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Agent, AgentProfile, AgentRequest};

/// Agent service client
pub struct HttpAgent {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

/// Body of an invoke call
#[derive(Debug, Serialize)]
struct InvokePayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    message: &'a str,
    context: &'a serde_json::Value,
}

/// Reply of an invoke call
#[derive(Debug, Deserialize)]
struct InvokeResponse {
    output: String,
}

impl HttpAgent {
    /// Create a new client
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("RUNBOOK_AGENT_ENDPOINT")
            .context("RUNBOOK_AGENT_ENDPOINT environment variable required")?;
        let token = std::env::var("RUNBOOK_AGENT_TOKEN").ok();
        Ok(Self::new(endpoint, token))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, agent: &str, request: &AgentRequest) -> Result<String> {
        let url = format!("{}/agents/{}/invoke", self.endpoint, agent);
        let payload = InvokePayload {
            instructions: request.instructions.as_deref(),
            message: &request.message,
            context: &request.context,
        };

        let response = self
            .authorized(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach agent '{}'", agent))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent '{}' error ({}): {}", agent, status, text);
        }

        let body: InvokeResponse = response
            .json()
            .await
            .with_context(|| format!("Malformed reply envelope from agent '{}'", agent))?;

        Ok(body.output)
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        let url = format!("{}/agents/{}", self.endpoint, agent);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("Failed to describe agent '{}'", agent))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Agent '{}' not available ({})", agent, status);
        }

        response
            .json()
            .await
            .with_context(|| format!("Malformed profile for agent '{}'", agent))
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.endpoint);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("Agent service unreachable")?;

        if !response.status().is_success() {
            anyhow::bail!("Agent service unhealthy ({})", response.status());
        }
        Ok(())
    }
}
