//! Resilient wrapper around agent calls.
//!
//! Every call gets one invocation id for its whole retry sequence, so the
//! id recorded in audit trails identifies the logical call, not an attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Agent, AgentProfile, AgentRequest};
use crate::domain::short_id;

/// Retry policy for agent calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failure in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Never sleeps between attempts (tests, dry runs)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay after the given failed attempt (1-indexed): `D * B^(attempt-1)`, capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sum of the delays slept when the first `failures` attempts fail
    pub fn total_delay(&self, failures: u32) -> Duration {
        (1..=failures).map(|a| self.delay_for_attempt(a)).sum()
    }
}

/// A successful agent call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Raw reply text
    pub text: String,
    /// Invocation id shared by every attempt of this call
    pub call_id: String,
    /// Attempts used (1 = first try succeeded)
    pub attempts: u32,
    /// Wall time including backoff sleeps
    pub duration_ms: u64,
}

/// Raised only after every attempt failed
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("Agent '{agent}' failed after {attempts} attempts (call {call_id}): {message}")]
    Exhausted {
        agent: String,
        call_id: String,
        attempts: u32,
        message: String,
    },
}

impl InvocationError {
    pub fn call_id(&self) -> &str {
        match self {
            Self::Exhausted { call_id, .. } => call_id,
        }
    }
}

/// Retrying, profile-caching front for an agent backend
pub struct Invoker {
    backend: Arc<dyn Agent>,
    policy: RetryPolicy,
    profiles: RwLock<HashMap<String, AgentProfile>>,
}

impl Invoker {
    pub fn new(backend: Arc<dyn Agent>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `agent`, retrying failed attempts with exponential backoff
    #[instrument(skip(self, request), fields(agent = %agent))]
    pub async fn invoke(
        &self,
        agent: &str,
        request: AgentRequest,
    ) -> Result<Invocation, InvocationError> {
        let call_id = format!("{}-{}-{}", self.backend.call_prefix(), agent, short_id());
        let request = self.with_profile(agent, request).await;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(%call_id, attempt, "Invoking agent");

            match self.backend.invoke(agent, &request).await {
                Ok(text) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(%call_id, attempt, duration_ms, "Agent responded");
                    return Ok(Invocation {
                        text,
                        call_id,
                        attempts: attempt,
                        duration_ms,
                    });
                }
                Err(e) => {
                    if self.policy.should_retry(attempt) {
                        let delay = self.policy.delay_for_attempt(attempt);
                        warn!(
                            %call_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Agent call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(%call_id, attempt, error = %e, "Agent call failed permanently");
                    return Err(InvocationError::Exhausted {
                        agent: agent.to_string(),
                        call_id,
                        attempts: attempt,
                        message: format!("{:#}", e),
                    });
                }
            }
        }
    }

    /// Prepend the agent's cached instructions; profiles are fetched once
    async fn with_profile(&self, agent: &str, mut request: AgentRequest) -> AgentRequest {
        if request.instructions.is_some() {
            return request;
        }

        if let Some(profile) = self.profiles.read().await.get(agent) {
            request.instructions = profile.instructions.clone();
            return request;
        }

        match self.backend.describe(agent).await {
            Ok(profile) => {
                request.instructions = profile.instructions.clone();
                self.profiles.write().await.insert(agent.to_string(), profile);
            }
            Err(e) => {
                // Not cached, so the next call tries again
                warn!(agent, error = %e, "Agent profile unavailable");
            }
        }
        request
    }
}
