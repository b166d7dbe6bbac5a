//! Invoker Integration Tests
//!
//! Retry/backoff timing under paused tokio time, exhaustion, and JSON
//! recovery from real-looking replies.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use runbook::adapters::{Agent, AgentProfile, AgentRequest};
use runbook::core::extract::{decode, extract_json};
use runbook::core::{InvocationError, Invoker, RetryPolicy};
use runbook::domain::SanctionsResult;
use serde_json::json;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

/// Fails the first `failures` calls, then echoes the agent name as JSON
struct Scripted {
    failures: u32,
    calls: AtomicU32,
    describes: AtomicU32,
}

impl Scripted {
    fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            describes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Agent for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, agent: &str, _request: &AgentRequest) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            anyhow::bail!("503 Service Unavailable (attempt {})", n + 1);
        }
        Ok(format!("{{\"agent\": \"{}\"}}", agent))
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        Ok(AgentProfile {
            name: agent.to_string(),
            instructions: Some("Reply in JSON".to_string()),
            model: None,
        })
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_delay_ms: 1000,
        max_delay_ms: 30_000,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_sum_geometrically() {
    let agent = Scripted::failing(3);
    let invoker = Invoker::new(agent.clone(), policy());

    let started = Instant::now();
    let invocation = assert_ok!(invoker.invoke("risk_analyst", AgentRequest::new("go")).await);

    // 1s + 2s + 4s
    assert_eq!(started.elapsed(), Duration::from_secs(7));
    assert_eq!(policy().total_delay(3), Duration::from_secs(7));
    assert_eq!(invocation.attempts, 4);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
    assert!(invocation.call_id.contains("risk_analyst"));
}

#[tokio::test(start_paused = true)]
async fn test_delay_is_capped() {
    let policy = RetryPolicy {
        max_attempts: 6,
        initial_delay_ms: 10_000,
        max_delay_ms: 15_000,
        backoff_multiplier: 3.0,
    };
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(15));
    assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(15));

    let invoker = Invoker::new(Scripted::failing(2), policy);
    let started = Instant::now();
    assert_ok!(invoker.invoke("a", AgentRequest::new("go")).await);
    assert_eq!(started.elapsed(), Duration::from_secs(25));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_reports_one_call_id() {
    let agent = Scripted::failing(10);
    let invoker = Invoker::new(agent.clone(), policy());

    let err = assert_err!(invoker.invoke("liquidity-screening-agent", AgentRequest::new("go")).await);
    let InvocationError::Exhausted {
        attempts, call_id, ..
    } = &err;
    assert_eq!(*attempts, 4);
    assert_eq!(call_id, err.call_id());
    assert!(err.to_string().contains("503"));
    assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_profile_fetched_once() {
    let agent = Scripted::failing(0);
    let invoker = Invoker::new(agent.clone(), RetryPolicy::immediate(1));

    invoker.invoke("a", AgentRequest::new("1")).await.unwrap();
    invoker.invoke("a", AgentRequest::new("2")).await.unwrap();
    invoker.invoke("b", AgentRequest::new("3")).await.unwrap();

    assert_eq!(agent.describes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_json_recovered_from_chatty_reply() {
    let reply = "Sure! Here is the screening result:\n\n```json\n{\n  \"decision\": \"CLEAR\",\n  \"confidence\": 100,\n  \"match_type\": \"NONE\",\n  \"pass_to_next_agent\": true\n}\n```\nLet me know if you need more.";

    assert_eq!(extract_json(reply).unwrap()["decision"], json!("CLEAR"));
    let result: SanctionsResult = decode(reply, "sanctions result").unwrap();
    assert!(result.pass_to_next_agent);
}

#[test]
fn test_reply_without_json_is_a_decode_error() {
    assert!(extract_json("I could not complete the screening.").is_err());
    assert!(decode::<SanctionsResult>("{\"confidence\": 12}", "sanctions result").is_err());
}
