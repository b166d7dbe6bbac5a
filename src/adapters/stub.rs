//! Offline agent backend for dry runs.
//!
//! Answers every agent with a recorded reply computed from the request
//! context, after a simulated latency. Replies are deliberately wrapped in
//! prose and fences like real model output so the decode path is exercised.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Agent, AgentProfile, AgentRequest};
use crate::domain::payment::format_amount;
use crate::domain::{PortfolioResult, RiskTier};

/// Beneficiary name fragments that produce a hard sanctions block
pub const WATCH_LIST: &[&str] = &["MASKAN", "SINALOA"];

/// Liquidity threshold above which the stub reports a breach
const BREACH_THRESHOLD: f64 = 200_000.0;
const START_OF_DAY_BALANCE: f64 = 3_500_000.0;
const SCHEDULED_OUTFLOWS: f64 = 1_375_000.0;
const EXPECTED_INFLOWS: f64 = 250_000.0;

/// Which recorded reply an agent name maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sanctions,
    Liquidity,
    Procedures,
    Coordinator,
    Manager,
    Market,
    Risk,
    Returns,
    Optimizer,
    Compliance,
}

impl Role {
    fn of(agent: &str) -> Option<Self> {
        let name = agent.to_ascii_lowercase();
        let table = [
            ("sanction", Self::Sanctions),
            ("liquidity", Self::Liquidity),
            ("procedure", Self::Procedures),
            ("coordinator", Self::Coordinator),
            ("manager", Self::Manager),
            ("market", Self::Market),
            ("risk", Self::Risk),
            ("return", Self::Returns),
            ("optimi", Self::Optimizer),
            ("compliance", Self::Compliance),
        ];
        table
            .iter()
            .find(|(fragment, _)| name.contains(fragment))
            .map(|(_, role)| *role)
    }
}

/// Dry-run agent backend
#[derive(Debug, Clone)]
pub struct StubAgent {
    latency: Duration,
}

impl Default for StubAgent {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

impl StubAgent {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    /// No simulated latency (tests)
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    fn reply(&self, agent: &str, request: &AgentRequest) -> Result<Value> {
        let role = Role::of(agent)
            .ok_or_else(|| anyhow::anyhow!("No recorded reply for agent '{}'", agent))?;
        let ctx = &request.context;

        Ok(match role {
            Role::Sanctions => sanctions_reply(ctx),
            Role::Liquidity => liquidity_reply(ctx),
            Role::Procedures => procedures_reply(ctx),
            Role::Coordinator => coordinator_reply(ctx),
            Role::Manager => manager_reply(ctx),
            Role::Market => json!({
                "agent": agent,
                "summary": "Market regime: moderate volatility, rates stable",
                "confidence": 0.8,
                "agree": true,
                "data": { "regime": "moderate_volatility", "rates_trend": "stable" }
            }),
            Role::Risk => json!({
                "agent": agent,
                "summary": "Portfolio VaR within mandate limits",
                "confidence": 0.85,
                "agree": true,
                "data": { "var_95": 0.042, "max_drawdown": 0.18 }
            }),
            Role::Returns => json!({
                "agent": agent,
                "summary": "Expected returns consistent with risk tier",
                "confidence": 0.8,
                "agree": true,
                "data": { "expected_return": 7.0 }
            }),
            Role::Optimizer => optimizer_reply(agent, ctx),
            Role::Compliance => json!({
                "agent": agent,
                "summary": "Allocation complies with investment policy constraints",
                "confidence": 0.9,
                "approved": true,
                "agree": true
            }),
        })
    }
}

#[async_trait]
impl Agent for StubAgent {
    fn name(&self) -> &str {
        "stub"
    }

    fn call_prefix(&self) -> &str {
        "stub"
    }

    async fn invoke(&self, agent: &str, request: &AgentRequest) -> Result<String> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let reply = self.reply(agent, request)?;
        let body = serde_json::to_string_pretty(&reply)?;
        Ok(format!(
            "Analysis complete for {}.\n\n```json\n{}\n```",
            agent, body
        ))
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        Ok(AgentProfile {
            name: agent.to_string(),
            instructions: Some(format!(
                "You are {}. Reply with a single JSON object.",
                agent
            )),
            model: Some("stub".to_string()),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn payment_field<'a>(ctx: &'a Value, key: &str) -> Option<&'a Value> {
    ctx.get("payment").unwrap_or(ctx).get(key)
}

fn sanctions_reply(ctx: &Value) -> Value {
    let beneficiary = payment_field(ctx, "beneficiary_name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let upper = beneficiary.to_uppercase();

    let audit = json!({
        "index_queried": "idx-ofac-sdn-v1 (STUB)",
        "lists_checked": ["OFAC SDN", "EU Sanctions", "UN Sanctions"]
    });

    match WATCH_LIST.iter().find(|token| upper.contains(*token)) {
        Some(token) => json!({
            "agent": "sanctions_agent",
            "decision": "BLOCK",
            "confidence": 98,
            "match_type": "EXACT",
            "match_details": {
                "matched_entity": token,
                "programs": ["IRAN", "IRAN-EO13902"],
                "entity_type": "Entity"
            },
            "recommendation": "REJECT payment immediately. Generate compliance case.",
            "pass_to_next_agent": false,
            "audit": audit
        }),
        None => json!({
            "agent": "sanctions_agent",
            "decision": "CLEAR",
            "confidence": 100,
            "match_type": "NONE",
            "recommendation": "No sanctions match. Payment may proceed to liquidity screening.",
            "pass_to_next_agent": true,
            "audit": audit
        }),
    }
}

fn liquidity_reply(ctx: &Value) -> Value {
    let amount = payment_field(ctx, "amount")
        .and_then(Value::as_f64)
        .unwrap_or_default();
    let currency = payment_field(ctx, "currency")
        .and_then(Value::as_str)
        .unwrap_or("USD");

    let breach = amount > BREACH_THRESHOLD;
    let buffer = if currency == "USD" { 2_000_000.0 } else { 1_500_000.0 };
    let projected = START_OF_DAY_BALANCE - amount - SCHEDULED_OUTFLOWS;
    let gap = if breach { (buffer - projected).max(0.0) } else { 0.0 };
    let outflows = amount + SCHEDULED_OUTFLOWS;

    let (action, reason, alternatives) = if breach {
        (
            "HOLD",
            format!(
                "Payment would breach buffer by ${}",
                format_amount(gap.round()).trim_end_matches(".00")
            ),
            vec![
                "Delay payment until inflows received",
                "Request partial release",
                "Escalate to treasury for funding",
            ],
        )
    } else {
        ("RELEASE", "Sufficient liquidity available".to_string(), Vec::new())
    };

    json!({
        "agent": "liquidity_agent",
        "breach_assessment": {
            "breach": breach,
            "first_breach_time": if breach { Some("2026-01-30T14:30:00Z") } else { None },
            "gap_amount": gap,
            "projected_min_balance": projected,
            "buffer_threshold": buffer,
            "headroom": projected - buffer
        },
        "account_summary": {
            "start_of_day_balance": START_OF_DAY_BALANCE,
            "total_outflows": outflows,
            "total_inflows": EXPECTED_INFLOWS,
            "net_flow": -(outflows - EXPECTED_INFLOWS),
            "projected_end_of_day": projected
        },
        "recommendation": {
            "action": action,
            "reason": reason,
            "alternatives": alternatives
        },
        "audit": {
            "data_source": "intraday_positions (STUB)",
            "cutoff_time": "16:00"
        }
    })
}

fn procedures_reply(ctx: &Value) -> Value {
    let sanctions = ctx
        .pointer("/sanctions/decision")
        .and_then(Value::as_str)
        .unwrap_or("CLEAR");
    let breach = ctx
        .pointer("/liquidity/breach_assessment/breach")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let (action, reason) = match sanctions {
        "BLOCK" => ("REJECT", "Sanctions BLOCK decision requires immediate rejection"),
        "ESCALATE" => ("HOLD", "Sanctions ESCALATE requires compliance review"),
        _ if breach => (
            "HOLD",
            "Liquidity breach detected, requires Treasury Manager approval",
        ),
        _ => ("PROCEED", "All checks passed, payment may proceed"),
    };

    let approvals = if action == "HOLD" {
        json!([
            { "role": "Treasury Manager", "authority": "Evaluate hold/release options", "sla_hours": 2 },
            { "role": "Head of Treasury", "authority": "Secondary approval for override", "sla_hours": 4 }
        ])
    } else {
        json!([
            { "role": "Payments Operator", "authority": "Execute payment release", "sla_hours": 1 }
        ])
    };

    json!({
        "agent": "procedures_agent",
        "workflow_determination": {
            "final_action": action,
            "reason": reason,
            "policy_reference": "runbook_emergency_payment.md Section 6.1"
        },
        "approvals_required": approvals,
        "procedure_checklist": [
            { "step": 1, "action": format!("{} the payment", action), "responsible": "System (automatic)", "documentation": "Status timestamp, reason code" },
            { "step": 2, "action": "Notify relevant approvers", "responsible": "System (automatic)", "documentation": "Notification timestamp" },
            { "step": 3, "action": "Execute final decision", "responsible": "Payments Operator", "documentation": "Final status, execution timestamp" }
        ],
        "citations": [
            {
                "source": "runbook_emergency_payment.md",
                "snippet": "Per Section 6.1, payments with liquidity breach must be held pending approval",
                "reference": "runbook_emergency_payment.md#section-6.1"
            },
            {
                "source": "policy_approval_matrix.md",
                "snippet": "Amounts > USD 100,000 require Treasury Manager approval",
                "reference": "policy_approval_matrix.md#authority-limits"
            }
        ],
        "audit_bundle": {
            "sanctions_decision": sanctions,
            "liquidity_breach": breach
        },
        "escalation_contacts": [
            { "role": "Treasury Manager", "channel": "treasury-desk" },
            { "role": "Compliance Officer", "channel": "compliance-desk" }
        ],
        "audit": {
            "policies_consulted": [
                "runbook_emergency_payment.md",
                "policy_approval_matrix.md",
                "policy_sod_controls.md"
            ]
        }
    })
}

fn string_list(ctx: &Value, key: &str) -> Vec<String> {
    ctx.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Delegate to the first specialist not yet visited, then report done
fn coordinator_reply(ctx: &Value) -> Value {
    let specialists = string_list(ctx, "specialists");
    let visited = string_list(ctx, "visited");

    match specialists.iter().find(|s| !visited.contains(s)) {
        Some(next) => json!({
            "agent": "coordinator",
            "handoff_to": next,
            "reason": format!("{} has not reported yet", next)
        }),
        None => json!({
            "agent": "coordinator",
            "done": true,
            "summary": "All specialists reported; ready to commit"
        }),
    }
}

/// Two planning rounds: analysis first, then optimization and compliance
fn manager_reply(ctx: &Value) -> Value {
    let available = string_list(ctx, "available_agents");
    let completed = string_list(ctx, "completed");

    let pick = |fragment: &str| -> Option<String> {
        available
            .iter()
            .find(|a| a.contains(fragment) && !completed.contains(a))
            .cloned()
    };

    let analysis: Vec<String> = ["market", "risk", "return"]
        .into_iter()
        .filter_map(|f| pick(f))
        .collect();
    let steps: Vec<String> = if !analysis.is_empty() {
        analysis
    } else {
        ["optimi", "compliance"]
            .into_iter()
            .filter_map(|f| pick(f))
            .collect()
    };

    if steps.is_empty() {
        json!({ "agent": "manager", "done": true, "summary": "Plan executed" })
    } else {
        json!({
            "agent": "manager",
            "done": false,
            "plan": steps,
            "summary": format!("Next round: {}", steps.join(", "))
        })
    }
}

fn optimizer_reply(agent: &str, ctx: &Value) -> Value {
    let tier: RiskTier = ctx
        .pointer("/mandate/risk_tier")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let proposal = PortfolioResult::default_for(tier);

    json!({
        "agent": agent,
        "summary": format!("Optimized {} allocation across {} holdings", tier.as_str(), proposal.allocations.len()),
        "confidence": 0.82,
        "agree": true,
        "allocations": proposal.allocations,
        "metrics": proposal.metrics
    })
}
