//! Orchestration topologies.
//!
//! A topology decides which agent tasks exist and in what order they run.
//! Static topologies lay out the whole plan up front and let the graph
//! driver walk it; dynamic ones (handoff, magentic, group chat) append tasks
//! turn by turn based on agent replies.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::engine::Execution;
use crate::domain::{Decision, DecisionType, EventBody, Mandate, Plan, Task, TaskKind, TopologyKind};

pub const MARKET_ANALYST: &str = "market_analyst";
pub const RISK_ANALYST: &str = "risk_analyst";
pub const RETURN_ANALYST: &str = "return_analyst";
pub const PORTFOLIO_OPTIMIZER: &str = "portfolio_optimizer";
pub const COMPLIANCE_OFFICER: &str = "compliance_officer";
pub const COORDINATOR: &str = "coordinator";
pub const MANAGER: &str = "manager";

/// Specialists in their default working order
pub const SPECIALISTS: [&str; 5] = [
    MARKET_ANALYST,
    RISK_ANALYST,
    RETURN_ANALYST,
    PORTFOLIO_OPTIMIZER,
    COMPLIANCE_OFFICER,
];

/// Participants of a group discussion, in speaking order
const DISCUSSION: [&str; 4] = [
    RISK_ANALYST,
    RETURN_ANALYST,
    PORTFOLIO_OPTIMIZER,
    COMPLIANCE_OFFICER,
];

const GROUP_CHAT_TURNS: usize = 10;
const MAGENTIC_ROUNDS: usize = 15;
const MAGENTIC_ROUNDS_ESG: usize = 20;

/// Task kind a specialist is asked to perform
pub fn kind_for(agent: &str) -> TaskKind {
    match agent {
        MARKET_ANALYST => TaskKind::FetchMarketData,
        RISK_ANALYST => TaskKind::ComputeRisk,
        RETURN_ANALYST => TaskKind::ComputeReturns,
        PORTFOLIO_OPTIMIZER => TaskKind::OptimizePortfolio,
        COMPLIANCE_OFFICER => TaskKind::CheckCompliance,
        _ => TaskKind::AnalyzePolicy,
    }
}

#[async_trait]
pub trait Topology: Send + Sync {
    fn kind(&self) -> TopologyKind;

    /// One-line description used in the selection event
    fn describe(&self, mandate: &Mandate) -> String;

    /// Lay out tasks known before execution starts
    fn build_plan(&self, _plan: &mut Plan) {}

    /// Walk the plan to completion
    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()>;
}

struct Sequential;
struct Concurrent;
struct Dag;
struct Handoff;
struct Magentic;
struct GroupChat;

static TOPOLOGIES: [&dyn Topology; 6] = [
    &Sequential,
    &Concurrent,
    &Handoff,
    &Magentic,
    &Dag,
    &GroupChat,
];

/// Look up the implementation of a topology
pub fn topology_for(kind: TopologyKind) -> &'static dyn Topology {
    TOPOLOGIES
        .iter()
        .copied()
        .find(|t| t.kind() == kind)
        .unwrap_or(&Handoff)
}

/// Run every task laid out by `build_plan`
async fn drive_graph(exec: &mut Execution<'_>) -> Result<()> {
    let ids = exec.task_ids();
    exec.run_tasks(&ids).await
}

#[async_trait]
impl Topology for Sequential {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Sequential
    }

    fn describe(&self, _mandate: &Mandate) -> String {
        format!("Specialists run one after another: {}", SPECIALISTS.join(" -> "))
    }

    fn build_plan(&self, plan: &mut Plan) {
        let mut previous: Option<Task> = None;
        for agent in SPECIALISTS {
            let task = match &previous {
                Some(prev) => Task::new(kind_for(agent), agent).after(&[prev]),
                None => Task::new(kind_for(agent), agent),
            };
            previous = Some(task.clone());
            plan.tasks.push(task);
        }
    }

    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()> {
        drive_graph(exec).await
    }
}

#[async_trait]
impl Topology for Concurrent {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Concurrent
    }

    fn describe(&self, _mandate: &Mandate) -> String {
        format!(
            "{} and {} run in parallel, {} aggregates",
            RISK_ANALYST, RETURN_ANALYST, PORTFOLIO_OPTIMIZER
        )
    }

    fn build_plan(&self, plan: &mut Plan) {
        let risk = Task::new(kind_for(RISK_ANALYST), RISK_ANALYST);
        let returns = Task::new(kind_for(RETURN_ANALYST), RETURN_ANALYST);
        let aggregate = Task::new(kind_for(PORTFOLIO_OPTIMIZER), PORTFOLIO_OPTIMIZER)
            .after(&[&risk, &returns]);
        plan.tasks.extend([risk, returns, aggregate]);
    }

    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()> {
        drive_graph(exec).await
    }
}

#[async_trait]
impl Topology for Dag {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Dag
    }

    fn describe(&self, _mandate: &Mandate) -> String {
        "Market data feeds risk and return analysis in parallel, then optimization and compliance"
            .to_string()
    }

    fn build_plan(&self, plan: &mut Plan) {
        let market = Task::new(kind_for(MARKET_ANALYST), MARKET_ANALYST).with_priority(9);
        let risk = Task::new(kind_for(RISK_ANALYST), RISK_ANALYST).after(&[&market]);
        let returns = Task::new(kind_for(RETURN_ANALYST), RETURN_ANALYST).after(&[&market]);
        let optimize = Task::new(kind_for(PORTFOLIO_OPTIMIZER), PORTFOLIO_OPTIMIZER)
            .after(&[&risk, &returns]);
        let compliance =
            Task::new(kind_for(COMPLIANCE_OFFICER), COMPLIANCE_OFFICER).after(&[&optimize]);
        plan.tasks
            .extend([market, risk, returns, optimize, compliance]);
    }

    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()> {
        drive_graph(exec).await
    }
}

#[async_trait]
impl Topology for Handoff {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Handoff
    }

    fn describe(&self, _mandate: &Mandate) -> String {
        format!(
            "{} delegates to one specialist per turn, at most {} turns",
            COORDINATOR,
            SPECIALISTS.len() * 2
        )
    }

    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()> {
        let budget = SPECIALISTS.len() * 2;
        let mut visited: Vec<String> = Vec::new();

        for turn in 1..=budget {
            let coordinator = exec.add_task(
                Task::new(TaskKind::AnalyzePolicy, COORDINATOR).with_priority(8),
                json!({ "specialists": SPECIALISTS, "visited": visited, "turn": turn }),
            );
            let reply = exec.run_task(&coordinator).await?;

            let requested = reply
                .get("handoff_to")
                .and_then(Value::as_str)
                .filter(|a| SPECIALISTS.contains(a) && !visited.iter().any(|v| v == a));
            let next_unvisited = SPECIALISTS
                .iter()
                .copied()
                .find(|a| !visited.iter().any(|v| v == a));

            let (target, reasoning) = match requested {
                Some(agent) => (
                    agent.to_string(),
                    reply
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Coordinator handed off to {}", agent)),
                ),
                None if reply.get("done").and_then(Value::as_bool) == Some(true) => {
                    info!(turn, visited = visited.len(), "Coordinator finished");
                    return Ok(());
                }
                None => match next_unvisited {
                    Some(agent) => {
                        warn!(turn, fallback = agent, "Coordinator reply unusable, delegating in order");
                        (
                            agent.to_string(),
                            format!("No usable handoff, delegating to next specialist {}", agent),
                        )
                    }
                    None => return Ok(()),
                },
            };

            exec.record(
                Decision::new(DecisionType::Handoff, reasoning.clone(), 0.9, target.as_str())
                    .with_inputs(&["coordinator_reply", "visited_specialists"])
                    .with_agent(&target),
            );
            exec.emit(
                "handoff",
                Some(COORDINATOR),
                EventBody::branch(format!("turn {}", turn), target.clone(), reasoning),
            )
            .await?;

            let specialist = match exec.plan().task(&coordinator) {
                Some(coordinator_task) => {
                    Task::new(kind_for(&target), target.as_str()).after(&[coordinator_task])
                }
                None => Task::new(kind_for(&target), target.as_str()),
            };
            let id = exec.add_task(specialist, Value::Null);
            exec.run_task(&id).await?;
            visited.push(target);
        }

        warn!(budget, visited = visited.len(), "Handoff turn budget exhausted");
        Ok(())
    }
}

impl Magentic {
    fn rounds(mandate: &Mandate) -> usize {
        if mandate.esg_focus {
            MAGENTIC_ROUNDS_ESG
        } else {
            MAGENTIC_ROUNDS
        }
    }
}

#[async_trait]
impl Topology for Magentic {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Magentic
    }

    fn describe(&self, mandate: &Mandate) -> String {
        format!(
            "{} plans, observes and re-plans, at most {} rounds",
            MANAGER,
            Self::rounds(mandate)
        )
    }

    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()> {
        let rounds = Self::rounds(exec.mandate());

        for round in 1..=rounds {
            let completed = exec.plan().completed_agents();
            let manager = exec.add_task(
                Task::new(TaskKind::AnalyzePolicy, MANAGER).with_priority(8),
                json!({ "available_agents": SPECIALISTS, "completed": completed, "round": round }),
            );
            let reply = exec.run_task(&manager).await?;

            if reply.get("done").and_then(Value::as_bool) == Some(true) {
                info!(round, "Manager declared the plan complete");
                return Ok(());
            }

            let remaining: Vec<&str> = SPECIALISTS
                .iter()
                .copied()
                .filter(|a| !completed.iter().any(|c| c == a))
                .collect();
            let mut steps = planned_steps(&reply, &remaining);

            if steps.is_empty() {
                match remaining.first() {
                    Some(&next) => {
                        warn!(round, fallback = next, "Manager plan unusable, taking next specialist");
                        steps.push(next);
                    }
                    None => return Ok(()),
                }
            }

            exec.record(
                Decision::new(
                    DecisionType::Replan,
                    format!("Round {} plan: {}", round, steps.join(", ")),
                    0.85,
                    steps.join(","),
                )
                .with_inputs(&["completed_agents", "ledger_evidence"])
                .with_agent(MANAGER),
            );
            exec.emit(
                "replan",
                Some(MANAGER),
                EventBody::message(format!("Round {}: {}", round, steps.join(", "))),
            )
            .await?;

            let ids: Vec<String> = steps
                .iter()
                .map(|agent| {
                    let task = match exec.plan().task(&manager) {
                        Some(manager_task) => Task::new(kind_for(agent), *agent).after(&[manager_task]),
                        None => Task::new(kind_for(agent), *agent),
                    };
                    exec.add_task(task, json!({ "round": round }))
                })
                .collect();
            exec.run_tasks(&ids).await?;
        }

        warn!(rounds, "Magentic round budget exhausted");
        Ok(())
    }
}

#[async_trait]
impl Topology for GroupChat {
    fn kind(&self) -> TopologyKind {
        TopologyKind::GroupChat
    }

    fn describe(&self, _mandate: &Mandate) -> String {
        format!(
            "{} discuss in turn until a full cycle agrees, at most {} turns",
            DISCUSSION.join(", "),
            GROUP_CHAT_TURNS
        )
    }

    async fn drive(&self, exec: &mut Execution<'_>) -> Result<()> {
        let mut transcript: Vec<Value> = Vec::new();
        let mut agreeing = 0usize;
        let mut previous: Option<String> = None;

        for turn in 0..GROUP_CHAT_TURNS {
            let agent = DISCUSSION[turn % DISCUSSION.len()];
            let mut task = Task::new(kind_for(agent), agent);
            if let Some(prev) = previous.as_deref().and_then(|id| exec.plan().task(id)) {
                task = task.after(&[prev]);
            }
            let id = exec.add_task(
                task,
                json!({
                    "round": turn / DISCUSSION.len() + 1,
                    "transcript": transcript,
                }),
            );
            let reply = exec.run_task(&id).await?;

            if reply.get("agree").and_then(Value::as_bool) == Some(true) {
                agreeing += 1;
            } else {
                agreeing = 0;
            }
            transcript.push(json!({
                "agent": agent,
                "summary": reply.get("summary").cloned().unwrap_or(Value::Null),
            }));
            previous = Some(id);

            if agreeing >= DISCUSSION.len() {
                info!(turns = turn + 1, "Group reached consensus");
                exec.emit(
                    "consensus",
                    None,
                    EventBody::message(format!("Consensus reached after {} turns", turn + 1)),
                )
                .await?;
                return Ok(());
            }
        }

        warn!(turns = GROUP_CHAT_TURNS, "No consensus within turn budget");
        exec.emit(
            "consensus",
            None,
            EventBody::message(format!("No consensus after {} turns", GROUP_CHAT_TURNS)),
        )
        .await?;
        Ok(())
    }
}

/// Remaining specialists named in a manager's `plan`, each once, in the
/// order first named
fn planned_steps<'a>(reply: &Value, remaining: &[&'a str]) -> Vec<&'a str> {
    let named = reply
        .get("plan")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);

    let mut steps: Vec<&'a str> = Vec::new();
    for name in named {
        if let Some(agent) = remaining.iter().copied().find(|r| *r == name) {
            if !steps.contains(&agent) {
                steps.push(agent);
            }
        }
    }
    steps
}
