//! Command-line interface for runbook.
//!
//! Provides commands for screening payments, running portfolio
//! orchestrations, checking status, listing runs and replaying events.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use crate::config;
use crate::core::Orchestrator;
use crate::domain::payment::format_amount;
use crate::domain::{
    DecisionPacket, Event, Frame, Mandate, PaymentRequest, RiskTier, RunFilter, RunResult,
    RunStatus,
};

/// runbook - Resilient multi-agent workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "runbook")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Screen a payment through the compliance pipeline
    Run {
        /// Beneficiary name
        #[arg(short, long)]
        beneficiary: String,

        /// Payment amount
        #[arg(short, long)]
        amount: f64,

        #[arg(long, default_value = "USD")]
        currency: String,

        /// Originating legal entity
        #[arg(long)]
        entity: Option<String>,

        /// Debited account
        #[arg(long)]
        account: Option<String>,

        /// Payment channel (e.g. SWIFT, ACH)
        #[arg(long)]
        channel: Option<String>,

        /// Use stub agents instead of the hosted service
        #[arg(long, env = "RUNBOOK_DRY_RUN")]
        dry_run: bool,

        /// Print frames in server-sent-event format
        #[arg(long)]
        sse: bool,
    },

    /// Run the portfolio orchestrator
    Orchestrate {
        /// sequential, concurrent, handoff, magentic, dag or group_chat
        #[arg(short, long)]
        topology: Option<String>,

        #[arg(short, long, value_enum, default_value = "moderate")]
        risk_tier: TierArg,

        /// Environmental/social/governance focus
        #[arg(long)]
        esg: bool,

        #[arg(long, default_value = "1000000")]
        portfolio_value: f64,

        /// Investment policy id
        #[arg(long, default_value = "ips-default")]
        policy: String,

        /// Free-text constraint (repeatable)
        #[arg(long = "constraint")]
        constraints: Vec<String>,

        /// Use stub agents instead of the hosted service
        #[arg(long, env = "RUNBOOK_DRY_RUN")]
        dry_run: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Print the result document of a run
    Result {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Only runs with this status
        #[arg(short, long)]
        status: Option<RunStatus>,
    },

    /// Replay the persisted events of a run
    Events {
        /// Run ID (UUID)
        run_id: String,

        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        since: u64,

        /// Print frames in server-sent-event format
        #[arg(long)]
        sse: bool,
    },

    /// List checkpoints of an orchestration run
    Checkpoints {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Risk tier for CLI (maps to RiskTier)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Conservative,
    Moderate,
    Aggressive,
    VeryAggressive,
}

impl From<TierArg> for RiskTier {
    fn from(t: TierArg) -> Self {
        match t {
            TierArg::Conservative => RiskTier::Conservative,
            TierArg::Moderate => RiskTier::Moderate,
            TierArg::Aggressive => RiskTier::Aggressive,
            TierArg::VeryAggressive => RiskTier::VeryAggressive,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                beneficiary,
                amount,
                currency,
                entity,
                account,
                channel,
                dry_run,
                sse,
            } => {
                let mut payment = PaymentRequest::new(beneficiary, amount).with_currency(currency);
                if let Some(entity) = entity {
                    payment = payment.with_entity(entity);
                }
                if let Some(account) = account {
                    payment = payment.with_account(account);
                }
                if let Some(channel) = channel {
                    payment = payment.with_channel(channel);
                }
                run_payment(payment, dry_run, sse).await
            }
            Commands::Orchestrate {
                topology,
                risk_tier,
                esg,
                portfolio_value,
                policy,
                constraints,
                dry_run,
            } => {
                let mandate = Mandate {
                    policy_id: policy,
                    risk_tier: risk_tier.into(),
                    esg_focus: esg,
                    portfolio_value,
                    constraints,
                };
                run_orchestration(topology.as_deref(), mandate, dry_run).await
            }
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Result { run_id } => show_result(&run_id).await,
            Commands::Runs {
                limit,
                offset,
                status,
            } => list_runs(limit, offset, status).await,
            Commands::Events { run_id, since, sse } => replay_events(&run_id, since, sse).await,
            Commands::Checkpoints { run_id } => list_checkpoints(&run_id).await,
            Commands::Config => show_config().await,
        }
    }
}

fn orchestrator(dry_run: bool) -> Result<Orchestrator> {
    Orchestrator::from_config(config::config()?, dry_run)
}

/// One human-readable line per event
fn event_line(event: &Event) -> String {
    let payload = &event.payload;
    let text = ["summary", "message", "thought", "reason", "label", "tool_name", "query"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .unwrap_or_default();
    let agent = event.agent.as_deref().unwrap_or("-");

    format!(
        "[{:>3}] +{:>6}ms {:<12} {:<15} {:<28} {}",
        event.seq,
        event.elapsed_ms,
        event.step,
        event.kind.as_str(),
        agent,
        text
    )
}

fn print_packet(packet: &DecisionPacket) {
    println!();
    println!("Decision:  {}", packet.decision.as_str());
    println!(
        "Payment:   {} {} to {}",
        format_amount(packet.payment.amount),
        packet.payment.currency,
        packet.payment.beneficiary_name
    );
    println!();
    println!("Rationale:");
    for line in &packet.rationale {
        println!("  - {}", line);
    }
    if !packet.procedure_checklist.is_empty() {
        println!();
        println!("Checklist:");
        for step in &packet.procedure_checklist {
            println!("  {}. {} ({})", step.step, step.action, step.responsible);
        }
    }
    if !packet.approvals_required.is_empty() {
        println!();
        println!("Approvals:");
        for approval in &packet.approvals_required {
            println!(
                "  {} [{}] within {}h",
                approval.role, approval.authority, approval.sla_hours
            );
        }
    }
}

/// Start a compliance run and stream it live
async fn run_payment(payment: PaymentRequest, dry_run: bool, sse: bool) -> Result<()> {
    let orchestrator = orchestrator(dry_run)?;
    let run_id = orchestrator.start_run(payment).await?;
    eprintln!("[Run {} started]", run_id);

    let mut subscription = orchestrator.subscribe(&run_id, Some(0)).await?;
    while let Some(frame) = subscription.next().await {
        if sse {
            print!("{}", frame.to_sse());
        } else if let Frame::Event(event) = &frame {
            println!("{}", event_line(event));
        }
    }

    match orchestrator.get_result(&run_id).await? {
        RunResult::Ready(document) => {
            if !sse {
                let packet: DecisionPacket = serde_json::from_value(document)
                    .context("Stored result is not a decision packet")?;
                print_packet(&packet);
            }
            eprintln!("\n[Run {} completed]", run_id);
        }
        RunResult::Failed(error) => {
            eprintln!("\n[Run {} failed: {}]", run_id, error);
            std::process::exit(1);
        }
        other => {
            eprintln!("\n[Run {} ended in state: {:?}]", run_id, other);
        }
    }

    Ok(())
}

/// Run the generalized orchestrator and print the allocation
async fn run_orchestration(topology: Option<&str>, mandate: Mandate, dry_run: bool) -> Result<()> {
    let orchestrator = orchestrator(dry_run)?;
    let run_id = orchestrator.start_orchestration(topology, mandate).await?;
    eprintln!("[Run {} started]", run_id);

    let mut subscription = orchestrator.subscribe(&run_id, Some(0)).await?;
    while let Some(frame) = subscription.next().await {
        if let Frame::Event(event) = &frame {
            println!("{}", event_line(event));
        }
    }

    match orchestrator.get_result(&run_id).await? {
        RunResult::Ready(document) => {
            println!();
            println!("Topology: {}", document["topology"].as_str().unwrap_or("?"));
            println!("Source:   {}", document["result"]["source"].as_str().unwrap_or("?"));
            println!();
            println!("{:<10} {:>8}", "TICKER", "WEIGHT");
            println!("{}", "-".repeat(19));
            if let Some(allocations) = document["result"]["allocations"].as_object() {
                for (ticker, weight) in allocations {
                    println!("{:<10} {:>7.1}%", ticker, weight.as_f64().unwrap_or(0.0) * 100.0);
                }
            }
            let metrics = &document["result"]["metrics"];
            println!();
            println!(
                "Expected return {}%, volatility {}%, Sharpe {}",
                metrics["expected_return"], metrics["volatility"], metrics["sharpe_ratio"]
            );
            eprintln!("\n[Run {} completed]", run_id);
        }
        RunResult::Failed(error) => {
            eprintln!("\n[Run {} failed: {}]", run_id, error);
            std::process::exit(1);
        }
        other => {
            eprintln!("\n[Run {} ended in state: {:?}]", run_id, other);
        }
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id: &str) -> Result<()> {
    let orchestrator = orchestrator(true)?;
    let run = orchestrator
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID:   {}", run.id);
    println!("Kind:     {}", run.kind.as_str());
    println!("Status:   {}", run.status.as_str());
    println!("Digest:   {}", run.request_digest);
    println!("Created:  {}", run.created_at);
    if let Some(completed) = run.completed_at {
        println!("Finished: {}", completed);
    }
    if let Some(decision) = &run.decision {
        println!("Decision: {}", decision);
    }
    if let Some(error) = &run.error {
        println!("Error:    {}", error);
    }
    if !run.timestamps.is_empty() {
        println!("\nStage timestamps:");
        for (stage, ts) in &run.timestamps {
            println!("  {}: {}", stage, ts);
        }
    }

    Ok(())
}

/// Print a run's result document
async fn show_result(run_id: &str) -> Result<()> {
    let orchestrator = orchestrator(true)?;
    match orchestrator.get_result(run_id).await? {
        RunResult::Ready(document) => {
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        RunResult::Pending(status) => {
            eprintln!("[Run {} is still {}]", run_id, status.as_str());
        }
        RunResult::Failed(error) => {
            eprintln!("[Run {} failed: {}]", run_id, error);
            std::process::exit(1);
        }
        RunResult::NotFound => anyhow::bail!("Run not found: {}", run_id),
    }
    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize, offset: usize, status: Option<RunStatus>) -> Result<()> {
    let orchestrator = orchestrator(true)?;
    let runs = orchestrator
        .list_runs(&RunFilter {
            limit,
            offset,
            status,
            kind: None,
        })
        .await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<14} {:<10} {:<10} {:<30}",
        "RUN ID", "KIND", "STATUS", "DECISION", "SUBJECT"
    );
    println!("{}", "-".repeat(104));

    for run in runs {
        let subject = match (run.beneficiary(), run.amount()) {
            (Some(name), Some((amount, currency))) => {
                format!("{} {} {}", name, format_amount(amount), currency)
            }
            _ => run
                .request
                .get("topology")
                .and_then(Value::as_str)
                .unwrap_or("-")
                .to_string(),
        };
        println!(
            "{:<38} {:<14} {:<10} {:<10} {:<30}",
            run.id,
            run.kind.as_str(),
            run.status.as_str(),
            run.decision.as_deref().unwrap_or("-"),
            subject
        );
    }

    Ok(())
}

/// Replay persisted events
async fn replay_events(run_id: &str, since: u64, sse: bool) -> Result<()> {
    let orchestrator = orchestrator(true)?;
    let events = orchestrator.events(run_id, since).await?;

    if events.is_empty() {
        eprintln!("No events after seq {} for run {}", since, run_id);
        return Ok(());
    }

    for event in events {
        if sse {
            print!("{}", event.to_sse());
        } else {
            println!("{}", event_line(&event));
        }
    }
    Ok(())
}

/// List checkpoints of an orchestration run
async fn list_checkpoints(run_id: &str) -> Result<()> {
    let orchestrator = orchestrator(true)?;
    let checkpoints = orchestrator.checkpoints(run_id).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints found");
        return Ok(());
    }

    println!(
        "{:<40} {:<12} {:>9} {:>9}  {}",
        "STAGE", "TOPOLOGY", "DECISIONS", "EVIDENCE", "TIMESTAMP"
    );
    println!("{}", "-".repeat(100));
    for checkpoint in checkpoints {
        println!(
            "{:<40} {:<12} {:>9} {:>9}  {}",
            checkpoint.stage,
            checkpoint.topology.as_str(),
            checkpoint.decision_count,
            checkpoint.evidence_count,
            checkpoint.timestamp
        );
    }
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("runbook configuration");
    println!("{}", "=".repeat(40));
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Database:    {}", cfg.database.display());
    println!("  Checkpoints: {}", cfg.checkpoints_dir().display());
    println!();
    println!("Agents:");
    println!(
        "  Endpoint:    {}",
        cfg.agents.endpoint.as_deref().unwrap_or("(none)")
    );
    println!("  Token:       {}", if cfg.agents.token.is_some() { "[set]" } else { "(none)" });
    println!("  Dry run:     {}", cfg.agents.dry_run);
    println!("  Sanctions:   {}", cfg.agents.compliance.sanctions);
    println!("  Liquidity:   {}", cfg.agents.compliance.liquidity);
    println!("  Procedures:  {}", cfg.agents.compliance.procedures);
    println!();
    println!("Retry:");
    println!("  Max attempts:   {}", cfg.retry.max_attempts);
    println!("  Initial delay:  {}ms", cfg.retry.initial_delay_ms);
    println!("  Multiplier:     {}", cfg.retry.backoff_multiplier);
    println!("  Max delay:      {}ms", cfg.retry.max_delay_ms);
    println!();
    println!("Events:");
    println!("  Heartbeat:   {}s", cfg.events.heartbeat.as_secs());
    println!("  Redaction:   {}", cfg.events.redact_sensitive);
    println!();
    println!("Orchestrator:");
    println!("  Default topology: {}", cfg.orchestrator.default_topology);
    println!("  Checkpointing:    {}", cfg.orchestrator.checkpointing);
    println!("  Evidence window:  {}", cfg.orchestrator.evidence_window);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "runbook",
            "run",
            "--beneficiary",
            "ACME Trading LLC",
            "--amount",
            "250000",
            "--dry-run",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                beneficiary,
                amount,
                currency,
                dry_run,
                ..
            } => {
                assert_eq!(beneficiary, "ACME Trading LLC");
                assert_eq!(amount, 250_000.0);
                assert_eq!(currency, "USD");
                assert!(dry_run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_runs_status_filter() {
        let cli = Cli::try_parse_from(["runbook", "runs", "--status", "failed"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Runs { status: Some(RunStatus::Failed), limit: 10, .. }
        ));
    }

    #[test]
    fn test_parse_orchestrate() {
        let cli = Cli::try_parse_from([
            "runbook",
            "orchestrate",
            "--topology",
            "dag",
            "--risk-tier",
            "very-aggressive",
            "--esg",
        ])
        .unwrap();
        match cli.command {
            Commands::Orchestrate {
                topology,
                risk_tier,
                esg,
                ..
            } => {
                assert_eq!(topology.as_deref(), Some("dag"));
                assert_eq!(RiskTier::from(risk_tier), RiskTier::VeryAggressive);
                assert!(esg);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_event_line_picks_text() {
        let event = Event {
            run_id: "r".to_string(),
            seq: 7,
            kind: crate::domain::EventKind::StepSkipped,
            step: "liquidity".to_string(),
            agent: None,
            ts: Utc::now(),
            elapsed_ms: 12,
            payload: json!({ "reason": "SANCTIONS_BLOCK" }),
        };
        let line = event_line(&event);
        assert!(line.contains("step_skipped"));
        assert!(line.ends_with("SANCTIONS_BLOCK"));
    }
}
