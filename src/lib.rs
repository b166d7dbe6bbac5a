//! runbook - Resilient multi-agent workflow orchestrator
//!
//! Coordinates decision workflows whose steps delegate reasoning to an
//! external agent service, then aggregates the agents' outputs into an
//! auditable decision while streaming progress to observers.
//!
//! # Architecture
//!
//! - Every agent call goes through the [`Invoker`](core::Invoker), which
//!   retries with exponential backoff and recovers JSON from chatty replies
//! - Each run owns an ordered, persisted event stream on the
//!   [`EventBus`](core::EventBus); subscribers can join late and replay
//!   from any sequence number
//! - Two engines drive runs: the fixed compliance [`pipeline`](core::pipeline)
//!   (intake, sanctions, liquidity, procedures, summarize) and the
//!   generalized [`OrchestratorEngine`](core::OrchestratorEngine) with six
//!   topologies
//! - Agent outputs and orchestrator reasoning land in a per-run
//!   [`Ledger`](core::Ledger) for audit
//!
//! # Modules
//!
//! - `adapters`: Agent service integrations (HTTP, offline stub)
//! - `core`: Invoker, ledger, event bus, stores, engines
//! - `domain`: Data structures (Event, Run, PaymentRequest, DecisionPacket, Plan)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Screen a payment offline
//! runbook run --beneficiary "ACME Trading LLC" --amount 250000 --dry-run
//!
//! # Replay a run's events from sequence 10
//! runbook events <run-id> --since 10
//!
//! # Run the portfolio orchestrator with a DAG topology
//! runbook orchestrate --topology dag --risk-tier aggressive --dry-run
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{EventBus, Invoker, Ledger, Orchestrator, OrchestratorEngine};
pub use domain::{DecisionPacket, Event, EventKind, PaymentRequest, Run, RunStatus};
