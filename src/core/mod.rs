//! Core orchestration logic.
//!
//! This module contains:
//! - Invoker: Retrying agent calls and JSON recovery from replies
//! - Ledger: Evidence and decision records
//! - EventBus: Per-run ordered, persisted event streams
//! - Pipeline: The fixed compliance state machine
//! - Engine/Topology: The generalized multi-topology orchestrator
//! - Orchestrator: Run control over both engines
//! - Stores: Run, event and checkpoint persistence

pub mod checkpoint;
pub mod engine;
pub mod event_bus;
pub mod extract;
pub mod invoker;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod sqlite;
pub mod store;
pub mod topology;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use engine::{OrchestrationOutcome, OrchestrationRequest, OrchestratorEngine};
pub use event_bus::{EventBus, Subscription};
pub use invoker::{Invocation, InvocationError, Invoker, RetryPolicy};
pub use ledger::Ledger;
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use pipeline::{ComplianceAgents, CompliancePipeline};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, RunStore, StoreError};
