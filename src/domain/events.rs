//! Event types for the per-run event stream.
//!
//! Every event carries a per-run sequence number assigned by the event bus.
//! Sequence numbers start at 1 and never skip, so a subscriber that knows
//! the last seq it saw can resume exactly where it left off.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event in a run's stream.
///
/// Events are immutable once published: they are persisted before being
/// delivered to any subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The run this event belongs to
    pub run_id: String,

    /// Per-run sequence number (1-based, gapless)
    pub seq: u64,

    /// Kind of event
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Stage or task the event relates to
    pub step: String,

    /// Agent that produced the event (if any)
    pub agent: Option<String>,

    /// Wall-clock time of publication
    pub ts: DateTime<Utc>,

    /// Milliseconds since the run's stream was started
    pub elapsed_ms: u64,

    /// Kind-specific payload
    pub payload: Value,
}

impl Event {
    /// Typed view of the payload, if it matches the event kind
    pub fn body(&self) -> Option<EventBody> {
        serde_json::from_value(serde_json::json!({
            "type": self.kind,
            "payload": self.payload,
        }))
        .ok()
    }

    /// Render as a server-sent-events frame
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.seq, self.kind, data)
    }
}

/// Types of events that can appear in a run's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StepStarted,
    StepCompleted,
    StepSkipped,
    AgentMessage,
    AgentThinking,
    AgentFinding,
    AgentDetail,
    ToolCall,
    KbQuery,
    Branch,
    Error,
    /// Terminal outcome of the run
    Final,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepSkipped => "step_skipped",
            Self::AgentMessage => "agent_message",
            Self::AgentThinking => "agent_thinking",
            Self::AgentFinding => "agent_finding",
            Self::AgentDetail => "agent_detail",
            Self::ToolCall => "tool_call",
            Self::KbQuery => "kb_query",
            Self::Branch => "branch",
            Self::Error => "error",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an agent finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

/// Category of an agent detail line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailCategory {
    Input,
    Analysis,
    Metric,
    Comparison,
    Result,
}

/// Typed payload for each event kind.
///
/// Engines build one of these and hand it to the bus, which flattens it into
/// `(kind, payload)` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    StepStarted {
        message: String,
    },
    StepCompleted {
        summary: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        result: Value,
    },
    StepSkipped {
        reason: String,
    },
    AgentMessage {
        message: String,
    },
    AgentThinking {
        thought: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        context: Value,
    },
    AgentFinding {
        finding_type: String,
        #[serde(default)]
        severity: Severity,
        message: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        details: Value,
    },
    AgentDetail {
        category: DetailCategory,
        label: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        metadata: Value,
    },
    ToolCall {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    KbQuery {
        query: String,
        sources: Vec<String>,
        results_count: usize,
    },
    Branch {
        condition: String,
        result: String,
        reason: String,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    Final {
        decision: String,
        summary: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        result: Value,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StepStarted { .. } => EventKind::StepStarted,
            Self::StepCompleted { .. } => EventKind::StepCompleted,
            Self::StepSkipped { .. } => EventKind::StepSkipped,
            Self::AgentMessage { .. } => EventKind::AgentMessage,
            Self::AgentThinking { .. } => EventKind::AgentThinking,
            Self::AgentFinding { .. } => EventKind::AgentFinding,
            Self::AgentDetail { .. } => EventKind::AgentDetail,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::KbQuery { .. } => EventKind::KbQuery,
            Self::Branch { .. } => EventKind::Branch,
            Self::Error { .. } => EventKind::Error,
            Self::Final { .. } => EventKind::Final,
        }
    }

    /// Flatten into the wire payload (the content half of the adjacent tag)
    pub fn into_payload(self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn step_started(message: impl Into<String>) -> Self {
        Self::StepStarted {
            message: message.into(),
        }
    }

    pub fn step_completed(summary: impl Into<String>, result: Value) -> Self {
        Self::StepCompleted {
            summary: summary.into(),
            result,
        }
    }

    pub fn step_skipped(reason: impl Into<String>) -> Self {
        Self::StepSkipped {
            reason: reason.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::AgentMessage {
            message: message.into(),
        }
    }

    pub fn thinking(thought: impl Into<String>, context: Value) -> Self {
        Self::AgentThinking {
            thought: thought.into(),
            context,
        }
    }

    pub fn finding(
        finding_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self::AgentFinding {
            finding_type: finding_type.into(),
            severity,
            message: message.into(),
            details,
        }
    }

    pub fn detail(category: DetailCategory, label: impl Into<String>, value: Value) -> Self {
        Self::AgentDetail {
            category,
            label: label.into(),
            value,
            metadata: Value::Null,
        }
    }

    /// Attach metadata to an `AgentDetail`; other variants are returned unchanged
    pub fn with_metadata(self, meta: Value) -> Self {
        match self {
            Self::AgentDetail {
                category,
                label,
                value,
                ..
            } => Self::AgentDetail {
                category,
                label,
                value,
                metadata: meta,
            },
            other => other,
        }
    }

    pub fn tool_call(
        tool_name: impl Into<String>,
        call_id: Option<String>,
        input: Value,
        output: Option<String>,
        duration_ms: Option<u64>,
    ) -> Self {
        Self::ToolCall {
            tool_name: tool_name.into(),
            call_id,
            input,
            output,
            duration_ms,
        }
    }

    pub fn kb_query(query: impl Into<String>, sources: Vec<String>) -> Self {
        let results_count = sources.len();
        Self::KbQuery {
            query: query.into(),
            sources,
            results_count,
        }
    }

    pub fn branch(
        condition: impl Into<String>,
        result: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Branch {
            condition: condition.into(),
            result: result.into(),
            reason: reason.into(),
        }
    }

    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error {
            message: message.into(),
            recoverable,
        }
    }

    pub fn final_outcome(
        decision: impl Into<String>,
        summary: impl Into<String>,
        result: Value,
    ) -> Self {
        Self::Final {
            decision: decision.into(),
            summary: summary.into(),
            result,
        }
    }
}

/// One item delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Event),
    /// Keep-alive emitted after an idle heartbeat interval; carries no seq
    Heartbeat,
}

impl Frame {
    pub fn to_sse(&self) -> String {
        match self {
            Self::Event(event) => event.to_sse(),
            Self::Heartbeat => ": heartbeat\n\n".to_string(),
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Heartbeat => None,
        }
    }
}
