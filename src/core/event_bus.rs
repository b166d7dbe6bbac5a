//! Per-run ordered, persisted, multi-subscriber event stream.
//!
//! Each run has one channel guarded by its own async mutex. Publishing
//! assigns the next seq, persists the event and fans it out while holding
//! that lock, so every subscriber sees the same gapless order that the store
//! holds. Runs never contend with each other.
//!
//! Subscribing with `since = k` first replays persisted events with
//! `seq > k` and then continues with the live tail. Both halves are set up
//! under the run lock, so nothing published in between is lost or repeated.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::store::{RunStore, StoreError};
use crate::domain::{Event, EventBody, Frame};

/// Default idle interval before a subscriber receives a heartbeat
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Payload keys replaced with `[REDACTED]` when redaction is enabled
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
];

struct RunChannel {
    /// `None` until loaded from the store
    next_seq: Option<u64>,
    started: Instant,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    ended: bool,
}

impl RunChannel {
    fn new() -> Self {
        Self {
            next_seq: None,
            started: Instant::now(),
            subscribers: Vec::new(),
            ended: false,
        }
    }
}

/// Event bus shared by every run in the process
pub struct EventBus {
    store: Arc<dyn RunStore>,
    heartbeat: Duration,
    redact: bool,
    runs: Mutex<HashMap<String, Arc<Mutex<RunChannel>>>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            heartbeat: DEFAULT_HEARTBEAT,
            redact: false,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Redact sensitive payload keys before persistence
    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    async fn channel(&self, run_id: &str) -> Arc<Mutex<RunChannel>> {
        let mut runs = self.runs.lock().await;
        runs.entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RunChannel::new())))
            .clone()
    }

    async fn existing(&self, run_id: &str) -> Option<Arc<Mutex<RunChannel>>> {
        self.runs.lock().await.get(run_id).cloned()
    }

    /// Open the stream for a run. Resumes the seq from persisted events.
    pub async fn start(&self, run_id: &str) -> Result<(), StoreError> {
        let channel = self.channel(run_id).await;
        let mut ch = channel.lock().await;
        if ch.next_seq.is_none() {
            ch.next_seq = Some(self.store.next_seq(run_id).await?);
        }
        ch.started = Instant::now();
        debug!(run_id, next_seq = ?ch.next_seq, "Event stream started");
        Ok(())
    }

    /// Assign the next seq, persist, then deliver to every live subscriber.
    /// The seq only advances when persistence succeeds.
    pub async fn publish(
        &self,
        run_id: &str,
        step: &str,
        agent: Option<&str>,
        body: EventBody,
    ) -> Result<Event, StoreError> {
        let channel = self.channel(run_id).await;
        let mut ch = channel.lock().await;

        let seq = match ch.next_seq {
            Some(seq) => seq,
            None => self.store.next_seq(run_id).await?,
        };

        let kind = body.kind();
        let mut payload = body.into_payload();
        if self.redact {
            redact_sensitive(&mut payload);
        }

        let event = Event {
            run_id: run_id.to_string(),
            seq,
            kind,
            step: step.to_string(),
            agent: agent.map(str::to_string),
            ts: Utc::now(),
            elapsed_ms: ch.started.elapsed().as_millis() as u64,
            payload,
        };

        self.store.save_event(&event).await?;
        ch.next_seq = Some(seq + 1);

        // Dropped receivers are pruned here
        ch.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(event)
    }

    /// Close the stream: subscribers drain what they have, then end
    pub async fn end(&self, run_id: &str) {
        let removed = self.runs.lock().await.remove(run_id);
        if let Some(channel) = removed {
            let mut ch = channel.lock().await;
            ch.ended = true;
            ch.subscribers.clear();
            debug!(run_id, "Event stream ended");
        }
    }

    /// Whether the run currently has an open stream
    pub async fn is_live(&self, run_id: &str) -> bool {
        self.existing(run_id).await.is_some()
    }

    /// Subscribe to a run.
    ///
    /// - live run, `since = None`: live tail only
    /// - live run, `since = Some(k)`: persisted events after `k`, then live tail
    /// - ended or unknown run: persisted events after `since` (or all), then end
    pub async fn subscribe(
        &self,
        run_id: &str,
        since: Option<u64>,
    ) -> Result<Subscription, StoreError> {
        if let Some(channel) = self.existing(run_id).await {
            let mut ch = channel.lock().await;
            if !ch.ended {
                let backlog = match since {
                    Some(k) => self.store.events_since(run_id, k).await?,
                    None => Vec::new(),
                };
                let (tx, rx) = mpsc::unbounded_channel();
                ch.subscribers.push(tx);
                return Ok(Subscription::new(
                    run_id,
                    backlog,
                    Some(rx),
                    since.unwrap_or(0),
                    self.heartbeat,
                ));
            }
        }

        let since = since.unwrap_or(0);
        let backlog = self.store.events_since(run_id, since).await?;
        Ok(Subscription::new(run_id, backlog, None, since, self.heartbeat))
    }
}

/// A subscriber's pull queue
pub struct Subscription {
    run_id: String,
    backlog: VecDeque<Event>,
    live: Option<mpsc::UnboundedReceiver<Event>>,
    last_seq: u64,
    heartbeat: Duration,
}

impl Subscription {
    fn new(
        run_id: &str,
        backlog: Vec<Event>,
        live: Option<mpsc::UnboundedReceiver<Event>>,
        last_seq: u64,
        heartbeat: Duration,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            backlog: backlog.into(),
            live,
            last_seq,
            heartbeat,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Highest seq delivered so far
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Next frame: an event, a heartbeat after an idle interval, or `None`
    /// once the stream has ended and everything buffered was delivered.
    pub async fn next(&mut self) -> Option<Frame> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_seq = event.seq;
            return Some(Frame::Event(event));
        }

        loop {
            let live = self.live.as_mut()?;
            match tokio::time::timeout(self.heartbeat, live.recv()).await {
                Ok(Some(event)) => {
                    if event.seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = event.seq;
                    return Some(Frame::Event(event));
                }
                Ok(None) => {
                    self.live = None;
                    return None;
                }
                Err(_) => return Some(Frame::Heartbeat),
            }
        }
    }

    /// Drain events until the stream ends, skipping heartbeats
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(frame) = self.next().await {
            if let Frame::Event(event) = frame {
                events.push(event);
            }
        }
        events
    }
}

/// Replace values of sensitive keys anywhere in the payload
pub fn redact_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let lower = key.to_ascii_lowercase();
                if SENSITIVE_KEYS.iter().any(|k| lower.contains(k)) {
                    *v = Value::String("[REDACTED]".to_string());
                } else {
                    redact_sensitive(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_sensitive),
        _ => {}
    }
}

/// Publish, logging instead of failing. For telemetry whose loss must not
/// abort a run.
pub async fn publish_lossy(
    bus: &EventBus,
    run_id: &str,
    step: &str,
    agent: Option<&str>,
    body: EventBody,
) {
    if let Err(e) = bus.publish(run_id, step, agent, body).await {
        warn!(run_id, step, error = %e, "Failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_seq_starts_at_one() {
        let bus = bus();
        bus.start("r").await.unwrap();
        let a = bus.publish("r", "intake", None, EventBody::step_started("a")).await.unwrap();
        let b = bus.publish("r", "intake", None, EventBody::step_started("b")).await.unwrap();
        assert_eq!((a.seq, b.seq), (1, 2));
    }

    #[tokio::test]
    async fn test_runs_have_independent_sequences() {
        let bus = bus();
        bus.publish("a", "s", None, EventBody::message("x")).await.unwrap();
        bus.publish("a", "s", None, EventBody::message("x")).await.unwrap();
        let first_b = bus.publish("b", "s", None, EventBody::message("x")).await.unwrap();
        assert_eq!(first_b.seq, 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_store() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());
        bus.publish("r", "s", None, EventBody::message("1")).await.unwrap();
        bus.publish("r", "s", None, EventBody::message("2")).await.unwrap();

        let restarted = EventBus::new(store);
        restarted.start("r").await.unwrap();
        let next = restarted.publish("r", "s", None, EventBody::message("3")).await.unwrap();
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn test_end_drains_then_closes() {
        let bus = bus();
        bus.start("r").await.unwrap();
        let sub = bus.subscribe("r", None).await.unwrap();

        bus.publish("r", "s", None, EventBody::message("1")).await.unwrap();
        bus.publish("r", "s", None, EventBody::message("2")).await.unwrap();
        bus.end("r").await;

        let events = sub.collect().await;
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_redaction() {
        let bus = bus().with_redaction(true);
        let event = bus
            .publish(
                "r",
                "s",
                None,
                EventBody::thinking("x", json!({ "api_key": "abc", "nested": [{ "Password": 1 }], "amount": 5 })),
            )
            .await
            .unwrap();

        assert_eq!(event.payload["context"]["api_key"], "[REDACTED]");
        assert_eq!(event.payload["context"]["nested"][0]["Password"], "[REDACTED]");
        assert_eq!(event.payload["context"]["amount"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_when_idle() {
        let bus = bus().with_heartbeat(Duration::from_secs(15));
        bus.start("r").await.unwrap();
        let mut sub = bus.subscribe("r", None).await.unwrap();

        assert_eq!(sub.next().await, Some(Frame::Heartbeat));
        assert_eq!(sub.last_seq(), 0);

        bus.publish("r", "s", None, EventBody::message("1")).await.unwrap();
        assert!(matches!(sub.next().await, Some(Frame::Event(e)) if e.seq == 1));
    }
}
