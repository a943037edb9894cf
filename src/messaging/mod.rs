//! Event-based message bus for inter-agent communication.
//!
//! The bus holds the persistent connections opened via `AGENT_CONNECTION`,
//! the `(event_type → agent)` subscription table, a bounded offline queue
//! per agent, and a bounded in-memory history ring mirrored to a JSONL log.
//!
//! All structural state sits behind one mutex; event delivery snapshots the
//! recipients and releases the lock before touching any socket, so a slow
//! subscriber never stalls an unrelated publish.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Where a delivered event frame goes. The dispatcher registers one sink
/// per persistent agent connection; tests register in-memory sinks.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_event(&self, event: &Value) -> Result<()>;
}

/// In-memory sink collecting events, for unit tests and diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    pub events: Mutex<Vec<Value>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn send_event(&self, event: &Value) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("sink failure injected");
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct BusTables {
    /// event_type -> subscribed agent ids
    subscriptions: HashMap<String, HashSet<String>>,
    /// agent_id -> active delivery sink
    connections: HashMap<String, Arc<dyn EventSink>>,
    /// agent_id -> undelivered events awaiting reconnect
    offline_queue: HashMap<String, VecDeque<Value>>,
    /// bounded ring of recent events
    history: VecDeque<Value>,
}

pub struct MessageBus {
    tables: Mutex<BusTables>,
    bus_log_path: Option<PathBuf>,
    history_max: usize,
    offline_queue_max: usize,
}

impl MessageBus {
    pub fn new(
        bus_log_path: Option<PathBuf>,
        history_max: usize,
        offline_queue_max: usize,
    ) -> Self {
        Self {
            tables: Mutex::new(BusTables {
                subscriptions: HashMap::new(),
                connections: HashMap::new(),
                offline_queue: HashMap::new(),
                history: VecDeque::new(),
            }),
            bus_log_path,
            history_max,
            offline_queue_max,
        }
    }

    /// Register an agent's delivery sink. Queued offline events are NOT
    /// delivered here: the dispatcher drains them after the connect reply
    /// has gone out, so the reply always precedes pushed frames.
    pub async fn connect(&self, agent_id: &str, sink: Arc<dyn EventSink>) {
        let mut tables = self.tables.lock().await;
        tables.connections.insert(agent_id.to_string(), sink);
        tracing::info!(agent_id, "agent connected to message bus");
    }

    /// Deliver everything queued while the agent was away, in order. Stops
    /// at the first failed write and requeues the remainder.
    pub async fn drain_offline(&self, agent_id: &str) {
        let (sink, queued) = {
            let mut tables = self.tables.lock().await;
            let Some(sink) = tables.connections.get(agent_id).cloned() else {
                return;
            };
            let Some(queued) = tables.offline_queue.remove(agent_id) else {
                return;
            };
            (sink, queued)
        };

        let total = queued.len();
        let mut delivered = 0usize;
        let mut requeue = VecDeque::new();
        let mut draining = queued.into_iter();
        for event in draining.by_ref() {
            match sink.send_event(&event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::error!(agent_id, error = %e, "offline drain failed, requeueing");
                    requeue.push_back(event);
                    break;
                }
            }
        }
        requeue.extend(draining);
        if !requeue.is_empty() {
            let mut tables = self.tables.lock().await;
            let front = tables
                .offline_queue
                .entry(agent_id.to_string())
                .or_default();
            for event in requeue.into_iter().rev() {
                front.push_front(event);
            }
        }
        tracing::info!(agent_id, delivered, total, "drained offline queue");
    }

    /// Drop an agent's connection and every subscription it held.
    pub async fn disconnect(&self, agent_id: &str) {
        let mut tables = self.tables.lock().await;
        tables.connections.remove(agent_id);
        for subscribers in tables.subscriptions.values_mut() {
            subscribers.remove(agent_id);
        }
        tables.subscriptions.retain(|_, subs| !subs.is_empty());
        tracing::info!(agent_id, "agent disconnected from message bus");
    }

    /// Subscribe a connected agent to event types. Returns false when the
    /// agent has no active connection.
    pub async fn subscribe(&self, agent_id: &str, event_types: &[String]) -> bool {
        let mut tables = self.tables.lock().await;
        if !tables.connections.contains_key(agent_id) {
            tracing::warn!(agent_id, "cannot subscribe, agent not connected");
            return false;
        }
        for event_type in event_types {
            tables
                .subscriptions
                .entry(event_type.clone())
                .or_default()
                .insert(agent_id.to_string());
            tracing::info!(agent_id, event_type, "subscribed");
        }
        true
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.tables.lock().await.connections.contains_key(agent_id)
    }

    pub async fn connected_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .tables
            .lock()
            .await
            .connections
            .keys()
            .cloned()
            .collect();
        agents.sort();
        agents
    }

    /// Publish an event, fanning out per its type. The returned value is
    /// the delivery summary handed back to the caller of `PUBLISH`.
    pub async fn publish(&self, from_agent: &str, event_type: &str, payload: &Value) -> Value {
        let event = build_event(from_agent, event_type, payload);
        self.record(&event).await;

        match event_type {
            "DIRECT_MESSAGE" => self.deliver_direct(event).await,
            "BROADCAST" => self.deliver_broadcast(event).await,
            "TASK_ASSIGNMENT" => {
                // Routing resolves the assignee before publishing; an
                // unaddressed assignment here is a caller bug.
                if event.get("to").and_then(Value::as_str).is_none() {
                    return json!({"status": "error", "error": "No recipient specified"});
                }
                self.deliver_direct(event).await
            }
            _ => self.deliver_generic(event_type, event).await,
        }
    }

    /// Deliver straight to one agent, queueing offline when absent. Used
    /// by the daemon for feedback events that bypass `PUBLISH` semantics.
    pub async fn deliver_to_agent(&self, agent_id: &str, event: Value) -> Value {
        self.record(&event).await;
        self.deliver_now(agent_id, event).await
    }

    /// Delivery without recording, for events already in the history.
    async fn deliver_now(&self, agent_id: &str, event: Value) -> Value {
        let sink = {
            let tables = self.tables.lock().await;
            tables.connections.get(agent_id).cloned()
        };
        match sink {
            Some(sink) => match sink.send_event(&event).await {
                Ok(()) => json!({"status": "delivered", "to": agent_id}),
                Err(e) => {
                    tracing::error!(agent_id, error = %e, "delivery failed, queueing offline");
                    self.queue_offline(agent_id, event).await;
                    json!({"status": "queued", "to": agent_id, "error": e.to_string()})
                }
            },
            None => {
                self.queue_offline(agent_id, event).await;
                json!({"status": "queued", "to": agent_id})
            }
        }
    }

    async fn deliver_direct(&self, event: Value) -> Value {
        let Some(to_agent) = event.get("to").and_then(Value::as_str).map(String::from) else {
            return json!({"status": "error", "error": "No recipient specified"});
        };
        let from_agent = event.get("from").and_then(Value::as_str).unwrap_or_default();

        // Monitors subscribed to DIRECT_MESSAGE see a copy first.
        let watchers = self
            .subscriber_sinks("DIRECT_MESSAGE", Some(from_agent))
            .await;
        let mut notified = Vec::new();
        for (agent_id, sink) in watchers {
            if agent_id == to_agent {
                continue;
            }
            match sink.send_event(&event).await {
                Ok(()) => notified.push(agent_id),
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "failed to notify DIRECT_MESSAGE watcher")
                }
            }
        }

        let mut outcome = self.deliver_now(&to_agent, event).await;
        if let Some(obj) = outcome.as_object_mut() {
            obj.insert("notified".to_string(), json!(notified));
        }
        outcome
    }

    async fn deliver_broadcast(&self, event: Value) -> Value {
        let from_agent = event.get("from").and_then(Value::as_str).unwrap_or_default();
        let subscribers = self.subscriber_sinks("BROADCAST", Some(from_agent)).await;

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (agent_id, sink) in subscribers {
            match sink.send_event(&event).await {
                Ok(()) => delivered.push(agent_id),
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "broadcast delivery failed, queueing");
                    self.queue_offline(&agent_id, event.clone()).await;
                    failed.push(agent_id);
                }
            }
        }
        let total = delivered.len() + failed.len();
        json!({
            "status": "broadcast",
            "delivered": delivered,
            "failed": failed,
            "total": total,
        })
    }

    async fn deliver_generic(&self, event_type: &str, event: Value) -> Value {
        let subscribers = self.subscriber_sinks(event_type, None).await;
        let mut delivered = Vec::new();
        for (agent_id, sink) in subscribers {
            match sink.send_event(&event).await {
                Ok(()) => delivered.push(agent_id),
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, event_type, error = %e, "delivery failed, queueing");
                    self.queue_offline(&agent_id, event.clone()).await;
                }
            }
        }
        json!({
            "status": "published",
            "event_type": event_type,
            "delivered_to": delivered,
        })
    }

    /// Snapshot `(agent_id, sink)` pairs for one event type, optionally
    /// excluding the sender, without holding the lock during delivery.
    async fn subscriber_sinks(
        &self,
        event_type: &str,
        exclude: Option<&str>,
    ) -> Vec<(String, Arc<dyn EventSink>)> {
        let tables = self.tables.lock().await;
        let Some(subscribers) = tables.subscriptions.get(event_type) else {
            return Vec::new();
        };
        let mut sinks: Vec<(String, Arc<dyn EventSink>)> = subscribers
            .iter()
            .filter(|agent_id| exclude != Some(agent_id.as_str()))
            .filter_map(|agent_id| {
                tables
                    .connections
                    .get(agent_id)
                    .map(|sink| (agent_id.clone(), sink.clone()))
            })
            .collect();
        sinks.sort_by(|a, b| a.0.cmp(&b.0));
        sinks
    }

    async fn queue_offline(&self, agent_id: &str, event: Value) {
        let mut tables = self.tables.lock().await;
        let queue = tables
            .offline_queue
            .entry(agent_id.to_string())
            .or_default();
        if queue.len() >= self.offline_queue_max {
            queue.pop_front();
            tracing::warn!(agent_id, "offline queue full, dropping oldest event");
        }
        queue.push_back(event);
    }

    /// Append to the history ring and the JSONL bus log.
    async fn record(&self, event: &Value) {
        {
            let mut tables = self.tables.lock().await;
            if tables.history.len() >= self.history_max {
                tables.history.pop_front();
            }
            tables.history.push_back(event.clone());
        }
        if let Some(path) = &self.bus_log_path {
            let line = format!("{event}\n");
            let result = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await;
            match result {
                Ok(mut file) => {
                    use tokio::io::AsyncWriteExt;
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        tracing::error!(error = %e, "failed to append bus log");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to open bus log"),
            }
        }
    }

    pub async fn stats(&self) -> Value {
        let tables = self.tables.lock().await;
        let mut connected: Vec<&String> = tables.connections.keys().collect();
        connected.sort();
        let subscriptions: HashMap<&String, Vec<&String>> = tables
            .subscriptions
            .iter()
            .map(|(event_type, subs)| {
                let mut agents: Vec<&String> = subs.iter().collect();
                agents.sort();
                (event_type, agents)
            })
            .collect();
        let offline: HashMap<&String, usize> = tables
            .offline_queue
            .iter()
            .map(|(agent, queue)| (agent, queue.len()))
            .collect();
        json!({
            "connected_agents": connected,
            "subscriptions": subscriptions,
            "offline_queues": offline,
            "history_size": tables.history.len(),
        })
    }

    pub async fn history(&self, limit: usize) -> Vec<Value> {
        let tables = self.tables.lock().await;
        tables
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

/// Build the wire event: id, type, from and timestamp, with the payload's
/// keys flattened alongside them.
pub fn build_event(from_agent: &str, event_type: &str, payload: &Value) -> Value {
    let mut event = serde_json::Map::new();
    event.insert("id".into(), json!(uuid::Uuid::new_v4().to_string()));
    event.insert("type".into(), json!(event_type));
    event.insert("from".into(), json!(from_agent));
    event.insert("timestamp".into(), json!(ksi_protocol::timestamp_utc()));
    if let Value::Object(map) = payload {
        for (k, v) in map {
            // The envelope fields win over payload keys of the same name.
            event.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Value::Object(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> MessageBus {
        MessageBus::new(None, 1000, 10)
    }

    async fn connect_and_subscribe(
        bus: &MessageBus,
        agent_id: &str,
        event_types: &[&str],
    ) -> Arc<CollectingSink> {
        let sink = Arc::new(CollectingSink::default());
        bus.connect(agent_id, sink.clone()).await;
        let types: Vec<String> = event_types.iter().map(|s| s.to_string()).collect();
        assert!(bus.subscribe(agent_id, &types).await);
        sink
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let bus = bus();
        let sender = connect_and_subscribe(&bus, "a1", &["BROADCAST"]).await;
        let receiver = connect_and_subscribe(&bus, "a2", &["BROADCAST"]).await;

        let outcome = bus
            .publish("a1", "BROADCAST", &json!({"message": "hi"}))
            .await;
        assert_eq!(outcome["status"], "broadcast");
        assert_eq!(outcome["delivered"], json!(["a2"]));

        assert!(sender.events.lock().await.is_empty());
        let events = receiver.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "BROADCAST");
        assert_eq!(events[0]["from"], "a1");
        assert_eq!(events[0]["message"], "hi");
    }

    #[tokio::test]
    async fn direct_message_queues_for_offline_recipient() {
        let bus = bus();
        let outcome = bus
            .publish(
                "a1",
                "DIRECT_MESSAGE",
                &json!({"to": "a2", "content": "ping"}),
            )
            .await;
        assert_eq!(outcome["status"], "queued");

        // Reconnect, then drain, the way the dispatcher sequences it.
        let sink = Arc::new(CollectingSink::default());
        bus.connect("a2", sink.clone()).await;
        bus.drain_offline("a2").await;
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["content"], "ping");
    }

    #[tokio::test]
    async fn direct_message_notifies_watchers_but_not_sender() {
        let bus = bus();
        let _sender = connect_and_subscribe(&bus, "a1", &["DIRECT_MESSAGE"]).await;
        let monitor = connect_and_subscribe(&bus, "mon", &["DIRECT_MESSAGE"]).await;
        let recipient = Arc::new(CollectingSink::default());
        bus.connect("a2", recipient.clone()).await;

        let outcome = bus
            .publish("a1", "DIRECT_MESSAGE", &json!({"to": "a2", "body": 1}))
            .await;
        assert_eq!(outcome["status"], "delivered");
        assert_eq!(outcome["notified"], json!(["mon"]));
        assert_eq!(monitor.events.lock().await.len(), 1);
        assert_eq!(recipient.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_write_falls_back_to_offline_queue() {
        let bus = bus();
        let flaky = connect_and_subscribe(&bus, "a2", &["BROADCAST"]).await;
        flaky.fail.store(true, std::sync::atomic::Ordering::Relaxed);

        let outcome = bus.publish("a1", "BROADCAST", &json!({"n": 1})).await;
        assert_eq!(outcome["failed"], json!(["a2"]));

        let stats = bus.stats().await;
        assert_eq!(stats["offline_queues"]["a2"], 1);
    }

    #[tokio::test]
    async fn disconnect_clears_subscriptions() {
        let bus = bus();
        let _sink = connect_and_subscribe(&bus, "a2", &["BROADCAST", "metrics"]).await;
        bus.disconnect("a2").await;

        let outcome = bus.publish("a1", "BROADCAST", &json!({})).await;
        assert_eq!(outcome["total"], 0);
        assert!(!bus.is_connected("a2").await);

        // Resubscribe requires a live connection.
        assert!(!bus.subscribe("a2", &["BROADCAST".to_string()]).await);
    }

    #[tokio::test]
    async fn generic_events_reach_only_their_subscribers() {
        let bus = bus();
        let metrics = connect_and_subscribe(&bus, "m1", &["metrics"]).await;
        let other = connect_and_subscribe(&bus, "o1", &["BROADCAST"]).await;

        let outcome = bus.publish("a1", "metrics", &json!({"cpu": 93})).await;
        assert_eq!(outcome["status"], "published");
        assert_eq!(outcome["delivered_to"], json!(["m1"]));
        assert_eq!(metrics.events.lock().await.len(), 1);
        assert!(other.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let bus = MessageBus::new(None, 3, 10);
        for i in 0..5 {
            bus.publish("a1", "tick", &json!({"n": i})).await;
        }
        let history = bus.history(10).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["n"], 2);
        assert_eq!(history[2]["n"], 4);
    }

    #[tokio::test]
    async fn offline_queue_is_bounded() {
        let bus = MessageBus::new(None, 100, 2);
        for i in 0..4 {
            bus.publish("a1", "DIRECT_MESSAGE", &json!({"to": "gone", "n": i}))
                .await;
        }
        let stats = bus.stats().await;
        assert_eq!(stats["offline_queues"]["gone"], 2);

        let sink = Arc::new(CollectingSink::default());
        bus.connect("gone", sink.clone()).await;
        bus.drain_offline("gone").await;
        let events = sink.events.lock().await;
        assert_eq!(events[0]["n"], 2);
        assert_eq!(events[1]["n"], 3);
    }

    #[tokio::test]
    async fn failed_drain_requeues_in_order() {
        let bus = bus();
        for i in 0..3 {
            bus.publish("a1", "DIRECT_MESSAGE", &json!({"to": "a2", "n": i}))
                .await;
        }
        let sink = Arc::new(CollectingSink::default());
        sink.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        bus.connect("a2", sink.clone()).await;
        bus.drain_offline("a2").await;

        // Nothing delivered, nothing lost.
        assert!(sink.events.lock().await.is_empty());
        let stats = bus.stats().await;
        assert_eq!(stats["offline_queues"]["a2"], 3);

        sink.fail.store(false, std::sync::atomic::Ordering::Relaxed);
        bus.drain_offline("a2").await;
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["n"], 0);
        assert_eq!(events[2]["n"], 2);
    }

    #[tokio::test]
    async fn unaddressed_task_assignment_is_an_error() {
        let bus = bus();
        let outcome = bus.publish("router", "TASK_ASSIGNMENT", &json!({})).await;
        assert_eq!(outcome["status"], "error");
    }

    #[test]
    fn build_event_flattens_payload_without_clobbering_envelope() {
        let event = build_event("a1", "BROADCAST", &json!({"message": "hi", "from": "spoof"}));
        assert_eq!(event["from"], "a1");
        assert_eq!(event["message"], "hi");
        assert!(event["id"].as_str().is_some());
        assert!(event["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
