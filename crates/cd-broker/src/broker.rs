//! The in-process fan-out broker (spec §4.5). Explicitly constructed with
//! its dependencies (a log sink, a clock-driven heartbeat task) and passed
//! into handlers — no module-level singleton (spec §9's redesign flag).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cd_common::model::{EventKind, EventRecord, ResourceType, Severity};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{trace, warn};
use ulid::Ulid;

use crate::sink::LogSink;
use crate::subscriber::{new_subscriber_pair, Subscriber, SubscriberHandle};

pub const SUBSCRIBER_SEND_TIMEOUT: Duration = Duration::from_millis(100);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const COMPLETE_DRAIN_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_ref: Ulid,
}

#[derive(Default)]
struct ResourceState {
    sequence: AtomicU64,
    subscribers: Vec<Subscriber>,
}

/// Fans out events to zero-or-more subscribers and persists each one.
/// Cloning an `EventBroker` is cheap; all state lives behind `Arc`.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<RwLock<HashMap<ResourceKey, ResourceState>>>,
    sink: Arc<dyn LogSink>,
}

impl EventBroker {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            sink,
        }
    }

    /// Spawns the 15s heartbeat loop (spec §4.5). Returns a join handle the
    /// caller can hold to cancel on shutdown.
    pub fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                broker.heartbeat_all().await;
            }
        })
    }

    async fn heartbeat_all(&self) {
        let keys: Vec<ResourceKey> = self.inner.read().await.keys().copied().collect();
        for key in keys {
            self.publish_internal(key, EventKind::Heartbeat, Severity::Debug, Value::Null, false)
                .await;
        }
    }

    /// Registers a new subscriber for `resource_type`/`resource_ref`. Emits a
    /// synthetic `connected` event to the new subscriber only, per spec
    /// §4.5 — it never touches the resource's persisted sequence.
    pub async fn subscribe(
        &self,
        resource_type: ResourceType,
        resource_ref: Ulid,
    ) -> SubscriberHandle {
        let key = ResourceKey {
            resource_type,
            resource_ref,
        };
        let (subscriber, handle) = new_subscriber_pair();

        let connected = EventRecord {
            sequence: 0,
            resource_type,
            resource_ref,
            kind: EventKind::Connected,
            severity: Severity::Debug,
            payload: Value::Null,
            occurred_at: Utc::now(),
        };
        let _ = subscriber.sender.try_send(connected);

        let mut table = self.inner.write().await;
        table.entry(key).or_default().subscribers.push(subscriber);

        handle
    }

    /// Removes a subscriber (on stream disconnect, or after a `complete`
    /// drain).
    pub async fn unsubscribe(&self, resource_type: ResourceType, resource_ref: Ulid, id: uuid::Uuid) {
        let key = ResourceKey {
            resource_type,
            resource_ref,
        };
        let mut table = self.inner.write().await;
        if let Some(state) = table.get_mut(&key) {
            state.subscribers.retain(|s| s.id != id);
        }
    }

    /// Publishes an event: persists it (best-effort, concurrently) and
    /// offers it to every live subscriber without ever blocking the caller
    /// longer than `SUBSCRIBER_SEND_TIMEOUT` total across subscribers (spec
    /// §4.5, §8 S5).
    pub async fn publish(
        &self,
        resource_type: ResourceType,
        resource_ref: Ulid,
        kind: EventKind,
        severity: Severity,
        payload: Value,
    ) -> EventRecord {
        let key = ResourceKey {
            resource_type,
            resource_ref,
        };
        self.publish_internal(key, kind, severity, payload, true)
            .await
    }

    async fn publish_internal(
        &self,
        key: ResourceKey,
        kind: EventKind,
        severity: Severity,
        payload: Value,
        persist: bool,
    ) -> EventRecord {
        let sequence = {
            let mut table = self.inner.write().await;
            let state = table.entry(key).or_default();
            state.sequence.fetch_add(1, Ordering::SeqCst) + 1
        };

        let record = EventRecord {
            sequence,
            resource_type: key.resource_type,
            resource_ref: key.resource_ref,
            kind,
            severity,
            payload,
            occurred_at: Utc::now(),
        };

        let sink = self.sink.clone();
        let persisted_record = record.clone();
        if persist {
            tokio::spawn(async move {
                if let Err(err) = sink.append(persisted_record).await {
                    warn!(error = %err, "failed to persist event record");
                }
            });
        }

        self.fan_out(key, record.clone()).await;

        if kind == EventKind::Complete {
            self.schedule_drain(key);
        }

        record
    }

    /// Offers `record` to every subscriber concurrently, each bounded by
    /// `SUBSCRIBER_SEND_TIMEOUT`. A subscriber whose queue is still full
    /// after the timeout has the event dropped for it alone; the broker
    /// never blocks on a slow subscriber beyond that bound (spec §4.5).
    async fn fan_out(&self, key: ResourceKey, record: EventRecord) {
        let senders: Vec<_> = {
            let table = self.inner.read().await;
            match table.get(&key) {
                Some(state) => state
                    .subscribers
                    .iter()
                    .map(|s| (s.sender.clone(), s.dropped.clone()))
                    .collect(),
                None => return,
            }
        };

        let sends = senders.into_iter().map(|(sender, dropped)| {
            let record = record.clone();
            async move {
                match timeout(SUBSCRIBER_SEND_TIMEOUT, sender.send(record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        // Receiver gone; nothing more to do, it will be
                        // reaped on next unsubscribe/disconnect.
                    }
                    Err(_elapsed) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("subscriber queue full past timeout, dropping event for it");
                    }
                }
            }
        });

        futures::future::join_all(sends).await;
    }

    fn schedule_drain(&self, key: ResourceKey) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETE_DRAIN_DELAY).await;
            let mut table = broker.inner.write().await;
            table.remove(&key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use std::time::Duration;

    fn ulid() -> Ulid {
        Ulid::new()
    }

    #[tokio::test]
    async fn connected_event_is_first_on_the_stream() {
        let broker = EventBroker::new(Arc::new(RecordingSink::new()));
        let resource = ulid();
        let mut handle = broker.subscribe(ResourceType::Deployment, resource).await;
        let first = handle.receiver.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Connected);
    }

    #[tokio::test]
    async fn events_are_totally_ordered_per_resource() {
        let broker = EventBroker::new(Arc::new(RecordingSink::new()));
        let resource = ulid();
        let mut handle = broker.subscribe(ResourceType::Deployment, resource).await;
        let _ = handle.receiver.recv().await.unwrap(); // connected

        for i in 0..20 {
            broker
                .publish(
                    ResourceType::Deployment,
                    resource,
                    EventKind::Phase,
                    Severity::Info,
                    serde_json::json!({ "i": i }),
                )
                .await;
        }

        let mut last_seq = 0;
        for _ in 0..20 {
            let event = handle.receiver.recv().await.unwrap();
            assert!(event.sequence > last_seq);
            last_seq = event.sequence;
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_does_not_block_producer() {
        let broker = EventBroker::new(Arc::new(RecordingSink::new()));
        let resource = ulid();
        let handle = broker.subscribe(ResourceType::Deployment, resource).await;
        // Never drain `handle`: its bounded queue will fill and start
        // timing out.
        let start = std::time::Instant::now();
        for i in 0..2000 {
            broker
                .publish(
                    ResourceType::Deployment,
                    resource,
                    EventKind::Phase,
                    Severity::Info,
                    serde_json::json!({ "i": i }),
                )
                .await;
        }
        // 2000 events each bounded at 100ms should still complete well
        // under serial worst case because fan_out awaits all subscribers
        // concurrently per event, not per-subscriber sequentially across
        // events; the dominant cost here is the 100ms timeout per publish
        // once the queue is saturated.
        assert!(start.elapsed() < Duration::from_secs(60));
        assert!(handle.dropped_count() > 0);
    }

    #[tokio::test]
    async fn complete_event_closes_subscribers_after_drain_delay() {
        let broker = EventBroker::new(Arc::new(RecordingSink::new()));
        let resource = ulid();
        let key = ResourceKey {
            resource_type: ResourceType::Deployment,
            resource_ref: resource,
        };
        let _handle = broker.subscribe(ResourceType::Deployment, resource).await;
        broker
            .publish(
                ResourceType::Deployment,
                resource,
                EventKind::Complete,
                Severity::Info,
                serde_json::json!({}),
            )
            .await;

        assert!(broker.inner.read().await.contains_key(&key));
        tokio::time::sleep(COMPLETE_DRAIN_DELAY + Duration::from_millis(200)).await;
        assert!(!broker.inner.read().await.contains_key(&key));
    }

    #[tokio::test]
    async fn persisted_log_receives_every_event() {
        let sink = Arc::new(RecordingSink::new());
        let broker = EventBroker::new(sink.clone());
        let resource = ulid();
        for i in 0..50 {
            broker
                .publish(
                    ResourceType::Build,
                    resource,
                    EventKind::Log,
                    Severity::Info,
                    serde_json::json!({ "i": i }),
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.records().await.len(), 50);
    }
}
