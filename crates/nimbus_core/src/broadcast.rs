//! In-process fan-out of streaming messages to live subscribers.
//!
//! Publishing never waits on a slow reader: once a subscriber is a full
//! buffer behind, the oldest messages are dropped for it and its lag counter
//! grows. Messages published before a subscriber joined are never delivered
//! to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use crate::context::{LogicalEnv, ProviderKind};
use crate::execution::OutputStream;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    CommandOutput,
    ContextSwitchStarted,
    ContextSwitchFailed,
    AuthRequired,
    ActionLog,
    Error,
}

/// `{type, data, timestamp}` as seen by dashboards and CLI watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn command_output(
        provider_kind: ProviderKind,
        env: &LogicalEnv,
        execution_id: &str,
        stream: OutputStream,
        line: &str,
    ) -> Self {
        Self::new(
            MessageType::CommandOutput,
            json!({
                "provider_kind": provider_kind,
                "logical_env": env,
                "execution_id": execution_id,
                "stream": stream,
                "line": line,
            }),
        )
    }

    pub fn context_switch_started(
        provider_kind: ProviderKind,
        env: &LogicalEnv,
        from: Option<&str>,
        to: &str,
    ) -> Self {
        Self::new(
            MessageType::ContextSwitchStarted,
            json!({
                "provider_kind": provider_kind,
                "logical_env": env,
                "from_selector": from,
                "to_selector": to,
            }),
        )
    }

    pub fn context_switch_failed(
        provider_kind: ProviderKind,
        env: &LogicalEnv,
        expected: &str,
        actual: Option<&str>,
        cause: &str,
    ) -> Self {
        Self::new(
            MessageType::ContextSwitchFailed,
            json!({
                "provider_kind": provider_kind,
                "logical_env": env,
                "expected": expected,
                "actual": actual,
                "cause": cause,
            }),
        )
    }

    pub fn auth_required(provider_kind: ProviderKind, env: &LogicalEnv, login_hint: &str) -> Self {
        Self::new(
            MessageType::AuthRequired,
            json!({
                "provider_kind": provider_kind,
                "logical_env": env,
                "login_hint": login_hint,
            }),
        )
    }

    pub fn action_log(controller: &str, action: &str, env: &LogicalEnv, detail: Value) -> Self {
        Self::new(
            MessageType::ActionLog,
            json!({
                "controller": controller,
                "action": action,
                "logical_env": env,
                "detail": detail,
            }),
        )
    }

    pub fn error(source: &str, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            json!({ "source": source, "message": message }),
        )
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","data":{{"message":"unserializable message: {e}"}}}}"#)
        })
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to a shared hub.
///
/// Backed by one `tokio::sync::broadcast` channel: every send lands in a
/// single ring, so all subscribers observe the same order.
#[derive(Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<BroadcastMessage>,
    capacity: usize,
    next_id: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
}

impl BroadcastHub {
    /// `capacity` is rounded up to a power of two by the channel.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            next_id: Arc::new(AtomicU64::new(1)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a new subscriber. It sees only messages published from now on.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, "Broadcast subscriber added");
        Subscription {
            id,
            rx: self.sender.subscribe(),
            lagged: 0,
        }
    }

    /// Delivers `message` to every live subscriber and returns how many got it.
    pub fn publish(&self, message: BroadcastMessage) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // An error only means nobody is subscribed.
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving end of a hub subscription. Dropping it disconnects.
pub struct Subscription {
    id: u64,
    rx: broadcast::Receiver<BroadcastMessage>,
    lagged: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next message. Returns `None` once every hub handle is
    /// gone and the backlog has drained.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Messages dropped because this subscriber fell behind. Resets to zero.
    pub fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    fn record_lag(&mut self, skipped: u64) {
        if self.lagged == 0 {
            warn!(subscriber = self.id, skipped, "Broadcast subscriber lagging, oldest messages dropped");
        }
        self.lagged += skipped;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(subscriber = self.id, "Broadcast subscriber removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dev() -> LogicalEnv {
        LogicalEnv::new("dev").unwrap()
    }

    fn line(n: usize) -> BroadcastMessage {
        BroadcastMessage::command_output(
            ProviderKind::Aws,
            &dev(),
            "exec-1",
            OutputStream::Stdout,
            &format!("L{n}"),
        )
    }

    fn line_of(msg: &BroadcastMessage) -> String {
        msg.data["line"].as_str().unwrap_or_default().to_string()
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = BroadcastMessage::auth_required(ProviderKind::Gcp, &dev(), "gcloud auth login");
        let json: Value = serde_json::from_str(&msg.to_json_line()).unwrap();
        assert_eq!(json["type"], "auth_required");
        assert_eq!(json["data"]["provider_kind"], "gcp");
        assert_eq!(json["data"]["logical_env"], "dev");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_same_order() {
        let hub = BroadcastHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        for n in 1..=50 {
            assert_eq!(hub.publish(line(n)), 2);
        }
        for n in 1..=50 {
            assert_eq!(line_of(&a.recv().await.unwrap()), format!("L{n}"));
            assert_eq!(line_of(&b.recv().await.unwrap()), format!("L{n}"));
        }
    }

    #[tokio::test]
    async fn test_concurrent_publishers_single_total_order() {
        let hub = BroadcastHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let mut handles = Vec::new();
        for task in 0..4 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..50 {
                    hub.publish(line(task * 1000 + n));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while let Some(m) = a.try_recv() {
            seen_a.push(line_of(&m));
        }
        while let Some(m) = b.try_recv() {
            seen_b.push(line_of(&m));
        }
        assert_eq!(seen_a.len(), 200);
        assert_eq!(seen_a, seen_b);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let hub = BroadcastHub::new(4);
        let mut sub = hub.subscribe();
        for n in 1..=6 {
            hub.publish(line(n));
        }
        let lines: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|m| line_of(&m))
            .collect();
        assert_eq!(lines, vec!["L3", "L4", "L5", "L6"]);
        assert_eq!(sub.take_lagged(), 2);
        assert_eq!(sub.take_lagged(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_slow_others() {
        let hub = BroadcastHub::new(2);
        let mut idle = hub.subscribe();
        let mut active = hub.subscribe();
        for n in 1..=3 {
            hub.publish(line(n));
            assert_eq!(line_of(&active.recv().await.unwrap()), format!("L{n}"));
        }
        assert_eq!(line_of(&idle.recv().await.unwrap()), "L2");
        assert_eq!(idle.take_lagged(), 1);
        assert_eq!(active.take_lagged(), 0);
    }

    #[test]
    fn test_dropped_subscriber_removed_others_unaffected() {
        let hub = BroadcastHub::default();
        let mut keep = hub.subscribe();
        let gone = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        drop(gone);
        assert_eq!(hub.publish(line(1)), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(line_of(&keep.try_recv().unwrap()), "L1");
    }

    #[test]
    fn test_no_replay_for_late_subscriber() {
        let hub = BroadcastHub::default();
        hub.publish(line(1));
        let mut late = hub.subscribe();
        assert!(late.try_recv().is_none());
        hub.publish(line(2));
        assert_eq!(line_of(&late.try_recv().unwrap()), "L2");
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = BroadcastHub::default();
        let mut sub = hub.subscribe();
        let publisher = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(line(7));
        });
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("recv should wake")
            .unwrap();
        assert_eq!(line_of(&msg), "L7");
    }

    #[tokio::test]
    async fn test_recv_ends_when_hub_dropped() {
        let hub = BroadcastHub::default();
        let mut sub = hub.subscribe();
        hub.publish(line(1));
        drop(hub);
        assert!(sub.recv().await.is_some());
        let end = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("recv should not hang");
        assert!(end.is_none());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = BroadcastHub::default();
        assert_eq!(hub.publish(BroadcastMessage::error("test", "nobody listening")), 0);
        assert_eq!(hub.published_count(), 1);
    }
}
