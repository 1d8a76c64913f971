//! In-process publish/subscribe broker for live asset events.
//!
//! A `Hub` is created once at process start and cloned into whoever needs it;
//! tests build as many independent hubs as they like. Each subscriber gets a
//! bounded queue. Publishing never waits: a subscriber whose queue is full is
//! dropped on the spot and its connection is told to close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::asset::ProcessingState;

pub type ConnectionId = u64;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    #[serde(rename = "asset.state_changed", rename_all = "camelCase")]
    StateChanged {
        asset_id: Uuid,
        from_state: ProcessingState,
        to_state: ProcessingState,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "asset.created", rename_all = "camelCase")]
    AssetCreated {
        asset_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "asset.deleted", rename_all = "camelCase")]
    AssetDeleted {
        asset_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl HubEvent {
    pub fn asset_id(&self) -> Uuid {
        match self {
            HubEvent::StateChanged { asset_id, .. }
            | HubEvent::AssetCreated { asset_id, .. }
            | HubEvent::AssetDeleted { asset_id, .. } => *asset_id,
        }
    }
}

struct ClientHandle {
    sender: mpsc::Sender<Arc<HubEvent>>,
    closed: CancellationToken,
}

struct HubInner {
    clients: Mutex<HashMap<ConnectionId, ClientHandle>>,
    next_id: AtomicU64,
    capacity: usize,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Outcome of one `publish` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: queue_capacity.max(1),
            }),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ConnectionId, ClientHandle>> {
        // The map stays consistent even if a holder panicked mid-iteration.
        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a connection to the live set and hands back its receiving end.
    pub fn register(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let closed = CancellationToken::new();

        self.clients().insert(
            id,
            ClientHandle {
                sender,
                closed: closed.clone(),
            },
        );
        tracing::debug!(connection = id, "Hub | registered");

        Subscription {
            id,
            receiver,
            closed,
            hub: self.clone(),
        }
    }

    /// Removes a connection and releases its queue. Returns whether it was
    /// still registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.clients().remove(&id);
        match removed {
            Some(client) => {
                client.closed.cancel();
                tracing::debug!(connection = id, "Hub | unregistered");
                true
            }
            None => false,
        }
    }

    /// Enqueues `event` on every live connection without waiting.
    pub fn publish(&self, event: HubEvent) -> PublishReport {
        let event = Arc::new(event);
        let mut report = PublishReport::default();
        let mut overflowed = Vec::new();

        {
            let mut clients = self.clients();
            for (id, client) in clients.iter() {
                match client.sender.try_send(Arc::clone(&event)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => overflowed.push(*id),
                    Err(TrySendError::Closed(_)) => report.dropped.push(*id),
                }
            }
            for id in overflowed.iter().chain(report.dropped.iter()) {
                if let Some(client) = clients.remove(id) {
                    client.closed.cancel();
                }
            }
        }

        for id in &overflowed {
            tracing::warn!(connection = id, "Hub | queue full, disconnecting slow consumer");
        }
        report.dropped.extend(overflowed);
        report
    }

    pub fn connection_count(&self) -> usize {
        self.clients().len()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.clients().contains_key(&id)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connection_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// One subscriber's end of the hub. Dropping it unregisters the connection.
pub struct Subscription {
    id: ConnectionId,
    receiver: mpsc::Receiver<Arc<HubEvent>>,
    closed: CancellationToken,
    hub: Hub,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next queued event; `None` once the hub has dropped this connection and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<HubEvent>> {
        self.receiver.try_recv().ok()
    }

    /// Cancelled when the hub disconnects this subscriber; transports select
    /// on it to close the underlying connection.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(from: ProcessingState, to: ProcessingState) -> HubEvent {
        HubEvent::StateChanged {
            asset_id: Uuid::new_v4(),
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let hub = Hub::new(8);
        let mut subs: Vec<_> = (0..5).map(|_| hub.register()).collect();

        let event = changed(ProcessingState::Pending, ProcessingState::Processing);
        let report = hub.publish(event.clone());
        assert_eq!(report.delivered, 5);
        assert!(report.dropped.is_empty());

        for sub in subs.iter_mut() {
            assert_eq!(*sub.recv().await.unwrap(), event);
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_while_others_keep_receiving() {
        let hub = Hub::new(2);
        let stalled = hub.register();
        let mut healthy = hub.register();
        let stalled_id = stalled.id();

        for i in 0..3 {
            let report = hub.publish(changed(ProcessingState::Pending, ProcessingState::Processing));
            if i < 2 {
                assert_eq!(report.delivered, 2);
            } else {
                assert_eq!(report.delivered, 1);
                assert_eq!(report.dropped, vec![stalled_id]);
            }
            assert!(healthy.recv().await.is_some());
        }

        assert!(stalled.is_closed());
        assert!(!hub.is_registered(stalled_id));
        assert!(hub.is_registered(healthy.id()));
        assert_eq!(hub.connection_count(), 1);

        // Later events still flow to the healthy subscriber.
        assert_eq!(
            hub.publish(changed(ProcessingState::Processing, ProcessingState::Completed))
                .delivered,
            1
        );
        assert!(healthy.recv().await.is_some());
    }

    #[tokio::test]
    async fn overflowed_subscriber_drains_then_ends() {
        let hub = Hub::new(1);
        let mut sub = hub.register();
        hub.publish(changed(ProcessingState::Pending, ProcessingState::Processing));
        hub.publish(changed(ProcessingState::Processing, ProcessingState::Failed));

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = Hub::new(4);
        let sub = hub.register();
        let id = sub.id();
        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(sub.is_closed());
        drop(sub);
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn late_subscribers_miss_earlier_events() {
        let hub = Hub::new(4);
        hub.publish(changed(ProcessingState::Pending, ProcessingState::Processing));
        let mut late = hub.register();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let hub = Hub::new(4);
        {
            let _sub = hub.register();
            assert_eq!(hub.connection_count(), 1);
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn hubs_are_independent() {
        let a = Hub::new(4);
        let b = Hub::new(4);
        let _sub = a.register();
        assert_eq!(b.publish(changed(ProcessingState::Pending, ProcessingState::Processing)).delivered, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_publish() {
        let hub = Hub::new(64);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let mut sub = hub.register();
                hub.publish(changed(ProcessingState::Pending, ProcessingState::Processing));
                // At least our own event arrives.
                sub.recv().await.is_some()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn state_change_wire_shape() {
        let id = Uuid::nil();
        let event = HubEvent::StateChanged {
            asset_id: id,
            from_state: ProcessingState::Processing,
            to_state: ProcessingState::Completed,
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "asset.state_changed");
        assert_eq!(json["assetId"], id.to_string());
        assert_eq!(json["fromState"], "processing");
        assert_eq!(json["toState"], "completed");
        assert!(json["timestamp"].as_str().unwrap().starts_with("1970-01-01T00:00:00"));
    }
}
