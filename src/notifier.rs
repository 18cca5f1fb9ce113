//! Scoped publish/subscribe for realtime lab updates.
//!
//! Every live connection owns one bounded queue. `publish` offers an event to
//! each connection whose scopes intersect the event's scopes, at most once per
//! connection, and never waits: a full queue drops the event for that
//! connection. Events published in sequence reach a given connection in the
//! same sequence. Nothing is buffered for connections that are not live.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::orchestrator::{InstanceStatus, LabInstance};

/// Default per-connection queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

pub type ConnectionId = u64;

/// What a connection may observe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    User(String),
    Classroom(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEvent {
    pub instance_id: String,
    pub owner: String,
    pub classroom: String,
    pub status: InstanceStatus,
    /// Set once the instance record has been deleted.
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl InstanceEvent {
    pub fn from_instance(instance: &LabInstance, removed: bool) -> Self {
        Self {
            instance_id: instance.id.clone(),
            owner: instance.owner.clone(),
            classroom: instance.classroom.clone(),
            status: instance.status,
            removed,
            error: instance.error.clone(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    pub online: bool,
    pub classrooms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Event {
    Instance(InstanceEvent),
    Presence(PresenceEvent),
}

impl Event {
    /// Scopes allowed to see this event.
    pub fn scopes(&self) -> Vec<Scope> {
        match self {
            Self::Instance(e) => vec![Scope::User(e.owner.clone()), Scope::Classroom(e.classroom.clone())],
            Self::Presence(e) => e.classrooms.iter().cloned().map(Scope::Classroom).collect(),
        }
    }
}

/// Receiving half handed to a connection on [`Notifier::connect`].
pub struct Subscription {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<Event>,
}

struct Subscriber {
    scopes: HashSet<Scope>,
    tx: mpsc::Sender<Event>,
}

pub struct Notifier {
    next_id: AtomicU64,
    queue_depth: usize,
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
}

impl Notifier {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection with no scopes yet.
    pub async fn connect(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                scopes: HashSet::new(),
                tx,
            },
        );
        debug!(connection = id, "Realtime connection registered");
        Subscription { id, events: rx }
    }

    /// Add a scope; returns false if the connection is gone.
    pub async fn subscribe(&self, connection: ConnectionId, scope: Scope) -> bool {
        match self.subscribers.write().await.get_mut(&connection) {
            Some(subscriber) => {
                debug!(connection, ?scope, "Subscribed");
                subscriber.scopes.insert(scope);
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, connection: ConnectionId, scope: &Scope) -> bool {
        match self.subscribers.write().await.get_mut(&connection) {
            Some(subscriber) => subscriber.scopes.remove(scope),
            None => false,
        }
    }

    pub async fn disconnect(&self, connection: ConnectionId) {
        if self.subscribers.write().await.remove(&connection).is_some() {
            debug!(connection, "Realtime connection removed");
        }
    }

    pub async fn connections(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Offer `event` to every interested connection. Returns how many
    /// connections accepted it.
    pub async fn publish(&self, event: Event) -> usize {
        let scopes = event.scopes();
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, subscriber) in subscribers.iter() {
                if !scopes.iter().any(|s| subscriber.scopes.contains(s)) {
                    continue;
                }
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(connection = id, "Realtime queue full, dropping event");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in closed {
                subscribers.remove(&id);
            }
        }
        delivered
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_event(id: &str, owner: &str, classroom: &str, status: InstanceStatus) -> Event {
        Event::Instance(InstanceEvent {
            instance_id: id.into(),
            owner: owner.into(),
            classroom: classroom.into(),
            status,
            removed: false,
            error: None,
            at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn events_reach_owner_and_classroom_observers_only() {
        let notifier = Notifier::default();
        let mut owner = notifier.connect().await;
        let mut instructor = notifier.connect().await;
        let mut stranger = notifier.connect().await;
        notifier.subscribe(owner.id, Scope::User("alice".into())).await;
        notifier.subscribe(instructor.id, Scope::Classroom("CS101".into())).await;
        notifier.subscribe(stranger.id, Scope::User("bob".into())).await;

        let delivered = notifier
            .publish(instance_event("gns3lab-1", "alice", "CS101", InstanceStatus::Running))
            .await;
        assert_eq!(delivered, 2);
        assert!(owner.events.try_recv().is_ok());
        assert!(instructor.events.try_recv().is_ok());
        assert!(stranger.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn overlapping_scopes_deliver_once() {
        let notifier = Notifier::default();
        let mut conn = notifier.connect().await;
        notifier.subscribe(conn.id, Scope::User("alice".into())).await;
        notifier.subscribe(conn.id, Scope::Classroom("CS101".into())).await;

        notifier
            .publish(instance_event("gns3lab-1", "alice", "CS101", InstanceStatus::Running))
            .await;
        assert!(conn.events.try_recv().is_ok());
        assert!(conn.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_instance_order_is_preserved() {
        let notifier = Notifier::default();
        let mut conn = notifier.connect().await;
        notifier.subscribe(conn.id, Scope::User("alice".into())).await;

        let sequence = [
            InstanceStatus::Provisioning,
            InstanceStatus::Running,
            InstanceStatus::Stopping,
            InstanceStatus::Stopped,
        ];
        for status in sequence {
            notifier.publish(instance_event("gns3lab-1", "alice", "CS101", status)).await;
        }
        for expected in sequence {
            match conn.events.recv().await.unwrap() {
                Event::Instance(e) => assert_eq!(e.status, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let notifier = Notifier::new(1);
        let mut conn = notifier.connect().await;
        notifier.subscribe(conn.id, Scope::User("alice".into())).await;

        assert_eq!(notifier.publish(instance_event("a", "alice", "CS101", InstanceStatus::Running)).await, 1);
        assert_eq!(notifier.publish(instance_event("b", "alice", "CS101", InstanceStatus::Running)).await, 0);
        assert!(conn.events.try_recv().is_ok());
        assert!(conn.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_replay_for_late_or_dropped_connections() {
        let notifier = Notifier::default();
        notifier
            .publish(instance_event("gns3lab-1", "alice", "CS101", InstanceStatus::Running))
            .await;

        let mut late = notifier.connect().await;
        notifier.subscribe(late.id, Scope::User("alice".into())).await;
        assert!(late.events.try_recv().is_err());

        drop(late.events);
        notifier
            .publish(instance_event("gns3lab-1", "alice", "CS101", InstanceStatus::Stopping))
            .await;
        assert_eq!(notifier.connections().await, 0);
    }

    #[tokio::test]
    async fn presence_goes_to_classroom_scopes() {
        let notifier = Notifier::default();
        let mut prof = notifier.connect().await;
        notifier.subscribe(prof.id, Scope::Classroom("CS101".into())).await;

        notifier
            .publish(Event::Presence(PresenceEvent {
                user_id: "alice".into(),
                online: true,
                classrooms: vec!["CS101".into()],
            }))
            .await;
        let event = prof.events.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "presence");
        assert_eq!(json["userId"], "alice");
    }
}
