//! Typed events and the subscription fan-out.
//!
//! Every mutation the loop performs publishes an event. Subscribers get
//! a bounded sink; a subscriber that falls behind is disconnected rather
//! than allowed to block the loop.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::formation::FormationKey;
use crate::job::JobSnapshot;

/// Discriminant of an [`EventKind`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Rectify,
    FormationChange,
    FormationSync,
    JobStart,
    JobStop,
    LeaderChange,
    Error,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Rectify => "rectify",
            EventType::FormationChange => "formation_change",
            EventType::FormationSync => "formation_sync",
            EventType::JobStart => "job_start",
            EventType::JobStop => "job_stop",
            EventType::LeaderChange => "leader_change",
            EventType::Error => "error",
        };
        f.write_str(s)
    }
}

/// Something the scheduler did or observed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A rectify pass ran for this formation (whether or not it acted).
    Rectify { key: FormationKey },
    /// A formation was created, updated or deleted.
    FormationChange { key: FormationKey },
    /// A full formation snapshot was applied.
    FormationSync,
    /// A job was observed running.
    JobStart { job: JobSnapshot },
    /// A job left the running set.
    JobStop { job: JobSnapshot },
    /// This scheduler switched between passive and active mode.
    LeaderChange { is_leader: bool },
    /// A recoverable error worth surfacing to observers.
    Error { message: String },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::Rectify { .. } => EventType::Rectify,
            EventKind::FormationChange { .. } => EventType::FormationChange,
            EventKind::FormationSync => EventType::FormationSync,
            EventKind::JobStart { .. } => EventType::JobStart,
            EventKind::JobStop { .. } => EventType::JobStop,
            EventKind::LeaderChange { .. } => EventType::LeaderChange,
            EventKind::Error { .. } => EventType::Error,
        }
    }
}

/// An event with its loop-assigned sequence number. Sequence numbers
/// increase monotonically in the order the loop issued the events.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

/// A subscriber's end of the event stream. Dropping it disconnects the
/// subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the scheduler has shut down or this
    /// subscriber was disconnected.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Fan-out of scheduler events to subscribers. Owned by the event loop.
#[derive(Debug)]
pub(crate) struct EventBus {
    buffer: usize,
    next_seq: u64,
    next_id: u64,
    sinks: HashMap<u64, mpsc::Sender<Event>>,
}

impl EventBus {
    pub(crate) fn new(buffer: usize) -> Self {
        Self {
            buffer,
            next_seq: 0,
            next_id: 0,
            sinks: HashMap::new(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.buffer);
        self.sinks.insert(id, tx);
        debug!(subscriber = id, "event subscriber attached");
        Subscription { id, rx }
    }

    /// Idempotent: unknown ids are ignored.
    pub(crate) fn unsubscribe(&mut self, id: u64) {
        self.sinks.remove(&id);
    }

    pub(crate) fn publish(&mut self, kind: EventKind) {
        self.next_seq += 1;
        let event = Event {
            seq: self.next_seq,
            kind,
        };
        self.sinks.retain(|&id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, "subscriber sink full, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub(crate) fn close(&mut self) {
        self.sinks.clear();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_numbers_monotonic() {
        let mut bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        bus.publish(EventKind::FormationSync);
        bus.publish(EventKind::LeaderChange { is_leader: true });
        bus.publish(EventKind::FormationSync);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        let third = sub.recv().await.unwrap();
        assert!(first.seq < second.seq && second.seq < third.seq);
        assert_eq!(second.event_type(), EventType::LeaderChange);
    }

    #[tokio::test]
    async fn test_slow_subscriber_disconnected() {
        let mut bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(EventKind::FormationSync);
        bus.publish(EventKind::FormationSync);
        assert_eq!(bus.subscriber_count(), 0);

        // the buffered event is still delivered, then the stream ends
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent() {
        let mut bus = EventBus::new(4);
        let sub = bus.subscribe();
        let id = sub.id();
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_pruned_on_publish() {
        let mut bus = EventBus::new(4);
        drop(bus.subscribe());
        bus.publish(EventKind::FormationSync);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event {
            seq: 7,
            kind: EventKind::LeaderChange { is_leader: true },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "leader_change");
        assert_eq!(json["is_leader"], true);
    }
}
