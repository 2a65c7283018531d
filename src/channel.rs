//! Event channel abstraction
//!
//! One channel per active room, topic-named from the room code. The
//! coordinator never talks to a transport directly: it opens channels
//! through an injected [`Transport`], publishes fire-and-forget through
//! [`Channel`], and consumes everything inbound as a [`ChannelSignal`]
//! stream. Payloads are parsed into [`WireEvent`] at this boundary, so the
//! coordinator only ever sees well-typed events.
//!
//! [`MemoryTransport`] is a process-local hub with the same delivery
//! semantics as the relay transport (no echo of one's own broadcasts,
//! presence fan-out on track and leave). It backs the test suite and
//! loopback play.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{PresencePayload, RoomConfig};

/// Typed application events carried on the room channel.
///
/// Serialized as `{"event": "...", "payload": {...}}`, one fixed payload
/// shape per event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum WireEvent {
    /// Authoritative room config, host to guest. Resent on ready so a guest
    /// that missed the first copy still converges.
    RoomConfig(RoomConfig),
    /// Countdown start, carrying the shared absolute start time. Each peer
    /// derives its remaining seconds from `start_at`, never from a relative
    /// counter, so delivery delay cannot skew the start.
    #[serde(rename_all = "camelCase")]
    Countdown { start_at: u64 },
    /// One resolved question on the sender's side.
    #[serde(rename_all = "camelCase")]
    Answer {
        user_id: String,
        question_index: usize,
        is_correct: bool,
        answer_time: f64,
    },
    /// The sender exhausted its question list.
    #[serde(rename_all = "camelCase")]
    BattleFinished {
        user_id: String,
        score: u32,
        answer_times: Vec<f64>,
    },
}

/// Connection status of a channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    TimedOut,
    Closed,
}

/// Everything a channel delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Status(ChannelStatus),
    /// Full membership snapshot (all currently tracked presences).
    PresenceSync(Vec<PresencePayload>),
    /// Members that just left.
    PresenceLeave(Vec<PresencePayload>),
    Broadcast(WireEvent),
}

/// An open, topic-scoped pub/sub channel.
///
/// All operations are fire-and-forget: a failed publish is logged and
/// dropped, never surfaced to the caller. At-most-once delivery; the
/// coordinator's reducers absorb duplicates and gaps.
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;
    /// Broadcast an event to the other channel members.
    fn send(&self, event: WireEvent);
    /// Announce this peer's presence to the channel.
    fn track(&self, presence: PresencePayload);
    /// Untrack, close the subscription, and emit `Status(Closed)`.
    fn leave(&self);
}

/// Opens channels. Injected into the coordinator so tests can substitute an
/// in-memory implementation for the relay-backed one.
pub trait Transport: Send + Sync {
    fn open(&self, topic: &str, signals: mpsc::UnboundedSender<ChannelSignal>) -> Arc<dyn Channel>;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

struct MemberSlot {
    id: u64,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    presence: Option<PresencePayload>,
}

type Hub = Arc<Mutex<HashMap<String, Vec<MemberSlot>>>>;

/// Process-local pub/sub hub.
///
/// Clones share the hub, so two coordinators built from clones of one
/// `MemoryTransport` can play against each other in a single process.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Hub,
    next_id: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, topic: &str, signals: mpsc::UnboundedSender<ChannelSignal>) -> Arc<dyn Channel> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut hub = self.hub.lock().unwrap();
            hub.entry(topic.to_string()).or_default().push(MemberSlot {
                id,
                signals: signals.clone(),
                presence: None,
            });
        }

        // Membership alone is not presence; peers appear to each other once
        // they track. Subscribing is immediate for an in-process hub.
        let _ = signals.send(ChannelSignal::Status(ChannelStatus::Subscribed));
        debug!(topic, "memory channel subscribed");

        Arc::new(MemoryChannel {
            hub: self.hub.clone(),
            topic: topic.to_string(),
            id,
            signals,
        })
    }
}

struct MemoryChannel {
    hub: Hub,
    topic: String,
    id: u64,
    signals: mpsc::UnboundedSender<ChannelSignal>,
}

impl Channel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send(&self, event: WireEvent) {
        let hub = self.hub.lock().unwrap();
        if let Some(members) = hub.get(&self.topic) {
            for member in members.iter().filter(|m| m.id != self.id) {
                let _ = member.signals.send(ChannelSignal::Broadcast(event.clone()));
            }
        }
    }

    fn track(&self, presence: PresencePayload) {
        let mut hub = self.hub.lock().unwrap();
        let Some(members) = hub.get_mut(&self.topic) else {
            return;
        };
        if let Some(me) = members.iter_mut().find(|m| m.id == self.id) {
            me.presence = Some(presence);
        }
        let snapshot: Vec<PresencePayload> =
            members.iter().filter_map(|m| m.presence.clone()).collect();
        for member in members.iter() {
            let _ = member
                .signals
                .send(ChannelSignal::PresenceSync(snapshot.clone()));
        }
    }

    fn leave(&self) {
        let mut hub = self.hub.lock().unwrap();
        let mut departed = None;
        if let Some(members) = hub.get_mut(&self.topic) {
            if let Some(pos) = members.iter().position(|m| m.id == self.id) {
                departed = members.remove(pos).presence;
            }
            if let Some(presence) = departed {
                for member in members.iter() {
                    let _ = member
                        .signals
                        .send(ChannelSignal::PresenceLeave(vec![presence.clone()]));
                }
            }
            if members.is_empty() {
                hub.remove(&self.topic);
            }
        }
        let _ = self.signals.send(ChannelSignal::Status(ChannelStatus::Closed));
        debug!(topic = %self.topic, "memory channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BattleRole;

    fn presence(id: &str, role: BattleRole) -> PresencePayload {
        PresencePayload {
            user_id: id.to_string(),
            display_name: id.to_uppercase(),
            role,
        }
    }

    #[tokio::test]
    async fn broadcasts_skip_the_sender() {
        let transport = MemoryTransport::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = transport.open("battle:TEST01", tx_a);
        let _b = transport.open("battle:TEST01", tx_b);

        assert_eq!(
            rx_a.recv().await,
            Some(ChannelSignal::Status(ChannelStatus::Subscribed))
        );
        assert_eq!(
            rx_b.recv().await,
            Some(ChannelSignal::Status(ChannelStatus::Subscribed))
        );

        a.send(WireEvent::Countdown { start_at: 123 });
        assert_eq!(
            rx_b.recv().await,
            Some(ChannelSignal::Broadcast(WireEvent::Countdown {
                start_at: 123
            }))
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn track_fans_out_full_membership() {
        let transport = MemoryTransport::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = transport.open("battle:TEST02", tx_a);
        let b = transport.open("battle:TEST02", tx_b);
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;

        a.track(presence("host", BattleRole::Host));
        assert_eq!(
            rx_b.recv().await,
            Some(ChannelSignal::PresenceSync(vec![presence(
                "host",
                BattleRole::Host
            )]))
        );

        b.track(presence("guest", BattleRole::Guest));
        // a's own track echoed a one-member sync first
        let ChannelSignal::PresenceSync(first) = rx_a.recv().await.unwrap() else {
            panic!("expected first sync");
        };
        assert_eq!(first.len(), 1);
        // the guest's track carries both members
        let ChannelSignal::PresenceSync(second) = rx_a.recv().await.unwrap() else {
            panic!("expected second sync");
        };
        assert_eq!(second.len(), 2);
        assert!(second.iter().any(|p| p.user_id == "guest"));
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let transport = MemoryTransport::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = transport.open("battle:TEST03", tx_a);
        let b = transport.open("battle:TEST03", tx_b);
        a.track(presence("host", BattleRole::Host));
        b.track(presence("guest", BattleRole::Guest));

        b.leave();
        let mut saw_leave = false;
        while let Ok(sig) = rx_a.try_recv() {
            if sig == ChannelSignal::PresenceLeave(vec![presence("guest", BattleRole::Guest)]) {
                saw_leave = true;
            }
        }
        assert!(saw_leave);

        // the leaver sees its own Closed status
        let mut saw_closed = false;
        while let Ok(sig) = rx_b.try_recv() {
            if sig == ChannelSignal::Status(ChannelStatus::Closed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[test]
    fn wire_events_use_tagged_json() {
        let event = WireEvent::Answer {
            user_id: "u1".to_string(),
            question_index: 3,
            is_correct: true,
            answer_time: 1.5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"answer\""));
        assert!(json.contains("\"userId\":\"u1\""));
        assert!(json.contains("\"questionIndex\":3"));
        assert!(json.contains("\"isCorrect\":true"));

        let back: WireEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);

        let countdown = WireEvent::Countdown { start_at: 1000 };
        let json = serde_json::to_string(&countdown).unwrap();
        assert!(json.contains("\"event\":\"countdown\""));
        assert!(json.contains("\"startAt\":1000"));
    }
}
