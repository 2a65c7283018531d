//! Nostr relay transport
//!
//! Production [`Transport`] carrying room traffic as ephemeral Nostr events
//! (not stored by relays) under the room topic's `d` tag. Relays have no
//! channel-native presence, so presence is synthesized the same way the
//! rest of the traffic flows: each peer announces itself with a presence
//! frame, keeps a heartbeat going, and a staleness sweep turns a silent
//! peer into a leave signal.

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelSignal, ChannelStatus, Transport, WireEvent};
use crate::error::{BattleError, Result};
use crate::runtime::{self, Duration};
use crate::types::PresencePayload;

/// Ephemeral event kind for room traffic.
const EPHEMERAL_KIND: u16 = 25020;

/// How often the notification loop re-checks its cancel flag when the
/// relay is quiet.
const SHUTDOWN_POLL_MS: u64 = 500;

/// Frames carried inside ephemeral events on a room topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Presence(PresencePayload),
    Leave(PresencePayload),
    Heartbeat { user_id: String, timestamp: u64 },
    App(WireEvent),
}

/// Relay-backed transport. One keypair and relay pool shared by every
/// channel it opens.
pub struct RelayTransport {
    client: Client,
    public_key: String,
    relays: Vec<String>,
    connected: Arc<Mutex<bool>>,
    heartbeat_interval: u64,
    disconnect_threshold: u64,
}

impl RelayTransport {
    /// Creates a transport with freshly generated keys.
    pub fn new(relays: Vec<String>) -> Self {
        let keys = Keys::generate();
        let public_key = keys.public_key().to_hex();
        Self {
            client: Client::new(keys),
            public_key,
            relays,
            connected: Arc::new(Mutex::new(false)),
            heartbeat_interval: 3000,
            disconnect_threshold: 10000,
        }
    }

    /// Creates a transport with a provided secret key.
    pub fn with_secret_key(secret_key: &str, relays: Vec<String>) -> Result<Self> {
        let keys = Keys::parse(secret_key).map_err(|e| BattleError::Relay(e.to_string()))?;
        let public_key = keys.public_key().to_hex();
        Ok(Self {
            client: Client::new(keys),
            public_key,
            relays,
            connected: Arc::new(Mutex::new(false)),
            heartbeat_interval: 3000,
            disconnect_threshold: 10000,
        })
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval = ms;
        self
    }

    pub fn disconnect_threshold(mut self, ms: u64) -> Self {
        self.disconnect_threshold = ms;
        self
    }

    /// Gets the transport's public key.
    pub fn public_key(&self) -> String {
        self.public_key.clone()
    }

    /// Checks whether `connect` has completed.
    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    /// Connects to the relay pool.
    pub async fn connect(&self) -> Result<()> {
        for relay in &self.relays {
            if let Err(e) = self.client.add_relay(relay).await {
                warn!("Failed to add relay {}: {}", relay, e);
            }
        }
        self.client.connect().await;
        *self.connected.lock().unwrap() = true;
        debug!("Connected to relays");
        Ok(())
    }

    /// Disconnects from the relay pool.
    pub async fn disconnect(&self) -> Result<()> {
        let _ = self.client.disconnect().await;
        *self.connected.lock().unwrap() = false;
        debug!("Disconnected from relays");
        Ok(())
    }
}

impl Transport for RelayTransport {
    fn open(&self, topic: &str, signals: mpsc::UnboundedSender<ChannelSignal>) -> Arc<dyn Channel> {
        let channel = Arc::new(RelayChannel {
            client: self.client.clone(),
            topic: topic.to_string(),
            public_key: self.public_key.clone(),
            signals,
            members: Arc::new(Mutex::new(HashMap::new())),
            own_presence: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            sub_id: Mutex::new(None),
            heartbeat_interval: self.heartbeat_interval,
            disconnect_threshold: self.disconnect_threshold,
        });
        channel.clone().start();
        channel
    }
}

struct RelayChannel {
    client: Client,
    topic: String,
    public_key: String,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    /// Peers seen on the topic, by user id, with last-seen timestamps.
    members: Arc<Mutex<HashMap<String, (PresencePayload, u64)>>>,
    own_presence: Arc<Mutex<Option<PresencePayload>>>,
    closed: Arc<AtomicBool>,
    sub_id: Mutex<Option<SubscriptionId>>,
    heartbeat_interval: u64,
    disconnect_threshold: u64,
}

impl RelayChannel {
    fn start(self: Arc<Self>) {
        let this = self.clone();
        runtime::spawn(async move {
            let filter = Filter::new()
                .kind(Kind::Custom(EPHEMERAL_KIND))
                .identifier(this.topic.clone());

            match this.client.subscribe(vec![filter], None).await {
                Ok(output) => {
                    *this.sub_id.lock().unwrap() = Some(output.id().clone());
                    let _ = this
                        .signals
                        .send(ChannelSignal::Status(ChannelStatus::Subscribed));
                    debug!(topic = %this.topic, "subscribed to room");
                    this.clone().run_notification_loop();
                    this.clone().run_heartbeat();
                    this.run_staleness_sweep();
                }
                Err(e) => {
                    let _ = this
                        .signals
                        .send(ChannelSignal::Status(ChannelStatus::Error(e.to_string())));
                }
            }
        });
    }

    fn run_notification_loop(self: Arc<Self>) {
        let this = self;
        runtime::spawn(async move {
            let mut notifications = this.client.notifications();
            loop {
                // A quiet relay delivers nothing, so a plain recv would
                // never observe the cancel flag after leave; poll it.
                let notification = tokio::select! {
                    result = notifications.recv() => match result {
                        Ok(notification) => Some(notification),
                        Err(_) => break,
                    },
                    _ = runtime::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)) => None,
                };
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                let Some(RelayPoolNotification::Event { event, .. }) = notification else {
                    continue;
                };
                if event.pubkey.to_hex() == this.public_key {
                    continue;
                }
                if !this.matches_topic(&event) {
                    continue;
                }
                match serde_json::from_str::<Frame>(&event.content) {
                    Ok(frame) => this.handle_frame(frame),
                    Err(e) => debug!("Ignoring malformed frame: {}", e),
                }
            }
        });
    }

    fn matches_topic(&self, event: &Event) -> bool {
        event.tags.iter().any(|tag| {
            tag.kind()
                == nostr_sdk::TagKind::SingleLetter(nostr_sdk::SingleLetterTag::lowercase(
                    nostr_sdk::Alphabet::D,
                ))
                && tag.content() == Some(self.topic.as_str())
        })
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Presence(presence) => {
                let newly_joined = {
                    let mut members = self.members.lock().unwrap();
                    members
                        .insert(
                            presence.user_id.clone(),
                            (presence.clone(), runtime::now_ms()),
                        )
                        .is_none()
                };
                if newly_joined {
                    // The new peer subscribed after our announce; repeat it
                    // so membership converges from both sides.
                    if let Some(own) = self.own_presence.lock().unwrap().clone() {
                        self.publish(&Frame::Presence(own));
                    }
                }
                let _ = self.signals.send(ChannelSignal::PresenceSync(self.snapshot()));
            }
            Frame::Leave(presence) => {
                self.members.lock().unwrap().remove(&presence.user_id);
                let _ = self
                    .signals
                    .send(ChannelSignal::PresenceLeave(vec![presence]));
            }
            Frame::Heartbeat { user_id, .. } => {
                if let Some(entry) = self.members.lock().unwrap().get_mut(&user_id) {
                    entry.1 = runtime::now_ms();
                }
            }
            Frame::App(event) => {
                let _ = self.signals.send(ChannelSignal::Broadcast(event));
            }
        }
    }

    /// Membership snapshot: tracked peers plus self.
    fn snapshot(&self) -> Vec<PresencePayload> {
        let mut all: Vec<PresencePayload> = self
            .members
            .lock()
            .unwrap()
            .values()
            .map(|(p, _)| p.clone())
            .collect();
        if let Some(own) = self.own_presence.lock().unwrap().clone() {
            all.push(own);
        }
        all
    }

    fn run_heartbeat(self: Arc<Self>) {
        let this = self;
        runtime::spawn(async move {
            let mut ticker = runtime::interval(Duration::from_millis(this.heartbeat_interval));
            loop {
                ticker.tick().await;
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                let own = this.own_presence.lock().unwrap().clone();
                if let Some(own) = own {
                    this.publish(&Frame::Heartbeat {
                        user_id: own.user_id,
                        timestamp: runtime::now_ms(),
                    });
                }
            }
        });
    }

    fn run_staleness_sweep(self: Arc<Self>) {
        let this = self;
        runtime::spawn(async move {
            let mut ticker = runtime::interval(Duration::from_millis(this.heartbeat_interval));
            loop {
                ticker.tick().await;
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                let now = runtime::now_ms();
                let stale: Vec<PresencePayload> = {
                    let mut members = this.members.lock().unwrap();
                    let gone: Vec<String> = members
                        .iter()
                        .filter(|(_, (_, last_seen))| {
                            now.saturating_sub(*last_seen) > this.disconnect_threshold
                        })
                        .map(|(id, _)| id.clone())
                        .collect();
                    gone.iter()
                        .filter_map(|id| members.remove(id).map(|(p, _)| p))
                        .collect()
                };
                if !stale.is_empty() {
                    debug!(topic = %this.topic, "peers timed out: {}", stale.len());
                    let _ = this.signals.send(ChannelSignal::PresenceLeave(stale));
                }
            }
        });
    }

    /// Fire-and-forget publish; failures are logged and dropped.
    fn publish(&self, frame: &Frame) {
        let content = match serde_json::to_string(frame) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                return;
            }
        };
        let client = self.client.clone();
        let topic = self.topic.clone();
        runtime::spawn(async move {
            let builder = EventBuilder::new(Kind::Custom(EPHEMERAL_KIND), content)
                .tags(vec![Tag::identifier(&topic)]);
            if let Err(e) = client.send_event_builder(builder).await {
                warn!("Failed to publish to {}: {}", topic, e);
            }
        });
    }
}

impl Channel for RelayChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send(&self, event: WireEvent) {
        self.publish(&Frame::App(event));
    }

    fn track(&self, presence: PresencePayload) {
        *self.own_presence.lock().unwrap() = Some(presence.clone());
        self.publish(&Frame::Presence(presence.clone()));

        // Relays drop messages now and then; repeat the announce so the
        // peer's first sync is not lost (mirrors the join re-send).
        let client = self.client.clone();
        let topic = self.topic.clone();
        let frame = Frame::Presence(presence.clone());
        runtime::spawn(async move {
            for delay in [500, 1500] {
                runtime::sleep(Duration::from_millis(delay)).await;
                if let Ok(content) = serde_json::to_string(&frame) {
                    let builder = EventBuilder::new(Kind::Custom(EPHEMERAL_KIND), content)
                        .tags(vec![Tag::identifier(&topic)]);
                    let _ = client.send_event_builder(builder).await;
                }
            }
        });

        let _ = self.signals.send(ChannelSignal::PresenceSync(self.snapshot()));
    }

    fn leave(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(own) = self.own_presence.lock().unwrap().take() {
            self.publish(&Frame::Leave(own));
        }
        if let Some(sub_id) = self.sub_id.lock().unwrap().take() {
            let client = self.client.clone();
            runtime::spawn(async move {
                client.unsubscribe(sub_id).await;
            });
        }
        let _ = self.signals.send(ChannelSignal::Status(ChannelStatus::Closed));
        debug!(topic = %self.topic, "left room channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BattleRole;

    #[test]
    fn frames_round_trip_as_tagged_json() {
        let frame = Frame::Presence(PresencePayload {
            user_id: "u1".to_string(),
            display_name: "Ann".to_string(),
            role: BattleRole::Host,
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"presence\""));
        assert!(json.contains("\"userId\":\"u1\""));

        let app = Frame::App(WireEvent::Countdown { start_at: 99 });
        let json = serde_json::to_string(&app).unwrap();
        assert!(json.contains("\"type\":\"app\""));
        assert!(json.contains("\"event\":\"countdown\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            Frame::App(WireEvent::Countdown { start_at: 99 })
        ));
    }

    #[tokio::test]
    async fn leave_winds_down_a_quiet_notification_loop() {
        let transport = RelayTransport::new(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Arc::new(RelayChannel {
            client: transport.client.clone(),
            topic: "battle:QUIET1".to_string(),
            public_key: transport.public_key.clone(),
            signals: tx,
            members: Arc::new(Mutex::new(HashMap::new())),
            own_presence: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            sub_id: Mutex::new(None),
            heartbeat_interval: 50,
            disconnect_threshold: 10_000,
        });
        channel.clone().run_notification_loop();
        channel.clone().run_heartbeat();
        channel.clone().run_staleness_sweep();
        assert!(Arc::strong_count(&channel) > 1);

        // No relay traffic arrives; every background task must still
        // observe the cancel flag and drop its handle.
        channel.leave();
        runtime::sleep(Duration::from_millis(SHUTDOWN_POLL_MS + 300)).await;
        assert_eq!(Arc::strong_count(&channel), 1);
        assert_eq!(
            rx.recv().await,
            Some(ChannelSignal::Status(ChannelStatus::Closed))
        );
    }

    #[test]
    fn transport_generates_keys() {
        let transport = RelayTransport::new(vec!["wss://relay.example".to_string()]);
        assert_eq!(transport.public_key().len(), 64);
        assert!(!transport.is_connected());
    }
}
