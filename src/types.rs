//! Type definitions for quiz-battle

use serde::{Deserialize, Serialize};

/// Default relay endpoints used when the embedder does not supply its own.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Identity of the local player, supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
}

impl User {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Top-level coordinator phase.
///
/// Transition order is `idle -> {lobby, waiting} -> countdown -> playing ->
/// finished`; `idle` is additionally reachable from every phase via
/// [`crate::Battle::leave_battle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattlePhase {
    #[default]
    Idle,
    /// Host created a room and is waiting for a guest.
    Lobby,
    /// Guest joined, or an opponent is present and the host has not readied.
    Waiting,
    Countdown,
    Playing,
    Finished,
}

impl BattlePhase {
    /// True for phases before the match has started.
    pub fn is_pre_game(self) -> bool {
        matches!(self, Self::Lobby | Self::Waiting | Self::Countdown)
    }
}

/// Which side of the match this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattleRole {
    Host,
    Guest,
}

/// Match parameters fixed by the host at room-creation time.
///
/// Immutable once created; the guest receives it over the wire via the
/// `room_config` broadcast and both peers must hold identical values before
/// the countdown starts. The `seed` alone determines question order on both
/// sides (the question list itself is never transmitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    pub seed: u32,
}

/// Parameters the host picks before a room is created.
#[derive(Debug, Clone, Default)]
pub struct RoomParams {
    pub category: String,
    pub genre: Option<String>,
    pub difficulty: Option<String>,
    pub chapter: Option<String>,
}

/// Per-player match progress.
///
/// Ownership rule: the `me` instance is mutated only by local report calls,
/// the `opponent` instance only by inbound broadcast/presence events. Scores
/// and `current_question` only increase, `answer_times` is append-only, and
/// `finished` flips to true exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub user_id: String,
    pub display_name: String,
    pub score: u32,
    pub current_question: usize,
    pub finished: bool,
    pub answer_times: Vec<f64>,
}

impl Player {
    pub fn new(user: &User) -> Self {
        Self {
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            score: 0,
            current_question: 0,
            finished: false,
            answer_times: Vec::new(),
        }
    }

    pub(crate) fn from_presence(presence: &PresencePayload) -> Self {
        Self {
            user_id: presence.user_id.clone(),
            display_name: presence.display_name.clone(),
            score: 0,
            current_question: 0,
            finished: false,
            answer_times: Vec::new(),
        }
    }
}

/// The single source of truth the embedding UI renders from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleState {
    pub phase: BattlePhase,
    pub role: Option<BattleRole>,
    pub room_code: Option<String>,
    pub config: Option<RoomConfig>,
    pub me: Option<Player>,
    pub opponent: Option<Player>,
    pub countdown_value: Option<u32>,
}

/// Presence payload announced on the room channel by each peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub display_name: String,
    pub role: BattleRole,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct BattleConfig {
    /// Relay URLs for the production transport.
    pub relays: Vec<String>,
    /// Channel topic prefix; rooms live under `<prefix>:<CODE>`.
    pub topic_prefix: String,
    /// Countdown length in seconds (default: 3).
    pub countdown_seconds: u32,
    /// Questions per match (default: 10).
    pub question_count: usize,
    /// Countdown re-computation tick in ms (default: 200).
    pub tick_interval: u64,
    /// Heartbeat interval in ms (default: 3000).
    pub heartbeat_interval: u64,
    /// Peer staleness threshold in ms (default: 10000).
    pub disconnect_threshold: u64,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            topic_prefix: "battle".to_string(),
            countdown_seconds: 3,
            question_count: 10,
            tick_interval: 200,
            heartbeat_interval: 3000,
            disconnect_threshold: 10000,
        }
    }
}

impl BattleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn countdown_seconds(mut self, secs: u32) -> Self {
        self.countdown_seconds = secs;
        self
    }

    pub fn question_count(mut self, count: usize) -> Self {
        self.question_count = count;
        self
    }

    pub fn tick_interval(mut self, ms: u64) -> Self {
        self.tick_interval = ms;
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval = ms;
        self
    }

    pub fn disconnect_threshold(mut self, ms: u64) -> Self {
        self.disconnect_threshold = ms;
        self
    }
}
