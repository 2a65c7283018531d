//! Battle coordinator - the two-player match state machine
//!
//! Two independently running quiz engines stay in sync with nothing but a
//! pub/sub channel between them. Each peer is authoritative for its own
//! `me` player; the `opponent` player is a mirror updated exclusively from
//! inbound events. Local mutations are applied first and broadcast
//! fire-and-forget (a lost message shows up as display lag on the other
//! side, never as wrong scores), and every inbound reducer is idempotent so
//! duplicated or reordered messages cannot corrupt state.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::channel::{Channel, ChannelSignal, ChannelStatus, Transport, WireEvent};
use crate::countdown::RepeatingTimer;
use crate::error::{BattleError, Result};
use crate::room;
use crate::runtime::{self, Duration};
use crate::session::{SessionRecord, SessionStore};
use crate::shuffle;
use crate::types::{
    BattleConfig, BattlePhase, BattleRole, BattleState, Player, PresencePayload, RoomConfig,
    RoomParams, User,
};

/// Notifications emitted to the embedding UI and quiz engine.
#[derive(Debug, Clone, PartialEq)]
pub enum BattleEvent {
    /// Room channel connection status changed. Informational only; a failed
    /// channel never aborts the coordinator.
    Connection(ChannelStatus),
    OpponentJoined(Player),
    OpponentLeft,
    /// The guest received (or the host re-received) the room config.
    ConfigReceived(RoomConfig),
    /// Remaining whole seconds until the match starts.
    CountdownTick(u32),
    /// Countdown elapsed; the quiz engine should begin the question loop.
    GameStart,
    OpponentAnswered {
        question_index: usize,
        is_correct: bool,
    },
    OpponentFinished,
    /// Both players finished, or the opponent forfeited mid-game.
    MatchFinished,
}

/// Battle coordinator.
///
/// Owns one room channel at a time, opened through the injected
/// [`Transport`]; tears it down unconditionally on leave and on drop paths
/// that go through [`Battle::leave_battle`].
pub struct Battle {
    inner: Arc<Inner>,
    events_rx: Arc<RwLock<mpsc::UnboundedReceiver<BattleEvent>>>,
}

struct Inner {
    user: User,
    config: BattleConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    state: RwLock<BattleState>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    countdown: RepeatingTimer,
    events_tx: mpsc::UnboundedSender<BattleEvent>,
    restored: AtomicBool,
}

impl Battle {
    /// Creates a coordinator for `user`.
    ///
    /// The transport and session store are injected so tests and embedders
    /// can substitute in-memory implementations.
    pub fn new(
        user: User,
        config: BattleConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                user,
                config,
                transport,
                store,
                state: RwLock::new(BattleState::default()),
                channel: Mutex::new(None),
                countdown: RepeatingTimer::new(),
                events_tx,
                restored: AtomicBool::new(false),
            }),
            events_rx: Arc::new(RwLock::new(events_rx)),
        }
    }

    /// Gets the local user.
    pub fn user(&self) -> &User {
        &self.inner.user
    }

    /// Gets a snapshot of the current battle state.
    pub async fn snapshot(&self) -> BattleState {
        self.inner.state.read().await.clone()
    }

    /// Receives the next event (blocking).
    pub async fn recv(&self) -> Option<BattleEvent> {
        self.events_rx.write().await.recv().await
    }

    /// Receives the next event (non-blocking).
    pub async fn try_recv(&self) -> Option<BattleEvent> {
        self.events_rx.write().await.try_recv().ok()
    }

    /// Per-match key for the quiz engine; changes with every match so the
    /// engine resets its own state.
    pub async fn quiz_key(&self) -> u32 {
        self.inner
            .state
            .read()
            .await
            .config
            .as_ref()
            .map_or(0, |c| c.seed)
    }

    /// Derives this match's question list from `pool`.
    ///
    /// Both peers call this with the same pool and get the same list; the
    /// order is a pure function of the shared seed. Empty until the config
    /// is known (guest before `room_config` arrives).
    pub async fn question_set<T: Clone>(&self, pool: &[T]) -> Vec<T> {
        let state = self.inner.state.read().await;
        match &state.config {
            Some(config) => {
                shuffle::battle_questions(pool, config.seed, self.inner.config.question_count)
            }
            None => Vec::new(),
        }
    }

    // =========================================================================
    // Room lifecycle
    // =========================================================================

    /// Creates a room as host and returns its code.
    ///
    /// Allocates the room code and match seed, opens the room channel, and
    /// persists the rejoin record.
    pub async fn create_room(&self, params: RoomParams) -> String {
        let room_code = room::generate_room_code();
        let config = RoomConfig {
            category: params.category,
            genre: params.genre,
            difficulty: params.difficulty,
            chapter: params.chapter,
            seed: shuffle::generate_seed(),
        };

        {
            let mut state = self.inner.state.write().await;
            *state = BattleState {
                phase: BattlePhase::Lobby,
                role: Some(BattleRole::Host),
                room_code: Some(room_code.clone()),
                config: Some(config.clone()),
                me: Some(Player::new(&self.inner.user)),
                opponent: None,
                countdown_value: None,
            };
        }

        self.inner.store.save(&SessionRecord {
            room_code: room_code.clone(),
            role: BattleRole::Host,
            config: Some(config),
        });

        self.inner.setup_channel(&room_code, BattleRole::Host);
        info!("Created room: {}", room_code);
        room_code
    }

    /// Joins an existing room as guest.
    ///
    /// The code is normalized (trimmed, uppercased) before use. The config
    /// is unknown until the host's `room_config` broadcast arrives.
    pub async fn join_room(&self, code: &str) -> Result<()> {
        let room_code = room::normalize_room_code(code);
        if !room::is_valid_room_code(&room_code) {
            return Err(BattleError::InvalidRoomCode(room_code));
        }

        {
            let mut state = self.inner.state.write().await;
            *state = BattleState {
                phase: BattlePhase::Waiting,
                role: Some(BattleRole::Guest),
                room_code: Some(room_code.clone()),
                config: None,
                me: Some(Player::new(&self.inner.user)),
                opponent: None,
                countdown_value: None,
            };
        }

        self.inner.store.save(&SessionRecord {
            room_code: room_code.clone(),
            role: BattleRole::Guest,
            config: None,
        });

        self.inner.setup_channel(&room_code, BattleRole::Guest);
        info!("Joined room: {}", room_code);
        Ok(())
    }

    /// Re-attaches to a previously persisted room, at most once per
    /// coordinator instance. Returns whether a session was restored.
    ///
    /// Presence and config resync through the normal channel events once
    /// the topic is re-subscribed.
    pub async fn restore(&self) -> bool {
        if self.inner.restored.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(record) = self.inner.store.load() else {
            return false;
        };

        {
            let mut state = self.inner.state.write().await;
            *state = BattleState {
                phase: match record.role {
                    BattleRole::Host => BattlePhase::Lobby,
                    BattleRole::Guest => BattlePhase::Waiting,
                },
                role: Some(record.role),
                room_code: Some(record.room_code.clone()),
                config: record.config.clone(),
                me: Some(Player::new(&self.inner.user)),
                opponent: None,
                countdown_value: None,
            };
        }

        self.inner.setup_channel(&record.room_code, record.role);
        info!("Restored session for room: {}", record.room_code);
        true
    }

    /// Leaves the current room and resets to idle.
    ///
    /// Cancels any pending countdown, releases the channel, and clears the
    /// persisted session. Safe to call from any phase.
    pub async fn leave_battle(&self) {
        self.inner.countdown.stop();
        let channel = self.inner.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.leave();
        }
        self.inner.store.clear();
        *self.inner.state.write().await = BattleState::default();
        info!("Left battle");
    }

    // =========================================================================
    // Match flow
    // =========================================================================

    /// Host-only: broadcasts the config and starts the synchronized
    /// countdown on both peers.
    ///
    /// No-op unless called by the host with a config and a present
    /// opponent. The config is resent here even though the guest usually
    /// already has it; the resend is idempotent and covers a lost first
    /// copy.
    pub async fn set_ready(&self) {
        let config = {
            let state = self.inner.state.read().await;
            if state.role != Some(BattleRole::Host) || state.opponent.is_none() {
                return;
            }
            match state.config.clone() {
                Some(config) => config,
                None => return,
            }
        };

        let Some(channel) = self.inner.current_channel() else {
            return;
        };

        // Absolute start time, not a relative count: each peer derives its
        // remaining seconds from this timestamp, so delivery delay cannot
        // skew the two starts apart.
        let start_at =
            runtime::now_ms() + u64::from(self.inner.config.countdown_seconds) * 1000;

        channel.send(WireEvent::RoomConfig(config));
        channel.send(WireEvent::Countdown { start_at });
        self.inner.begin_countdown(start_at).await;
    }

    /// Called by the quiz engine when it begins the question loop.
    ///
    /// Clears any leftover per-match progress so the engine always starts
    /// from a zeroed player. No-op outside the playing phase.
    pub async fn start(&self) {
        let mut state = self.inner.state.write().await;
        if state.phase != BattlePhase::Playing {
            return;
        }
        if let Some(me) = state.me.as_mut() {
            me.score = 0;
            me.current_question = 0;
            me.finished = false;
            me.answer_times.clear();
        }
    }

    /// Called by the quiz engine whenever a question resolves.
    ///
    /// Updates the local player first (optimistic, regardless of delivery)
    /// and then broadcasts the answer for the opponent's mirror.
    pub async fn report_answer(&self, question_index: usize, is_correct: bool, answer_time: f64) {
        {
            let mut state = self.inner.state.write().await;
            let Some(me) = state.me.as_mut() else {
                return;
            };
            if is_correct {
                me.score += 1;
                me.answer_times.push(answer_time);
            }
            me.current_question = question_index + 1;
        }

        if let Some(channel) = self.inner.current_channel() {
            channel.send(WireEvent::Answer {
                user_id: self.inner.user.id.clone(),
                question_index,
                is_correct,
                answer_time,
            });
        }
    }

    /// Called once by the quiz engine when the question list is exhausted.
    ///
    /// Marks the local player finished and broadcasts the final result. The
    /// phase moves to finished immediately if the opponent already finished,
    /// otherwise when their `battle_finished` arrives.
    pub async fn report_finished(&self) {
        let payload = {
            let mut state = self.inner.state.write().await;
            let Some(me) = state.me.as_mut() else {
                return;
            };
            if me.finished {
                return;
            }
            me.finished = true;
            let payload = WireEvent::BattleFinished {
                user_id: self.inner.user.id.clone(),
                score: me.score,
                answer_times: me.answer_times.clone(),
            };
            if state.opponent.as_ref().is_some_and(|o| o.finished) {
                state.phase = BattlePhase::Finished;
                state.countdown_value = None;
                let _ = self.inner.events_tx.send(BattleEvent::MatchFinished);
            }
            payload
        };

        if let Some(channel) = self.inner.current_channel() {
            channel.send(payload);
        }
    }
}

impl Inner {
    fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.lock().unwrap().clone()
    }

    /// Opens the room channel and spawns its signal loop, releasing any
    /// previous channel first.
    fn setup_channel(self: &Arc<Self>, room_code: &str, role: BattleRole) {
        self.countdown.stop();
        let old = self.channel.lock().unwrap().take();
        if let Some(old) = old {
            old.leave();
        }

        let topic = room::channel_topic(&self.config.topic_prefix, room_code);
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.transport.open(&topic, tx);
        *self.channel.lock().unwrap() = Some(channel.clone());

        let inner = self.clone();
        runtime::spawn(async move {
            inner.run_signal_loop(channel, role, rx).await;
        });
    }

    /// Consumes one channel's signals until it closes.
    async fn run_signal_loop(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        role: BattleRole,
        mut rx: mpsc::UnboundedReceiver<ChannelSignal>,
    ) {
        while let Some(signal) = rx.recv().await {
            match signal {
                ChannelSignal::Status(status) => {
                    if status == ChannelStatus::Subscribed {
                        // Announce ourselves as soon as the subscription is
                        // live so the peer's presence sync can see us.
                        channel.track(PresencePayload {
                            user_id: self.user.id.clone(),
                            display_name: self.user.display_name.clone(),
                            role,
                        });
                    }
                    let closed = status == ChannelStatus::Closed;
                    let _ = self.events_tx.send(BattleEvent::Connection(status));
                    if closed {
                        break;
                    }
                }
                ChannelSignal::PresenceSync(members) => self.on_presence_sync(members).await,
                ChannelSignal::PresenceLeave(members) => self.on_presence_leave(members).await,
                ChannelSignal::Broadcast(event) => self.on_broadcast(event).await,
            }
        }
        debug!(topic = %channel.topic(), "signal loop ended");
    }

    /// Membership sync: the first member other than self becomes the
    /// opponent. Idempotent: repeated syncs showing the same opponent do
    /// not re-fire the transition.
    async fn on_presence_sync(&self, members: Vec<PresencePayload>) {
        let Some(other) = members.iter().find(|p| p.user_id != self.user.id) else {
            return;
        };
        let mut state = self.state.write().await;
        if state
            .opponent
            .as_ref()
            .is_some_and(|o| o.user_id == other.user_id)
        {
            return;
        }
        if !matches!(state.phase, BattlePhase::Lobby | BattlePhase::Waiting) {
            return;
        }
        let opponent = Player::from_presence(other);
        state.opponent = Some(opponent.clone());
        state.phase = BattlePhase::Waiting;
        drop(state);
        let _ = self.events_tx.send(BattleEvent::OpponentJoined(opponent));
    }

    /// A departing opponent forfeits a running match and resets a pending
    /// one; `idle` and `finished` ignore the signal.
    async fn on_presence_leave(&self, members: Vec<PresencePayload>) {
        if !members.iter().any(|p| p.user_id != self.user.id) {
            return;
        }
        let mut state = self.state.write().await;
        match state.phase {
            BattlePhase::Idle | BattlePhase::Finished => {}
            BattlePhase::Playing => {
                state.opponent = None;
                state.phase = BattlePhase::Finished;
                state.countdown_value = None;
                drop(state);
                let _ = self.events_tx.send(BattleEvent::OpponentLeft);
                let _ = self.events_tx.send(BattleEvent::MatchFinished);
            }
            BattlePhase::Lobby | BattlePhase::Waiting | BattlePhase::Countdown => {
                self.countdown.stop();
                state.opponent = None;
                state.phase = BattlePhase::Lobby;
                state.countdown_value = None;
                drop(state);
                let _ = self.events_tx.send(BattleEvent::OpponentLeft);
            }
        }
    }

    async fn on_broadcast(self: &Arc<Self>, event: WireEvent) {
        match event {
            WireEvent::RoomConfig(config) => {
                let mut state = self.state.write().await;
                // A stale config drained from a closing channel must not
                // re-populate a reset state.
                if state.room_code.is_none() {
                    return;
                }
                let changed = state.config.as_ref() != Some(&config);
                state.config = Some(config.clone());
                // Keep the rejoin record seed-complete for the guest.
                if state.role == Some(BattleRole::Guest) {
                    if let Some(room_code) = state.room_code.clone() {
                        self.store.save(&SessionRecord {
                            room_code,
                            role: BattleRole::Guest,
                            config: Some(config.clone()),
                        });
                    }
                }
                drop(state);
                if changed {
                    let _ = self.events_tx.send(BattleEvent::ConfigReceived(config));
                }
            }

            WireEvent::Countdown { start_at } => {
                self.begin_countdown(start_at).await;
            }

            WireEvent::Answer {
                user_id,
                question_index,
                is_correct,
                answer_time,
            } => {
                if user_id == self.user.id {
                    return;
                }
                let mut state = self.state.write().await;
                let Some(opponent) = state.opponent.as_mut() else {
                    return;
                };
                if opponent.user_id != user_id {
                    return;
                }
                // The final report carries the opponent's authoritative
                // totals; a straggling answer delivered after it must not
                // re-mutate the settled tally.
                if opponent.finished {
                    return;
                }
                // Progress only moves forward; a duplicated or reordered
                // answer event is a no-op.
                let next = question_index + 1;
                if next <= opponent.current_question {
                    return;
                }
                opponent.current_question = next;
                if is_correct {
                    opponent.score += 1;
                    opponent.answer_times.push(answer_time);
                }
                drop(state);
                let _ = self.events_tx.send(BattleEvent::OpponentAnswered {
                    question_index,
                    is_correct,
                });
            }

            WireEvent::BattleFinished {
                user_id,
                score,
                answer_times,
            } => {
                if user_id == self.user.id {
                    return;
                }
                let mut state = self.state.write().await;
                let Some(opponent) = state.opponent.as_mut() else {
                    return;
                };
                if opponent.user_id != user_id {
                    return;
                }
                let first_report = !opponent.finished;
                // Final self-reported totals replace the mirrored running
                // tally; each player is authoritative for its own score.
                opponent.score = score;
                opponent.answer_times = answer_times;
                opponent.finished = true;
                let me_finished = state.me.as_ref().is_some_and(|m| m.finished);
                let finish_now = me_finished && state.phase != BattlePhase::Finished;
                if finish_now {
                    state.phase = BattlePhase::Finished;
                    state.countdown_value = None;
                }
                drop(state);
                if first_report {
                    let _ = self.events_tx.send(BattleEvent::OpponentFinished);
                }
                if finish_now {
                    let _ = self.events_tx.send(BattleEvent::MatchFinished);
                }
            }
        }
    }

    /// Starts (or restarts) the countdown toward the shared absolute start
    /// time. Restarting from a duplicate countdown event is harmless: the
    /// remaining time is a function of `start_at` alone.
    async fn begin_countdown(self: &Arc<Self>, start_at: u64) {
        let remaining = remaining_seconds(start_at, runtime::now_ms());
        {
            let mut state = self.state.write().await;
            if !state.phase.is_pre_game() {
                return;
            }
            state.phase = BattlePhase::Countdown;
            state.countdown_value = Some(remaining);
        }
        let _ = self.events_tx.send(BattleEvent::CountdownTick(remaining));

        let inner = self.clone();
        self.countdown.start(
            Duration::from_millis(self.config.tick_interval),
            move || {
                let inner = inner.clone();
                async move { inner.countdown_tick(start_at).await }
            },
        );
    }

    /// One countdown re-computation; returns whether the timer should keep
    /// ticking.
    async fn countdown_tick(&self, start_at: u64) -> bool {
        let remaining = remaining_seconds(start_at, runtime::now_ms());
        let mut state = self.state.write().await;
        if state.phase != BattlePhase::Countdown {
            return false;
        }
        if remaining == 0 {
            state.phase = BattlePhase::Playing;
            state.countdown_value = None;
            drop(state);
            let _ = self.events_tx.send(BattleEvent::GameStart);
            return false;
        }
        if state.countdown_value != Some(remaining) {
            state.countdown_value = Some(remaining);
            drop(state);
            let _ = self.events_tx.send(BattleEvent::CountdownTick(remaining));
        }
        true
    }
}

/// Whole seconds until `start_at`, rounded up; zero once it has passed.
fn remaining_seconds(start_at: u64, now: u64) -> u32 {
    start_at.saturating_sub(now).div_ceil(1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryTransport;
    use crate::session::MemorySessionStore;
    use crate::types::RoomConfig;

    #[tokio::test]
    async fn config_without_an_active_room_is_dropped() {
        // A channel being torn down can still drain a queued config;
        // once the state is reset it must stay reset.
        let battle = Battle::new(
            User::new("guest", "GUEST"),
            BattleConfig::new(),
            Arc::new(MemoryTransport::new()),
            Arc::new(MemorySessionStore::new()),
        );
        let config = RoomConfig {
            category: "general".to_string(),
            genre: None,
            difficulty: None,
            chapter: None,
            seed: 7,
        };
        battle
            .inner
            .on_broadcast(WireEvent::RoomConfig(config))
            .await;

        let state = battle.snapshot().await;
        assert_eq!(state.phase, BattlePhase::Idle);
        assert!(state.config.is_none());
        assert!(battle.try_recv().await.is_none());
    }

    #[test]
    fn remaining_seconds_rounds_up() {
        assert_eq!(remaining_seconds(3000, 0), 3);
        assert_eq!(remaining_seconds(3000, 1), 3);
        assert_eq!(remaining_seconds(3000, 2000), 1);
        assert_eq!(remaining_seconds(3000, 2999), 1);
        assert_eq!(remaining_seconds(3000, 3000), 0);
        assert_eq!(remaining_seconds(3000, 9999), 0);
    }

    #[test]
    fn late_delivery_does_not_change_the_start_moment() {
        // A peer that learns about start_at 1800ms late computes the same
        // zero-crossing as one that learned instantly.
        let start_at = 10_000;
        assert_eq!(remaining_seconds(start_at, 7_000), 3);
        assert_eq!(remaining_seconds(start_at, 8_800), 2);
        assert_eq!(remaining_seconds(start_at, 10_000), 0);
    }
}
