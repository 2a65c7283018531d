//! # quiz-battle
//!
//! Real-time two-player quiz battle coordinator over a pub/sub relay. No
//! game server required.
//!
//! Two browser tabs (or any two processes) run their own quiz engines and
//! stay in sync through a topic-scoped pub/sub channel: one channel per
//! room code, carrying presence plus four typed broadcast events. Question
//! order is never transmitted; both peers derive it from one shared 32-bit
//! seed with a deterministic shuffle.
//!
//! ## Features
//!
//! - **Room lifecycle**: host creates a 6-character room code, guest joins
//! - **Presence**: opponent join/leave detection independent of messages
//! - **Deterministic ordering**: identical question lists from one seed
//! - **Synchronized countdown**: both peers start at one absolute time
//! - **Score mirroring**: live opponent progress, finish reconciliation
//! - **Session restore**: reload re-attaches to the same room
//!
//! ## Example
//!
//! ```rust,ignore
//! use quiz_battle::{Battle, BattleConfig, BattleEvent, RelayTransport, RoomParams, User};
//! use quiz_battle::session::MemorySessionStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(RelayTransport::new(vec![
//!         "wss://relay.damus.io".to_string(),
//!     ]));
//!     transport.connect().await?;
//!
//!     let battle = Battle::new(
//!         User::new("user-1", "Ann"),
//!         BattleConfig::new(),
//!         transport,
//!         Arc::new(MemorySessionStore::new()),
//!     );
//!
//!     let code = battle
//!         .create_room(RoomParams {
//!             category: "general".to_string(),
//!             ..Default::default()
//!         })
//!         .await;
//!     println!("Tell your friend the code: {code}");
//!
//!     while let Some(event) = battle.recv().await {
//!         match event {
//!             BattleEvent::OpponentJoined(player) => {
//!                 println!("{} joined", player.display_name);
//!                 battle.set_ready().await;
//!             }
//!             BattleEvent::GameStart => println!("Go!"),
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod battle;
pub mod channel;
pub mod countdown;
pub mod error;
pub mod relay;
pub mod room;
pub mod runtime;
pub mod session;
pub mod shuffle;
pub mod types;


pub use battle::{Battle, BattleEvent};
pub use channel::{Channel, ChannelSignal, ChannelStatus, MemoryTransport, Transport, WireEvent};
pub use countdown::RepeatingTimer;
pub use error::{BattleError, Result};
pub use relay::RelayTransport;
pub use room::{generate_room_code, normalize_room_code};
pub use session::{MemorySessionStore, SessionRecord, SessionStore};
pub use shuffle::{battle_questions, generate_seed, seeded_shuffle};
pub use types::*;
