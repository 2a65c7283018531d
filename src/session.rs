//! Session persistence for room re-attachment
//!
//! A page reload loses the coordinator but not the room: the minimal rejoin
//! data is written through a [`SessionStore`] so a fresh coordinator can
//! re-open the same channel topic and let presence/config resync do the
//! rest. What the store maps to is up to the embedder (browser tab storage,
//! a file, or nothing).

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::types::{BattleRole, RoomConfig};

/// The persisted rejoin record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub room_code: String,
    pub role: BattleRole,
    /// `None` for a guest that never received the host's config.
    pub config: Option<RoomConfig>,
}

/// Tab-scoped key/value persistence for one session record.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<SessionRecord>;
    fn save(&self, record: &SessionRecord);
    fn clear(&self);
}

/// In-process store; the default when the embedder provides none, and the
/// store used by tests.
#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<SessionRecord> {
        self.record.lock().unwrap().clone()
    }

    fn save(&self, record: &SessionRecord) {
        *self.record.lock().unwrap() = Some(record.clone());
    }

    fn clear(&self) {
        *self.record.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySessionStore::new();
        assert!(store.load().is_none());

        let record = SessionRecord {
            room_code: "AB2CD3".to_string(),
            role: BattleRole::Guest,
            config: None,
        };
        store.save(&record);
        assert_eq!(store.load(), Some(record));

        store.clear();
        assert!(store.load().is_none());
    }

    #[test]
    fn record_serializes_with_camel_case_keys() {
        let record = SessionRecord {
            room_code: "AB2CD3".to_string(),
            role: BattleRole::Host,
            config: Some(RoomConfig {
                category: "general".to_string(),
                genre: None,
                difficulty: Some("all".to_string()),
                chapter: None,
                seed: 42,
            }),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"roomCode\":\"AB2CD3\""));
        assert!(json.contains("\"role\":\"host\""));
        assert!(json.contains("\"seed\":42"));

        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
