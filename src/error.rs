//! Error types for quiz-battle

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BattleError {
    #[error("Invalid room code: {0}")]
    InvalidRoomCode(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BattleError>;
