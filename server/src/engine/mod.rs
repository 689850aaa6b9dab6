//! Authoritative game engines.
//!
//! Each game is a state machine behind the [`GameEngine`] trait: the room
//! worker feeds it validated player actions, timer expiries and deferred
//! resolutions, and interprets the returned effects (events to broadcast,
//! clocks to start or stop, messages to schedule back onto its own inbox).
//! Engines never touch sockets, wallets or storage; the room worker is the
//! only mutator of engine state.

pub mod ludo;
pub mod memory;
pub mod snakes;

use serde_json::Value;
use shared::{GameType, ServerEvent};
use std::collections::HashMap;
use thiserror::Error;

/// Game-specific inbound actions, already schema-validated by the protocol
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    RollDice,
    MovePiece { piece_id: u8 },
    SelectCard { position: u8 },
}

/// Effects an engine asks its room worker to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEffect {
    /// Broadcast to the whole room audience.
    Broadcast(ServerEvent),
    /// Start (or restart) the room clock.
    StartClock { seconds: u32 },
    /// Stop the room clock.
    StopClock,
    /// Deliver `resolve_deferred(token)` to the engine after the delay.
    Defer { delay_ms: u64, token: u32 },
}

/// Rejections an engine reports for an action; the state is unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("not a participant of this game")]
    NotAParticipant,
    #[error("not your turn")]
    NotYourTurn,
    #[error("action not valid for this game")]
    UnsupportedAction,
    #[error("{0}")]
    InvalidMove(String),
    #[error("game already over")]
    GameOver,
    #[error("corrupt engine snapshot")]
    CorruptSnapshot,
}

/// Terminal outcome reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Terminal {
    /// Winning user id, if the prize is payable.
    pub winner: Option<String>,
    pub scores: HashMap<String, i64>,
}

/// A per-game authoritative state machine.
pub trait GameEngine: Send + Sync {
    /// Effects to run when the room enters PLAYING (first turn, clocks).
    fn on_start(&mut self) -> Vec<EngineEffect>;

    /// Applies a player action. Errors leave the state unchanged.
    fn apply(&mut self, user_id: &str, action: PlayerAction)
        -> Result<Vec<EngineEffect>, EngineError>;

    /// Handles a deferred token previously emitted via [`EngineEffect::Defer`].
    /// Unknown or stale tokens are ignored.
    fn resolve_deferred(&mut self, token: u32) -> Vec<EngineEffect>;

    /// Handles expiry of the room clock.
    fn on_timeout(&mut self) -> Vec<EngineEffect>;

    /// The terminal outcome once the game is over.
    fn is_terminal(&self) -> Option<Terminal>;

    /// User whose turn it is, while the game is live.
    fn current_player(&self) -> Option<String>;

    /// Current scores keyed by user id.
    fn scores(&self) -> HashMap<String, i64>;

    /// Client-facing view of the state (face-down cards stay hidden).
    fn view(&self) -> Value;

    /// Full server-side state for persistence.
    fn snapshot(&self) -> Value;
}

/// Builds a fresh engine for a new room. `players` is in seat order.
pub fn create_engine(
    game_type: GameType,
    room_id: &str,
    players: Vec<String>,
) -> Box<dyn GameEngine> {
    let seed = seed_from_room_id(room_id);
    match game_type {
        GameType::Memory => Box::new(memory::MemoryEngine::new(
            players,
            shared::MEMORY_DEFAULT_PAIRS,
            seed,
        )),
        GameType::ClassicLudo => {
            Box::new(ludo::LudoEngine::new(players, ludo::LudoVariant::Classic))
        }
        GameType::FastLudo => Box::new(ludo::LudoEngine::new(players, ludo::LudoVariant::Fast)),
        GameType::SnakesLadders => Box::new(snakes::SnakesEngine::new(players)),
    }
}

/// Restores an engine from a persisted snapshot.
pub fn restore_engine(
    game_type: GameType,
    snapshot: &Value,
) -> Result<Box<dyn GameEngine>, EngineError> {
    match game_type {
        GameType::Memory => Ok(Box::new(memory::MemoryEngine::restore(snapshot)?)),
        GameType::ClassicLudo | GameType::FastLudo => {
            Ok(Box::new(ludo::LudoEngine::restore(snapshot)?))
        }
        GameType::SnakesLadders => Ok(Box::new(snakes::SnakesEngine::restore(snapshot)?)),
    }
}

/// Derives the deterministic shuffle seed from a room id (FNV-1a over the
/// id bytes). Recovering a room from its id and state deltas reproduces the
/// same deck without re-shuffling.
pub fn seed_from_room_id(room_id: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in room_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
