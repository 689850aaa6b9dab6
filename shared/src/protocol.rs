//! Realtime wire protocol between clients and the game server.
//!
//! Every frame on the wire is a JSON object `{"event": <name>, "data": {...}}`.
//! Inbound frames deserialize into [`ClientEvent`]; anything the server pushes
//! is a [`ServerEvent`]. Deserialization doubles as payload schema validation:
//! a frame whose `data` does not match the variant's fields is rejected before
//! it reaches any handler.

use crate::types::{Color, GameType, PlayerInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Events a client may send over an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Enqueue for a match of the given shape. Replaces any prior entry.
    #[serde(rename_all = "camelCase")]
    JoinMatchmaking {
        game_type: GameType,
        max_players: u8,
        entry_fee: i64,
    },

    /// Remove this user's queue entry, if any.
    LeaveMatchmaking,

    /// Subscribe to a room the user is a participant of and receive the
    /// current authoritative state. Also the reconnect path.
    #[serde(rename_all = "camelCase")]
    JoinGameRoom { game_id: String },

    /// Roll the dice (Ludo, Snakes & Ladders).
    #[serde(rename_all = "camelCase")]
    RollDice { game_id: String },

    /// Move the given piece by the last roll (Ludo).
    #[serde(rename_all = "camelCase")]
    MovePiece { game_id: String, piece_id: u8 },

    /// Reveal the card at `position` (Memory).
    #[serde(rename_all = "camelCase")]
    SelectCard { game_id: String, position: u8 },

    /// Ask for the current wallet balance.
    GetWallet,
}

/// Events the server pushes to clients. Delivery is ordered per recipient
/// connection; no cross-connection ordering is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Matchmaking queue acknowledgements: "waiting" after enqueue,
    /// "left" after dequeue.
    #[serde(rename_all = "camelCase")]
    MatchmakingStatus { status: String },

    /// The user's queue entry was dropped (e.g. insufficient balance at
    /// debit time).
    #[serde(rename_all = "camelCase")]
    MatchmakingError { message: String },

    /// A match was formed. Personalised per recipient.
    #[serde(rename_all = "camelCase")]
    MatchFound {
        game_id: String,
        players: Vec<PlayerInfo>,
        your_player_id: String,
        your_seat: u8,
        your_color: Color,
    },

    /// The room transitioned to PLAYING; carries the initial engine view.
    #[serde(rename_all = "camelCase")]
    GameStarted { initial_state: serde_json::Value },

    /// Full authoritative snapshot, sent on (re)join of a room audience.
    #[serde(rename_all = "camelCase")]
    GameState {
        game_id: String,
        status: String,
        players: Vec<PlayerInfo>,
        current_player_id: Option<String>,
        remaining_seconds: Option<u32>,
        engine: serde_json::Value,
    },

    /// The actor changed.
    #[serde(rename_all = "camelCase")]
    TurnChanged { current_player_id: String },

    /// A turn or game clock started.
    #[serde(rename_all = "camelCase")]
    TurnTimer { total_seconds: u32 },

    /// Once-per-second countdown notification.
    #[serde(rename_all = "camelCase")]
    TimerUpdate { remaining: u32 },

    /// Dice outcome plus which pieces may legally move by it.
    #[serde(rename_all = "camelCase")]
    DiceRolled {
        player_id: String,
        value: u8,
        movable_pieces: Vec<u8>,
    },

    /// A piece moved; `board_after` is the engine view after the move.
    #[serde(rename_all = "camelCase")]
    PieceMoved {
        player_id: String,
        piece_id: u8,
        board_after: serde_json::Value,
        captured_pieces: Vec<CapturedPiece>,
        extra_turn: bool,
    },

    /// A Memory card was revealed face-up.
    #[serde(rename_all = "camelCase")]
    CardRevealed {
        position: u8,
        symbol: String,
        by_player_id: String,
    },

    /// The two revealed cards matched.
    #[serde(rename_all = "camelCase")]
    CardsMatched {
        positions: [u8; 2],
        by_player_id: String,
        scores: HashMap<String, i64>,
    },

    /// The two revealed cards did not match; they flip back.
    #[serde(rename_all = "camelCase")]
    CardsMismatched {
        positions: [u8; 2],
        next_player_id: String,
    },

    /// A Memory player lost a lifeline to a turn timeout.
    #[serde(rename_all = "camelCase")]
    LifelineLost { player_id: String, remaining: u8 },

    /// A Memory player ran out of lifelines.
    #[serde(rename_all = "camelCase")]
    PlayerEliminated { player_id: String },

    /// Terminal state reached; winner has been settled.
    #[serde(rename_all = "camelCase")]
    GameEnded {
        winner_id: Option<String>,
        final_scores: HashMap<String, i64>,
        prize_pool: i64,
    },

    /// Current wallet balance in the smallest currency unit.
    #[serde(rename_all = "camelCase")]
    WalletBalance { balance: i64 },

    /// A request was rejected; `message` is short and human-readable.
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// A capture produced by a Ludo move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedPiece {
    pub player_id: String,
    pub piece_id: u8,
}
