//! # Shared Platform Library
//!
//! This crate contains the data structures, constants, and wire protocol shared
//! by the game server and its clients. It is the single source of truth for
//! the realtime event vocabulary and the per-game rule constants, ensuring
//! consistency across the distributed platform.
//!
//! ## Core Components
//!
//! ### Game Vocabulary (`types`)
//! Game types, seat colors, room lifecycle states and the numeric rule
//! constants (board geometry, scoring, timers) used by the authoritative
//! engines.
//!
//! ### Wire Protocol (`protocol`)
//! The [`ClientEvent`] and [`ServerEvent`] enums define the complete realtime
//! protocol. Events are serialized as tagged JSON objects of the form
//! `{"event": "...", "data": {...}}`, which keeps the protocol self-describing
//! and lets serde perform payload schema validation during deserialization.
//!
//! ## Design Philosophy
//!
//! All state-bearing decisions are made on the server; clients only render
//! what the server emits. The shared crate therefore carries no game logic,
//! only the vocabulary both sides must agree on.

pub mod protocol;
pub mod types;

pub use protocol::{ClientEvent, ServerEvent};
pub use types::{
    Color, GameType, LedgerKind, LedgerStatus, PlayerInfo, RoomStatus, FAST_LUDO_TIMER_2P_SECS,
    FAST_LUDO_TIMER_MULTI_SECS, FINISH_POINTS, HOME_STRETCH_LEN, KILLED_PENALTY, KILL_POINTS,
    LADDERS, MATCH_POINTS, MEMORY_DEFAULT_PAIRS, MEMORY_LIFELINES, MEMORY_SMALL_PAIRS,
    MEMORY_TURN_SECONDS, PIECES_PER_PLAYER, PLATFORM_FEE_DEN, PLATFORM_FEE_NUM, RING_LEN,
    SAFE_CELLS, SNAKES, SNAKES_BOARD_CELLS,
};
