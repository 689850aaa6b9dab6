//! Game vocabulary and rule constants shared by server and clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of cells on the Ludo ring.
pub const RING_LEN: u8 = 52;

/// Number of cells in each colour's home stretch.
pub const HOME_STRETCH_LEN: u8 = 6;

/// Pieces per Ludo player.
pub const PIECES_PER_PLAYER: usize = 4;

/// Ring cells on which captures are forbidden. Contains the four entry cells
/// and the four star cells.
pub const SAFE_CELLS: [u8; 8] = [0, 13, 26, 39, 8, 21, 34, 47];

/// Points awarded for capturing an opposing piece.
pub const KILL_POINTS: i64 = 5;

/// Points deducted from the captured player (score floors at zero).
pub const KILLED_PENALTY: i64 = 3;

/// Points awarded when a piece reaches the end of the home stretch.
pub const FINISH_POINTS: i64 = 10;

/// Points awarded for a matched pair in Memory.
pub const MATCH_POINTS: i64 = 10;

/// Seconds a Memory player has for the whole two-card turn.
pub const MEMORY_TURN_SECONDS: u32 = 15;

/// Timeouts a Memory player may burn before elimination.
pub const MEMORY_LIFELINES: u8 = 3;

/// Default Memory deck size in pairs (30-card board).
pub const MEMORY_DEFAULT_PAIRS: usize = 15;

/// Reduced Memory deck size in pairs (22-card board).
pub const MEMORY_SMALL_PAIRS: usize = 11;

/// Fast Ludo global clock for a 2-player room, in seconds.
pub const FAST_LUDO_TIMER_2P_SECS: u32 = 300;

/// Fast Ludo global clock for a 3-4 player room, in seconds.
pub const FAST_LUDO_TIMER_MULTI_SECS: u32 = 600;

/// Snakes & Ladders board size. Reaching exactly this cell wins.
pub const SNAKES_BOARD_CELLS: u16 = 100;

/// Snake mouths and tails: landing on `.0` relocates the piece to `.1`.
pub const SNAKES: [(u16, u16); 8] = [
    (99, 21),
    (95, 75),
    (87, 24),
    (62, 19),
    (54, 34),
    (49, 11),
    (46, 25),
    (17, 7),
];

/// Ladder feet and tops: landing on `.0` relocates the piece to `.1`.
pub const LADDERS: [(u16, u16); 8] = [
    (4, 14),
    (9, 31),
    (20, 38),
    (28, 84),
    (40, 59),
    (51, 67),
    (63, 81),
    (71, 91),
];

/// The prize pool is `entry_fee * max_players * PLATFORM_FEE_NUM / PLATFORM_FEE_DEN`,
/// truncated toward zero; the remaining 10% is the platform fee.
pub const PLATFORM_FEE_NUM: i64 = 9;
pub const PLATFORM_FEE_DEN: i64 = 10;

/// The four supported game types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    ClassicLudo,
    FastLudo,
    Memory,
    SnakesLadders,
}

impl GameType {
    /// Stable string form used in persistence and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::ClassicLudo => "CLASSIC_LUDO",
            GameType::FastLudo => "FAST_LUDO",
            GameType::Memory => "MEMORY",
            GameType::SnakesLadders => "SNAKES_LADDERS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLASSIC_LUDO" => Some(GameType::ClassicLudo),
            "FAST_LUDO" => Some(GameType::FastLudo),
            "MEMORY" => Some(GameType::Memory),
            "SNAKES_LADDERS" => Some(GameType::SnakesLadders),
            _ => None,
        }
    }

    /// Seat counts a room of this game may be created with.
    pub fn valid_player_counts(&self) -> &'static [u8] {
        match self {
            GameType::ClassicLudo | GameType::FastLudo => &[2, 3, 4],
            GameType::Memory => &[2, 3, 4],
            GameType::SnakesLadders => &[2, 3, 4],
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seat colours, assigned cyclically at matchmaking. Only Ludo interprets
/// them mechanically; the other games use them as display hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Blue,
    Green,
    Yellow,
}

impl Color {
    /// Colour for seat position `seat` (0-based), cycling red, blue, green, yellow.
    pub fn for_seat(seat: usize) -> Self {
        match seat % 4 {
            0 => Color::Red,
            1 => Color::Blue,
            2 => Color::Green,
            _ => Color::Yellow,
        }
    }

    /// Ring cell on which this colour's pieces enter the board.
    pub fn entry_cell(&self) -> u8 {
        match self {
            Color::Red => 0,
            Color::Blue => 13,
            Color::Green => 26,
            Color::Yellow => 39,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Red => "red",
            Color::Blue => "blue",
            Color::Green => "green",
            Color::Yellow => "yellow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "red" => Some(Color::Red),
            "blue" => Some(Color::Blue),
            "green" => Some(Color::Green),
            "yellow" => Some(Color::Yellow),
            _ => None,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room lifecycle states. Transitions are monotonic forward:
/// WAITING -> PLAYING -> FINISHED, or WAITING -> CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
    Cancelled,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "WAITING",
            RoomStatus::Playing => "PLAYING",
            RoomStatus::Finished => "FINISHED",
            RoomStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(RoomStatus::Waiting),
            "PLAYING" => Some(RoomStatus::Playing),
            "FINISHED" => Some(RoomStatus::Finished),
            "CANCELLED" => Some(RoomStatus::Cancelled),
            _ => None,
        }
    }
}

/// Ledger entry kinds. Amounts are signed by kind: deposits, winnings,
/// refunds and bonuses are credits; withdrawals and entry fees are debits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Deposit,
    Withdrawal,
    GameEntry,
    GameWinning,
    Refund,
    ReferralBonus,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Deposit => "DEPOSIT",
            LedgerKind::Withdrawal => "WITHDRAWAL",
            LedgerKind::GameEntry => "GAME_ENTRY",
            LedgerKind::GameWinning => "GAME_WINNING",
            LedgerKind::Refund => "REFUND",
            LedgerKind::ReferralBonus => "REFERRAL_BONUS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEPOSIT" => Some(LedgerKind::Deposit),
            "WITHDRAWAL" => Some(LedgerKind::Withdrawal),
            "GAME_ENTRY" => Some(LedgerKind::GameEntry),
            "GAME_WINNING" => Some(LedgerKind::GameWinning),
            "REFUND" => Some(LedgerKind::Refund),
            "REFERRAL_BONUS" => Some(LedgerKind::ReferralBonus),
            _ => None,
        }
    }

    /// True for kinds that increase the balance.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            LedgerKind::Deposit
                | LedgerKind::GameWinning
                | LedgerKind::Refund
                | LedgerKind::ReferralBonus
        )
    }
}

/// Ledger entry status. PENDING may transition to any terminal state;
/// terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "PENDING",
            LedgerStatus::Completed => "COMPLETED",
            LedgerStatus::Failed => "FAILED",
            LedgerStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(LedgerStatus::Pending),
            "COMPLETED" => Some(LedgerStatus::Completed),
            "FAILED" => Some(LedgerStatus::Failed),
            "CANCELLED" => Some(LedgerStatus::Cancelled),
            _ => None,
        }
    }
}

/// A player's seat at a room, as exposed to clients in `matchFound` and
/// state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub user_id: String,
    pub name: String,
    pub seat: u8,
    pub color: Color,
}
