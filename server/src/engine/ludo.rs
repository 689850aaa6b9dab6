//! Ludo engine, Classic and Fast variants.
//!
//! The board is a 52-cell ring plus a 6-cell home stretch per colour. Piece
//! positions are tracked as progress along the colour's own path: 0..=50 on
//! the ring (the ring cell is `entry + progress mod 52`), 51..=55 on the
//! home stretch, and exactly 56 finishes the piece. Overshooting 56 is not a
//! legal move.
//!
//! Classic: pieces start at home and need a 6 to enter; captures send the
//! victim home; the first player to finish all four pieces wins; no clock.
//! Fast: all pieces start on the colour's entry cell; captures send the
//! victim back to its own entry cell; a single global clock (300 s for two
//! players, 600 s otherwise) ends the game by score ranking if nobody has
//! finished all four pieces first.

use crate::engine::{EngineEffect, EngineError, GameEngine, PlayerAction, Terminal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::protocol::CapturedPiece;
use shared::{
    Color, ServerEvent, FAST_LUDO_TIMER_2P_SECS, FAST_LUDO_TIMER_MULTI_SECS, FINISH_POINTS,
    KILLED_PENALTY, KILL_POINTS, PIECES_PER_PLAYER, RING_LEN, SAFE_CELLS,
};
use std::collections::HashMap;

/// Delay before the turn auto-advances after a roll with no legal move.
const BLOCKED_ROLL_ADVANCE_MS: u64 = 3000;

/// Progress value at which a piece finishes (51 ring cells + 6 stretch cells,
/// landing exactly on the last one).
const FINAL_PROGRESS: u8 = 56;

/// Highest progress still on the shared ring.
const RING_MAX_PROGRESS: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LudoVariant {
    Classic,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceState {
    Home,
    Active { progress: u8 },
    Finished,
}

fn fresh_rng() -> StdRng {
    StdRng::from_entropy()
}

#[derive(Serialize, Deserialize)]
pub struct LudoEngine {
    variant: LudoVariant,
    players: Vec<String>,
    colors: Vec<Color>,
    pieces: Vec<[PieceState; PIECES_PER_PLAYER]>,
    scores: Vec<i64>,
    captures: Vec<u32>,
    current: usize,
    pending_roll: Option<u8>,
    pending_advance: Option<u32>,
    next_token: u32,
    terminal: Option<Terminal>,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

impl LudoEngine {
    pub fn new(players: Vec<String>, variant: LudoVariant) -> Self {
        let n = players.len();
        let colors: Vec<Color> = (0..n).map(Color::for_seat).collect();
        let start = match variant {
            LudoVariant::Classic => PieceState::Home,
            LudoVariant::Fast => PieceState::Active { progress: 0 },
        };
        Self {
            variant,
            players,
            colors,
            pieces: vec![[start; PIECES_PER_PLAYER]; n],
            scores: vec![0; n],
            captures: vec![0; n],
            current: 0,
            pending_roll: None,
            pending_advance: None,
            next_token: 1,
            terminal: None,
            rng: fresh_rng(),
        }
    }

    pub fn restore(snapshot: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(snapshot.clone()).map_err(|_| EngineError::CorruptSnapshot)
    }

    fn seat_of(&self, user_id: &str) -> Option<usize> {
        self.players.iter().position(|p| p == user_id)
    }

    fn actor(&self) -> &str {
        &self.players[self.current]
    }

    /// Ring cell occupied by a piece of `seat` at ring progress `progress`.
    fn ring_cell(&self, seat: usize, progress: u8) -> u8 {
        (self.colors[seat].entry_cell() + progress) % RING_LEN
    }

    fn piece_movable(&self, state: PieceState, dice: u8) -> bool {
        match state {
            PieceState::Home => dice == 6,
            PieceState::Active { progress } => progress + dice <= FINAL_PROGRESS,
            PieceState::Finished => false,
        }
    }

    fn movable_pieces(&self, seat: usize, dice: u8) -> Vec<u8> {
        (0..PIECES_PER_PLAYER as u8)
            .filter(|piece| self.piece_movable(self.pieces[seat][*piece as usize], dice))
            .collect()
    }

    fn advance_turn(&mut self) -> Vec<EngineEffect> {
        self.current = (self.current + 1) % self.players.len();
        vec![EngineEffect::Broadcast(ServerEvent::TurnChanged {
            current_player_id: self.actor().to_string(),
        })]
    }

    fn scores_map(&self) -> HashMap<String, i64> {
        self.players
            .iter()
            .cloned()
            .zip(self.scores.iter().copied())
            .collect()
    }

    fn finished_count(&self, seat: usize) -> usize {
        self.pieces[seat]
            .iter()
            .filter(|p| matches!(p, PieceState::Finished))
            .count()
    }

    /// Dice roll outcome for the current actor. Split out so tests can force
    /// a value.
    fn handle_roll(&mut self, seat: usize, value: u8) -> Vec<EngineEffect> {
        let movable = self.movable_pieces(seat, value);
        let mut effects = vec![EngineEffect::Broadcast(ServerEvent::DiceRolled {
            player_id: self.players[seat].clone(),
            value,
            movable_pieces: movable.clone(),
        })];

        if movable.is_empty() {
            if self.variant == LudoVariant::Classic && value == 6 {
                // A blocked 6 lets the actor roll again.
                return effects;
            }
            let token = self.next_token;
            self.next_token += 1;
            self.pending_advance = Some(token);
            effects.push(EngineEffect::Defer {
                delay_ms: BLOCKED_ROLL_ADVANCE_MS,
                token,
            });
        } else {
            self.pending_roll = Some(value);
        }
        effects
    }

    /// Applies a validated move of `piece` by `dice` for the current actor.
    fn handle_move(&mut self, seat: usize, piece: usize, dice: u8) -> Vec<EngineEffect> {
        let state = self.pieces[seat][piece];
        let new_state = match state {
            PieceState::Home => PieceState::Active { progress: 0 },
            PieceState::Active { progress } => {
                let target = progress + dice;
                if target == FINAL_PROGRESS {
                    PieceState::Finished
                } else {
                    PieceState::Active { progress: target }
                }
            }
            PieceState::Finished => return Vec::new(),
        };
        self.pieces[seat][piece] = new_state;
        self.pending_roll = None;

        let mut captured = Vec::new();
        if let PieceState::Active { progress } = new_state {
            if progress <= RING_MAX_PROGRESS {
                let cell = self.ring_cell(seat, progress);
                if !SAFE_CELLS.contains(&cell) {
                    captured = self.capture_at(seat, cell);
                }
            }
        }

        if matches!(new_state, PieceState::Finished) {
            self.scores[seat] += FINISH_POINTS;
            if self.finished_count(seat) == PIECES_PER_PLAYER {
                self.terminal = Some(Terminal {
                    winner: Some(self.players[seat].clone()),
                    scores: self.scores_map(),
                });
            }
        }

        let extra_turn = dice == 6 && self.terminal.is_none();
        let mut effects = vec![EngineEffect::Broadcast(ServerEvent::PieceMoved {
            player_id: self.players[seat].clone(),
            piece_id: piece as u8,
            board_after: self.view(),
            captured_pieces: captured,
            extra_turn,
        })];

        if self.terminal.is_some() {
            if self.variant == LudoVariant::Fast {
                effects.push(EngineEffect::StopClock);
            }
        } else if !extra_turn {
            effects.extend(self.advance_turn());
        }
        effects
    }

    /// Captures every opposing piece standing on `cell`. The destination
    /// depends on the variant: home in Classic, the victim's own entry cell
    /// in Fast.
    fn capture_at(&mut self, attacker: usize, cell: u8) -> Vec<CapturedPiece> {
        let mut captured = Vec::new();
        for seat in 0..self.players.len() {
            if seat == attacker {
                continue;
            }
            for piece in 0..PIECES_PER_PLAYER {
                if let PieceState::Active { progress } = self.pieces[seat][piece] {
                    if progress <= RING_MAX_PROGRESS && self.ring_cell(seat, progress) == cell {
                        self.pieces[seat][piece] = match self.variant {
                            LudoVariant::Classic => PieceState::Home,
                            LudoVariant::Fast => PieceState::Active { progress: 0 },
                        };
                        self.scores[attacker] += KILL_POINTS;
                        self.scores[seat] = (self.scores[seat] - KILLED_PENALTY).max(0);
                        self.captures[attacker] += 1;
                        captured.push(CapturedPiece {
                            player_id: self.players[seat].clone(),
                            piece_id: piece as u8,
                        });
                    }
                }
            }
        }
        captured
    }

    /// Score ranking used when the Fast Ludo clock expires: highest score,
    /// then most pieces finished, then most captures, then lowest seat.
    fn rank_by_score(&mut self) {
        let winner = (0..self.players.len())
            .max_by(|&a, &b| {
                self.scores[a]
                    .cmp(&self.scores[b])
                    .then_with(|| self.finished_count(a).cmp(&self.finished_count(b)))
                    .then_with(|| self.captures[a].cmp(&self.captures[b]))
                    .then_with(|| b.cmp(&a))
            })
            .map(|seat| self.players[seat].clone());
        self.terminal = Some(Terminal {
            winner,
            scores: self.scores_map(),
        });
    }
}

impl GameEngine for LudoEngine {
    fn on_start(&mut self) -> Vec<EngineEffect> {
        let mut effects = vec![EngineEffect::Broadcast(ServerEvent::TurnChanged {
            current_player_id: self.actor().to_string(),
        })];
        if self.variant == LudoVariant::Fast {
            let seconds = if self.players.len() == 2 {
                FAST_LUDO_TIMER_2P_SECS
            } else {
                FAST_LUDO_TIMER_MULTI_SECS
            };
            effects.push(EngineEffect::StartClock { seconds });
        }
        effects
    }

    fn apply(
        &mut self,
        user_id: &str,
        action: PlayerAction,
    ) -> Result<Vec<EngineEffect>, EngineError> {
        if self.terminal.is_some() {
            return Err(EngineError::GameOver);
        }
        let seat = self
            .seat_of(user_id)
            .ok_or(EngineError::NotAParticipant)?;
        if seat != self.current {
            return Err(EngineError::NotYourTurn);
        }
        if self.pending_advance.is_some() {
            return Err(EngineError::InvalidMove("turn is advancing".into()));
        }

        match action {
            PlayerAction::RollDice => {
                if self.pending_roll.is_some() {
                    return Err(EngineError::InvalidMove("move a piece first".into()));
                }
                let value = self.rng.gen_range(1..=6);
                Ok(self.handle_roll(seat, value))
            }
            PlayerAction::MovePiece { piece_id } => {
                let dice = self
                    .pending_roll
                    .ok_or_else(|| EngineError::InvalidMove("roll the dice first".into()))?;
                if piece_id as usize >= PIECES_PER_PLAYER {
                    return Err(EngineError::InvalidMove("no such piece".into()));
                }
                if !self.piece_movable(self.pieces[seat][piece_id as usize], dice) {
                    return Err(EngineError::InvalidMove("piece cannot move".into()));
                }
                Ok(self.handle_move(seat, piece_id as usize, dice))
            }
            PlayerAction::SelectCard { .. } => Err(EngineError::UnsupportedAction),
        }
    }

    fn resolve_deferred(&mut self, token: u32) -> Vec<EngineEffect> {
        if self.terminal.is_some() || self.pending_advance != Some(token) {
            return Vec::new();
        }
        self.pending_advance = None;
        self.advance_turn()
    }

    fn on_timeout(&mut self) -> Vec<EngineEffect> {
        // Only Fast Ludo runs a clock; its expiry ends the game.
        if self.terminal.is_some() || self.variant != LudoVariant::Fast {
            return Vec::new();
        }
        self.pending_roll = None;
        self.pending_advance = None;
        self.rank_by_score();
        Vec::new()
    }

    fn is_terminal(&self) -> Option<Terminal> {
        self.terminal.clone()
    }

    fn current_player(&self) -> Option<String> {
        if self.terminal.is_some() {
            None
        } else {
            Some(self.actor().to_string())
        }
    }

    fn scores(&self) -> HashMap<String, i64> {
        self.scores_map()
    }

    fn view(&self) -> Value {
        let players: Vec<Value> = (0..self.players.len())
            .map(|seat| {
                let pieces: Vec<Value> = self.pieces[seat]
                    .iter()
                    .map(|piece| match piece {
                        PieceState::Home => json!({"state": "home"}),
                        PieceState::Active { progress } if *progress <= RING_MAX_PROGRESS => {
                            json!({
                                "state": "board",
                                "cell": self.ring_cell(seat, *progress),
                            })
                        }
                        PieceState::Active { progress } => json!({
                            "state": "homeStretch",
                            "stretchIndex": progress - RING_MAX_PROGRESS - 1,
                        }),
                        PieceState::Finished => json!({"state": "finished"}),
                    })
                    .collect();
                json!({
                    "userId": self.players[seat],
                    "color": self.colors[seat],
                    "pieces": pieces,
                    "score": self.scores[seat],
                    "captures": self.captures[seat],
                })
            })
            .collect();
        json!({
            "game": match self.variant {
                LudoVariant::Classic => "CLASSIC_LUDO",
                LudoVariant::Fast => "FAST_LUDO",
            },
            "players": players,
            "currentPlayerId": self.current_player(),
            "pendingRoll": self.pending_roll,
        })
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
