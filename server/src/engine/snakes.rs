//! Snakes & Ladders engine.
//!
//! Cells 1..100 with fixed snake and ladder mappings. Players start off the
//! board at 0. A roll that would pass 100 leaves the piece in place; landing
//! exactly on 100 wins. Turns rotate strictly (no extra turn on 6), and each
//! roll opens a 3 s animation window during which further rolls are rejected
//! before the turn advances.

use crate::engine::{EngineEffect, EngineError, GameEngine, PlayerAction, Terminal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{ServerEvent, LADDERS, SNAKES, SNAKES_BOARD_CELLS};
use std::collections::HashMap;

/// Client-side movement animation window after each roll.
const ANIMATION_WINDOW_MS: u64 = 3000;

fn fresh_rng() -> StdRng {
    StdRng::from_entropy()
}

#[derive(Serialize, Deserialize)]
pub struct SnakesEngine {
    players: Vec<String>,
    positions: Vec<u16>,
    current: usize,
    pending_advance: Option<u32>,
    next_token: u32,
    terminal: Option<Terminal>,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

impl SnakesEngine {
    pub fn new(players: Vec<String>) -> Self {
        let n = players.len();
        Self {
            players,
            positions: vec![0; n],
            current: 0,
            pending_advance: None,
            next_token: 1,
            terminal: None,
            rng: fresh_rng(),
        }
    }

    pub fn restore(snapshot: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(snapshot.clone()).map_err(|_| EngineError::CorruptSnapshot)
    }

    fn actor(&self) -> &str {
        &self.players[self.current]
    }

    /// Resolves a landing cell through the snake and ladder maps.
    fn relocate(cell: u16) -> u16 {
        if let Some((_, to)) = SNAKES.iter().find(|(from, _)| *from == cell) {
            return *to;
        }
        if let Some((_, to)) = LADDERS.iter().find(|(from, _)| *from == cell) {
            return *to;
        }
        cell
    }

    fn scores_map(&self) -> HashMap<String, i64> {
        self.players
            .iter()
            .cloned()
            .zip(self.positions.iter().map(|p| *p as i64))
            .collect()
    }

    /// Roll outcome for the current actor; split out so tests can force a
    /// value.
    fn handle_roll(&mut self, seat: usize, value: u8) -> Vec<EngineEffect> {
        let player = self.players[seat].clone();
        let mut effects = vec![EngineEffect::Broadcast(ServerEvent::DiceRolled {
            player_id: player.clone(),
            value,
            movable_pieces: Vec::new(),
        })];

        let from = self.positions[seat];
        let target = from + value as u16;
        if target <= SNAKES_BOARD_CELLS {
            self.positions[seat] = Self::relocate(target);
        }

        if self.positions[seat] == SNAKES_BOARD_CELLS {
            self.terminal = Some(Terminal {
                winner: Some(player.clone()),
                scores: self.scores_map(),
            });
        }

        effects.push(EngineEffect::Broadcast(ServerEvent::PieceMoved {
            player_id: player,
            piece_id: 0,
            board_after: self.view(),
            captured_pieces: Vec::new(),
            extra_turn: false,
        }));

        if self.terminal.is_none() {
            let token = self.next_token;
            self.next_token += 1;
            self.pending_advance = Some(token);
            effects.push(EngineEffect::Defer {
                delay_ms: ANIMATION_WINDOW_MS,
                token,
            });
        }
        effects
    }
}

impl GameEngine for SnakesEngine {
    fn on_start(&mut self) -> Vec<EngineEffect> {
        vec![EngineEffect::Broadcast(ServerEvent::TurnChanged {
            current_player_id: self.actor().to_string(),
        })]
    }

    fn apply(
        &mut self,
        user_id: &str,
        action: PlayerAction,
    ) -> Result<Vec<EngineEffect>, EngineError> {
        if self.terminal.is_some() {
            return Err(EngineError::GameOver);
        }
        if action != PlayerAction::RollDice {
            return Err(EngineError::UnsupportedAction);
        }
        let seat = self
            .players
            .iter()
            .position(|p| p == user_id)
            .ok_or(EngineError::NotAParticipant)?;
        if seat != self.current {
            return Err(EngineError::NotYourTurn);
        }
        if self.pending_advance.is_some() {
            return Err(EngineError::InvalidMove("previous move is animating".into()));
        }
        let value = self.rng.gen_range(1..=6);
        Ok(self.handle_roll(seat, value))
    }

    fn resolve_deferred(&mut self, token: u32) -> Vec<EngineEffect> {
        if self.terminal.is_some() || self.pending_advance != Some(token) {
            return Vec::new();
        }
        self.pending_advance = None;
        self.current = (self.current + 1) % self.players.len();
        vec![EngineEffect::Broadcast(ServerEvent::TurnChanged {
            current_player_id: self.actor().to_string(),
        })]
    }

    fn on_timeout(&mut self) -> Vec<EngineEffect> {
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
        let players: Vec<Value> = self
            .players
            .iter()
            .zip(self.positions.iter())
            .map(|(player, position)| json!({"userId": player, "position": position}))
            .collect();
        json!({
            "game": "SNAKES_LADDERS",
            "players": players,
            "currentPlayerId": self.current_player(),
        })
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
