//! Memory (pairs) engine.
//!
//! A `2 x P` card board with a deterministic seeded shuffle, per-player
//! lifelines burned by turn timeouts, and elimination with roster
//! compaction: eliminated players drop out of the rotation while their
//! matched cards stay on the board.

use crate::engine::{EngineEffect, EngineError, GameEngine, PlayerAction, Terminal};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{ServerEvent, MATCH_POINTS, MEMORY_LIFELINES, MEMORY_TURN_SECONDS};
use std::collections::HashMap;

/// Display delay between the second reveal and pair resolution.
const REVEAL_DELAY_MS: u64 = 700;

/// Default symbol alphabet; a deck of P pairs uses the first P entries.
const SYMBOLS: [&str; 15] = [
    "🍎", "🍌", "🍇", "🍒", "🍋", "🥝", "🍑", "🍍", "🥥", "🍓", "🍉", "🍐", "🥭", "🫐", "🍊",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingPair {
    positions: [u8; 2],
    token: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEngine {
    players: Vec<String>,
    total_pairs: usize,
    deck: Vec<u8>,
    matched: Vec<bool>,
    revealed: Vec<u8>,
    scores: HashMap<String, i64>,
    lifelines: HashMap<String, u8>,
    /// Non-eliminated players in seat order; the turn rotates over this.
    rotation: Vec<String>,
    eliminated: Vec<String>,
    current: usize,
    pairs_matched: usize,
    /// Monotonic mark of each player's latest scoring match, for the
    /// earliest-to-reach-max tie-break.
    score_marks: HashMap<String, u64>,
    score_counter: u64,
    pending: Option<PendingPair>,
    next_token: u32,
    terminal: Option<Terminal>,
}

impl MemoryEngine {
    /// Builds a fresh board of `pairs` pairs, shuffled deterministically
    /// from `seed` with three Fisher-Yates passes.
    pub fn new(players: Vec<String>, pairs: usize, seed: u64) -> Self {
        debug_assert!(pairs <= SYMBOLS.len());
        let mut deck: Vec<u8> = (0..pairs as u8).chain(0..pairs as u8).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..3 {
            deck.shuffle(&mut rng);
        }

        let scores = players.iter().map(|p| (p.clone(), 0)).collect();
        let lifelines = players
            .iter()
            .map(|p| (p.clone(), MEMORY_LIFELINES))
            .collect();
        let cards = deck.len();
        Self {
            rotation: players.clone(),
            players,
            total_pairs: pairs,
            deck,
            matched: vec![false; cards],
            revealed: Vec::new(),
            scores,
            lifelines,
            eliminated: Vec::new(),
            current: 0,
            pairs_matched: 0,
            score_marks: HashMap::new(),
            score_counter: 0,
            pending: None,
            next_token: 1,
            terminal: None,
        }
    }

    pub fn restore(snapshot: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(snapshot.clone()).map_err(|_| EngineError::CorruptSnapshot)
    }

    fn actor(&self) -> &str {
        &self.rotation[self.current]
    }

    fn symbol(&self, position: u8) -> String {
        SYMBOLS[self.deck[position as usize] as usize].to_string()
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.rotation.len();
    }

    /// Removes the current actor from the rotation; the turn lands on the
    /// next surviving player.
    fn eliminate_current(&mut self) -> String {
        let gone = self.rotation.remove(self.current);
        if self.current >= self.rotation.len() {
            self.current = 0;
        }
        self.eliminated.push(gone.clone());
        gone
    }

    fn mark_for(&self, player: &str) -> u64 {
        self.score_marks.get(player).copied().unwrap_or(u64::MAX)
    }

    /// Winner ranking: highest score among surviving players, ties broken by
    /// whoever reached their final score first.
    fn finish(&mut self) {
        let winner = self
            .rotation
            .iter()
            .max_by(|a, b| {
                let (sa, sb) = (self.scores[*a], self.scores[*b]);
                sa.cmp(&sb)
                    .then_with(|| self.mark_for(b).cmp(&self.mark_for(a)))
            })
            .cloned();
        self.terminal = Some(Terminal {
            winner,
            scores: self.scores.clone(),
        });
    }

    fn validate_selection(&self, position: u8) -> Result<(), EngineError> {
        let pos = position as usize;
        if pos >= self.deck.len() {
            return Err(EngineError::InvalidMove("position out of range".into()));
        }
        if self.matched[pos] {
            return Err(EngineError::InvalidMove("card already matched".into()));
        }
        if self.revealed.contains(&position) {
            return Err(EngineError::InvalidMove("card already revealed".into()));
        }
        if self.revealed.len() >= 2 {
            return Err(EngineError::InvalidMove("two cards already revealed".into()));
        }
        Ok(())
    }
}

impl GameEngine for MemoryEngine {
    fn on_start(&mut self) -> Vec<EngineEffect> {
        vec![
            EngineEffect::Broadcast(ServerEvent::TurnChanged {
                current_player_id: self.actor().to_string(),
            }),
            EngineEffect::StartClock {
                seconds: MEMORY_TURN_SECONDS,
            },
        ]
    }

    fn apply(
        &mut self,
        user_id: &str,
        action: PlayerAction,
    ) -> Result<Vec<EngineEffect>, EngineError> {
        if self.terminal.is_some() {
            return Err(EngineError::GameOver);
        }
        let PlayerAction::SelectCard { position } = action else {
            return Err(EngineError::UnsupportedAction);
        };
        if !self.players.iter().any(|p| p == user_id) {
            return Err(EngineError::NotAParticipant);
        }
        if self.pending.is_some() {
            return Err(EngineError::InvalidMove("pair is being resolved".into()));
        }
        if self.actor() != user_id {
            return Err(EngineError::NotYourTurn);
        }
        self.validate_selection(position)?;

        self.revealed.push(position);
        let mut effects = vec![EngineEffect::Broadcast(ServerEvent::CardRevealed {
            position,
            symbol: self.symbol(position),
            by_player_id: user_id.to_string(),
        })];

        if self.revealed.len() == 2 {
            let token = self.next_token;
            self.next_token += 1;
            self.pending = Some(PendingPair {
                positions: [self.revealed[0], self.revealed[1]],
                token,
            });
            effects.push(EngineEffect::StopClock);
            effects.push(EngineEffect::Defer {
                delay_ms: REVEAL_DELAY_MS,
                token,
            });
        }
        Ok(effects)
    }

    fn resolve_deferred(&mut self, token: u32) -> Vec<EngineEffect> {
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        if pending.token != token {
            self.pending = Some(pending);
            return Vec::new();
        }

        let [a, b] = pending.positions;
        let actor = self.actor().to_string();
        self.revealed.clear();
        let mut effects = Vec::new();

        if self.deck[a as usize] == self.deck[b as usize] {
            self.matched[a as usize] = true;
            self.matched[b as usize] = true;
            self.pairs_matched += 1;
            *self.scores.entry(actor.clone()).or_insert(0) += MATCH_POINTS;
            self.score_counter += 1;
            self.score_marks.insert(actor.clone(), self.score_counter);

            effects.push(EngineEffect::Broadcast(ServerEvent::CardsMatched {
                positions: pending.positions,
                by_player_id: actor.clone(),
                scores: self.scores.clone(),
            }));

            if self.pairs_matched == self.total_pairs {
                self.finish();
            } else {
                // Match grants another turn.
                effects.push(EngineEffect::StartClock {
                    seconds: MEMORY_TURN_SECONDS,
                });
            }
        } else {
            self.advance();
            let next = self.actor().to_string();
            effects.push(EngineEffect::Broadcast(ServerEvent::CardsMismatched {
                positions: pending.positions,
                next_player_id: next.clone(),
            }));
            effects.push(EngineEffect::Broadcast(ServerEvent::TurnChanged {
                current_player_id: next,
            }));
            effects.push(EngineEffect::StartClock {
                seconds: MEMORY_TURN_SECONDS,
            });
        }
        effects
    }

    fn on_timeout(&mut self) -> Vec<EngineEffect> {
        if self.terminal.is_some() {
            return Vec::new();
        }
        self.revealed.clear();
        self.pending = None;

        let actor = self.actor().to_string();
        let remaining = {
            let lifelines = self.lifelines.entry(actor.clone()).or_insert(0);
            *lifelines = lifelines.saturating_sub(1);
            *lifelines
        };
        let mut effects = vec![EngineEffect::Broadcast(ServerEvent::LifelineLost {
            player_id: actor.clone(),
            remaining,
        })];

        if remaining == 0 {
            let gone = self.eliminate_current();
            effects.push(EngineEffect::Broadcast(ServerEvent::PlayerEliminated {
                player_id: gone,
            }));
            if self.rotation.len() == 1 {
                self.terminal = Some(Terminal {
                    winner: Some(self.rotation[0].clone()),
                    scores: self.scores.clone(),
                });
                return effects;
            }
        } else {
            self.advance();
        }

        let next = self.actor().to_string();
        effects.push(EngineEffect::Broadcast(ServerEvent::TurnChanged {
            current_player_id: next,
        }));
        effects.push(EngineEffect::StartClock {
            seconds: MEMORY_TURN_SECONDS,
        });
        effects
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
        self.scores.clone()
    }

    fn view(&self) -> Value {
        let board: Vec<Value> = (0..self.deck.len())
            .map(|pos| {
                let face_up = self.matched[pos] || self.revealed.contains(&(pos as u8));
                json!({
                    "matched": self.matched[pos],
                    "symbol": if face_up { Value::from(SYMBOLS[self.deck[pos] as usize]) } else { Value::Null },
                })
            })
            .collect();
        json!({
            "game": "MEMORY",
            "pairs": self.total_pairs,
            "board": board,
            "scores": self.scores,
            "lifelines": self.lifelines,
            "eliminated": self.eliminated,
            "pairsMatched": self.pairs_matched,
            "currentPlayerId": self.current_player(),
        })
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
