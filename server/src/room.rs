//! Room registry and per-room worker.
//!
//! Every room is a single-writer actor: an unbounded inbox drained by one
//! dedicated task. Inbound player actions, clock ticks, deferred engine
//! resolutions, settlement and cancellation all arrive as messages, so all
//! state transitions for a room are serialised and linearisable. Handlers may
//! block on storage or wallet I/O because the next message is not dequeued
//! until the current one completes.
//!
//! Lifecycle: WAITING -> PLAYING (auto-start after the join window, or as
//! soon as every participant has joined) -> FINISHED (engine terminal, or
//! the last connected player of a 2-player room after the offline grace).
//! WAITING -> CANCELLED refunds every entry fee. A FINISHED room stays
//! resident for a grace period to serve late state queries, then evicts.

use crate::bus::SessionBus;
use crate::clock::{ClockEvent, TurnClock};
use crate::config::PlatformConfig;
use crate::engine::{self, EngineEffect, GameEngine, PlayerAction};
use crate::registry::ConnectionRegistry;
use crate::settlement::Settlement;
use crate::store::{now_rfc3339, Store};
use crate::wallet::WalletLedger;
use log::{error, info, warn};
use shared::{GameType, PlayerInfo, RoomStatus, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::RwLock;

/// Messages drained by a room worker.
#[derive(Debug)]
pub enum RoomMessage {
    /// A participant (re)joins the room audience and wants current state.
    Join { user_id: String },
    /// A validated game action from a participant.
    Action {
        user_id: String,
        action: PlayerAction,
    },
    /// Clock tick or expiry from the room's turn clock.
    Clock(ClockEvent),
    /// A deferred engine resolution came due.
    Deferred { token: u32 },
    /// The join window elapsed.
    AutoStart,
    /// Cancel a WAITING room and refund entries.
    Cancel { reason: String },
    /// A participant went fully offline.
    PlayerOffline { user_id: String },
    /// The offline grace for `user_id` elapsed.
    OfflineCheck { user_id: String },
    /// Drop the room from the registry.
    Evict,
}

impl From<ClockEvent> for RoomMessage {
    fn from(event: ClockEvent) -> Self {
        RoomMessage::Clock(event)
    }
}

/// Everything a room worker needs besides its own state.
#[derive(Clone)]
pub struct RoomDeps {
    pub store: Store,
    pub wallet: WalletLedger,
    pub bus: Arc<SessionBus>,
    pub connections: Arc<ConnectionRegistry>,
    pub settlement: Arc<Settlement>,
    pub config: Arc<PlatformConfig>,
}

/// A freshly matched room handed over by the matchmaker, or a persisted one
/// being rehydrated at boot.
#[derive(Debug, Clone)]
pub struct RoomSpec {
    pub id: String,
    pub game_type: GameType,
    pub max_players: u8,
    pub entry_fee: i64,
    pub prize_pool: i64,
    pub participants: Vec<PlayerInfo>,
}

/// Process-scoped registry of live rooms.
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, UnboundedSender<RoomMessage>>>>,
    deps: RoomDeps,
}

impl RoomRegistry {
    pub fn new(deps: RoomDeps) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            deps,
        }
    }

    /// Spawns the worker for a newly matched room, announces `matchFound` to
    /// every participant and schedules the auto-start.
    pub async fn activate(&self, spec: RoomSpec) {
        let announce = spec.participants.clone();
        let room_id = spec.id.clone();
        let tx = self.spawn_worker(spec, None, RoomStatus::Waiting).await;

        for player in &announce {
            self.deps
                .bus
                .emit_to_user(
                    &player.user_id,
                    ServerEvent::MatchFound {
                        game_id: room_id.clone(),
                        players: announce.clone(),
                        your_player_id: player.user_id.clone(),
                        your_seat: player.seat,
                        your_color: player.color,
                    },
                )
                .await;
        }

        let join_window = self.deps.config.join_window;
        let tx_clone = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(join_window).await;
            let _ = tx_clone.send(RoomMessage::AutoStart);
        });
    }

    /// Rehydrates a persisted room at boot. PLAYING rooms resume from their
    /// engine snapshot; WAITING rooms get a fresh join window.
    pub async fn restore(&self, spec: RoomSpec, status: RoomStatus, engine_state: Option<&str>) {
        let engine = match (status, engine_state) {
            (RoomStatus::Playing, Some(raw)) => match serde_json::from_str(raw)
                .map_err(|_| engine::EngineError::CorruptSnapshot)
                .and_then(|value| engine::restore_engine(spec.game_type, &value))
            {
                Ok(engine) => Some(engine),
                Err(e) => {
                    error!("Room {} snapshot unusable ({}); not restored", spec.id, e);
                    return;
                }
            },
            _ => None,
        };
        let room_id = spec.id.clone();
        let tx = self.spawn_worker(spec, engine, status).await;
        if status == RoomStatus::Waiting {
            let join_window = self.deps.config.join_window;
            tokio::spawn(async move {
                tokio::time::sleep(join_window).await;
                let _ = tx.send(RoomMessage::AutoStart);
            });
        }
        info!("Restored room {} in state {}", room_id, status.as_str());
    }

    /// Enqueues a message for a live room. False if the room is not resident.
    pub async fn send(&self, room_id: &str, message: RoomMessage) -> bool {
        let rooms = self.rooms.read().await;
        match rooms.get(room_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Administrative cancellation of a WAITING room.
    pub async fn cancel_room(&self, room_id: &str, reason: &str) -> bool {
        self.send(
            room_id,
            RoomMessage::Cancel {
                reason: reason.to_string(),
            },
        )
        .await
    }

    pub async fn is_live(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Reloads every WAITING/PLAYING room from persistence.
    pub async fn restore_active_rooms(&self) -> Result<usize, sqlx::Error> {
        let rows = self.deps.store.active_rooms().await?;
        let mut restored = 0usize;
        for row in rows {
            let Some(game_type) = GameType::parse(&row.game_type) else {
                warn!("Room {} has unknown game type {}", row.id, row.game_type);
                continue;
            };
            let Some(status) = RoomStatus::parse(&row.status) else {
                continue;
            };
            let participants = self.deps.store.participants(&row.id).await?;
            let mut players = Vec::with_capacity(participants.len());
            for p in &participants {
                let name = self
                    .deps
                    .store
                    .user(&p.user_id)
                    .await?
                    .map(|u| u.name)
                    .unwrap_or_else(|| p.user_id.clone());
                players.push(PlayerInfo {
                    user_id: p.user_id.clone(),
                    name,
                    seat: p.seat as u8,
                    color: shared::Color::parse(&p.color).unwrap_or(shared::Color::Red),
                });
            }
            let spec = RoomSpec {
                id: row.id.clone(),
                game_type,
                max_players: row.max_players as u8,
                entry_fee: row.entry_fee,
                prize_pool: row.prize_pool,
                participants: players,
            };
            self.restore(spec, status, row.engine_state.as_deref()).await;
            restored += 1;
        }
        Ok(restored)
    }

    async fn spawn_worker(
        &self,
        spec: RoomSpec,
        engine: Option<Box<dyn GameEngine>>,
        status: RoomStatus,
    ) -> UnboundedSender<RoomMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = RoomWorker {
            id: spec.id.clone(),
            game_type: spec.game_type,
            prize_pool: spec.prize_pool,
            participants: spec.participants,
            status,
            engine,
            clock: TurnClock::new(tx.clone()),
            clock_remaining: None,
            joined: HashSet::new(),
            winner: None,
            started_at: None,
            finished_at: None,
            inbox: tx.clone(),
            deps: self.deps.clone(),
        };

        self.rooms
            .write()
            .await
            .insert(spec.id.clone(), tx.clone());

        let rooms = Arc::clone(&self.rooms);
        let room_id = spec.id;
        tokio::spawn(async move {
            if worker.status == RoomStatus::Playing {
                worker.resume_clock().await;
            }
            while let Some(message) = rx.recv().await {
                if worker.handle(message).await {
                    break;
                }
            }
            rooms.write().await.remove(&room_id);
            info!("Room {} evicted", room_id);
        });
        tx
    }
}

struct RoomWorker {
    id: String,
    game_type: GameType,
    prize_pool: i64,
    participants: Vec<PlayerInfo>,
    status: RoomStatus,
    engine: Option<Box<dyn GameEngine>>,
    clock: TurnClock<RoomMessage>,
    clock_remaining: Option<u32>,
    joined: HashSet<String>,
    winner: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    inbox: UnboundedSender<RoomMessage>,
    deps: RoomDeps,
}

impl RoomWorker {
    /// Handles one inbox message; returns true when the worker should stop.
    async fn handle(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join { user_id } => self.on_join(&user_id).await,
            RoomMessage::Action { user_id, action } => self.on_action(&user_id, action).await,
            RoomMessage::Clock(event) => self.on_clock(event).await,
            RoomMessage::Deferred { token } => self.on_deferred(token).await,
            RoomMessage::AutoStart => {
                if self.status == RoomStatus::Waiting {
                    self.start_playing().await;
                }
            }
            RoomMessage::Cancel { reason } => self.on_cancel(&reason).await,
            RoomMessage::PlayerOffline { user_id } => self.on_player_offline(user_id),
            RoomMessage::OfflineCheck { user_id } => self.on_offline_check(&user_id).await,
            RoomMessage::Evict => return true,
        }
        false
    }

    fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    async fn on_join(&mut self, user_id: &str) {
        if !self.is_participant(user_id) {
            self.deps
                .bus
                .emit_to_user(
                    user_id,
                    ServerEvent::Error {
                        message: "you are not a participant of this game".to_string(),
                    },
                )
                .await;
            return;
        }
        self.deps.connections.join_room(user_id, &self.id).await;
        self.joined.insert(user_id.to_string());

        let snapshot = self.state_event();
        self.deps.bus.emit_to_user(user_id, snapshot).await;

        // All seats present: no reason to keep waiting.
        if self.status == RoomStatus::Waiting
            && self
                .participants
                .iter()
                .all(|p| self.joined.contains(&p.user_id))
        {
            self.start_playing().await;
        }
    }

    async fn on_action(&mut self, user_id: &str, action: PlayerAction) {
        if !self.is_participant(user_id) {
            self.emit_error(user_id, "you are not a participant of this game")
                .await;
            return;
        }
        if self.status != RoomStatus::Playing {
            self.emit_error(user_id, "game is not in progress").await;
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            self.emit_error(user_id, "game is not in progress").await;
            return;
        };
        match engine.apply(user_id, action) {
            Ok(effects) => {
                self.run_effects(effects).await;
                self.after_mutation().await;
            }
            Err(e) => {
                self.emit_error(user_id, &e.to_string()).await;
            }
        }
    }

    async fn on_clock(&mut self, event: ClockEvent) {
        match event {
            ClockEvent::Tick {
                generation,
                remaining,
            } => {
                if self.clock.is_current(generation) {
                    self.clock_remaining = Some(remaining);
                    self.deps
                        .bus
                        .emit_to_room(&self.id, ServerEvent::TimerUpdate { remaining })
                        .await;
                }
            }
            ClockEvent::Expired { generation } => {
                if !self.clock.is_current(generation) {
                    return;
                }
                self.clock.cancel();
                self.clock_remaining = None;
                if let Some(engine) = self.engine.as_mut() {
                    let effects = engine.on_timeout();
                    self.run_effects(effects).await;
                    self.after_mutation().await;
                }
            }
        }
    }

    async fn on_deferred(&mut self, token: u32) {
        if self.status != RoomStatus::Playing {
            return;
        }
        if let Some(engine) = self.engine.as_mut() {
            let effects = engine.resolve_deferred(token);
            self.run_effects(effects).await;
            self.after_mutation().await;
        }
    }

    async fn on_cancel(&mut self, reason: &str) {
        if self.status != RoomStatus::Waiting {
            warn!(
                "Ignoring cancel of room {} in state {}",
                self.id,
                self.status.as_str()
            );
            return;
        }
        self.status = RoomStatus::Cancelled;
        self.clock.cancel();

        match self.deps.wallet.refund_room_entries(&self.id).await {
            Ok(count) => info!("Room {} cancelled; {} entries refunded", self.id, count),
            Err(e) => error!("Refund for cancelled room {} failed: {}", self.id, e),
        }
        self.persist().await;

        for player in &self.participants {
            self.deps
                .bus
                .emit_to_user(
                    &player.user_id,
                    ServerEvent::Error {
                        message: format!("match cancelled: {reason}"),
                    },
                )
                .await;
        }
        self.schedule_evict();
    }

    fn on_player_offline(&mut self, user_id: String) {
        if self.status != RoomStatus::Playing {
            return;
        }
        // The turn is never advanced by a disconnect; the player may come
        // back. Only a full offline grace ends a 2-player game.
        let grace = self.deps.config.offline_grace;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = inbox.send(RoomMessage::OfflineCheck { user_id });
        });
    }

    async fn on_offline_check(&mut self, user_id: &str) {
        if self.status != RoomStatus::Playing || self.participants.len() != 2 {
            return;
        }
        if self.deps.connections.is_user_online(user_id).await {
            return;
        }
        let Some(remaining) = self
            .participants
            .iter()
            .find(|p| p.user_id != user_id)
            .map(|p| p.user_id.clone())
        else {
            return;
        };
        if !self.deps.connections.is_user_online(&remaining).await {
            // Both sides gone; keep the room until someone returns or the
            // engine clock decides.
            return;
        }
        info!(
            "Room {}: {} stayed offline past grace; {} wins",
            self.id, user_id, remaining
        );
        let scores = self
            .engine
            .as_ref()
            .map(|e| e.scores())
            .unwrap_or_default();
        self.finish(Some(remaining), scores).await;
    }

    async fn start_playing(&mut self) {
        let players: Vec<String> = self
            .participants
            .iter()
            .map(|p| p.user_id.clone())
            .collect();
        let mut engine = engine::create_engine(self.game_type, &self.id, players);

        self.status = RoomStatus::Playing;
        self.started_at = Some(now_rfc3339());

        self.deps
            .bus
            .emit_to_room(
                &self.id,
                ServerEvent::GameStarted {
                    initial_state: engine.view(),
                },
            )
            .await;

        let effects = engine.on_start();
        self.engine = Some(engine);
        self.run_effects(effects).await;
        self.persist().await;
        info!("Room {} started ({})", self.id, self.game_type);
    }

    /// Restarts the clock for a room rehydrated mid-game. The previous
    /// remaining time is not persisted; the turn gets a fresh clock.
    async fn resume_clock(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            let effects = engine.on_start();
            self.run_effects(effects).await;
        }
    }

    async fn run_effects(&mut self, effects: Vec<EngineEffect>) {
        for effect in effects {
            match effect {
                EngineEffect::Broadcast(event) => {
                    self.deps.bus.emit_to_room(&self.id, event).await;
                }
                EngineEffect::StartClock { seconds } => {
                    self.clock.start(seconds);
                    self.clock_remaining = Some(seconds);
                    self.deps
                        .bus
                        .emit_to_room(
                            &self.id,
                            ServerEvent::TurnTimer {
                                total_seconds: seconds,
                            },
                        )
                        .await;
                }
                EngineEffect::StopClock => {
                    self.clock.cancel();
                    self.clock_remaining = None;
                }
                EngineEffect::Defer { delay_ms, token } => {
                    let inbox = self.inbox.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = inbox.send(RoomMessage::Deferred { token });
                    });
                }
            }
        }
    }

    /// Persist the accepted mutation, then finish if the engine is terminal.
    async fn after_mutation(&mut self) {
        if self.status == RoomStatus::Playing {
            if let Some(terminal) = self.engine.as_ref().and_then(|e| e.is_terminal()) {
                self.finish(terminal.winner, terminal.scores).await;
                return;
            }
        }
        self.persist().await;
    }

    async fn finish(&mut self, winner: Option<String>, scores: HashMap<String, i64>) {
        if self.status != RoomStatus::Playing {
            return;
        }
        self.status = RoomStatus::Finished;
        self.finished_at = Some(now_rfc3339());
        self.winner = winner.clone();
        self.clock.cancel();
        self.clock_remaining = None;

        if let Some(winner_id) = &winner {
            if let Err(e) = self
                .deps
                .settlement
                .settle(&self.id, winner_id, self.prize_pool)
                .await
            {
                error!("Room {} prize settlement failed: {}", self.id, e);
            }
        }

        for player in &self.participants {
            let score = scores.get(&player.user_id).copied().unwrap_or(0);
            if let Err(e) = self
                .deps
                .store
                .set_participant_score(&self.id, &player.user_id, score)
                .await
            {
                error!("Score persist for room {} failed: {}", self.id, e);
            }
        }
        self.persist().await;

        self.deps
            .bus
            .emit_to_room(
                &self.id,
                ServerEvent::GameEnded {
                    winner_id: winner,
                    final_scores: scores,
                    prize_pool: self.prize_pool,
                },
            )
            .await;

        self.schedule_evict();
    }

    fn schedule_evict(&self) {
        let grace = self.deps.config.finished_grace;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = inbox.send(RoomMessage::Evict);
        });
    }

    async fn persist(&self) {
        let engine_state = self
            .engine
            .as_ref()
            .map(|e| e.snapshot().to_string());
        let current_turn = self
            .engine
            .as_ref()
            .and_then(|e| e.current_player())
            .and_then(|user| {
                self.participants
                    .iter()
                    .position(|p| p.user_id == user)
            })
            .unwrap_or(0) as i64;
        if let Err(e) = self
            .deps
            .store
            .save_room_snapshot(
                &self.id,
                self.status.as_str(),
                engine_state.as_deref(),
                current_turn,
                self.winner.as_deref(),
                self.started_at.as_deref(),
                self.finished_at.as_deref(),
            )
            .await
        {
            error!("Snapshot persist for room {} failed: {}", self.id, e);
        }
    }

    fn state_event(&self) -> ServerEvent {
        ServerEvent::GameState {
            game_id: self.id.clone(),
            status: self.status.as_str().to_string(),
            players: self.participants.clone(),
            current_player_id: self.engine.as_ref().and_then(|e| e.current_player()),
            remaining_seconds: self.clock_remaining,
            engine: self
                .engine
                .as_ref()
                .map(|e| e.view())
                .unwrap_or(serde_json::Value::Null),
        }
    }

    async fn emit_error(&self, user_id: &str, message: &str) {
        self.deps
            .bus
            .emit_to_user(
                user_id,
                ServerEvent::Error {
                    message: message.to_string(),
                },
            )
            .await;
    }
}
