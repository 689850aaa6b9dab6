//! Periodic matchmaking sweep.
//!
//! Queue entries are grouped by (game type, seat count, entry fee). Each
//! sweep forms as many full groups as it can, oldest entries first, and for
//! every group runs one serializable transaction that debits the entry fees,
//! creates the room and participant rows, and deletes the matched queue
//! entries. A failed fee debit aborts the transaction, drops only the broke
//! entry and retries with the remaining candidates. The sweep re-runs
//! immediately whenever it produced a match; otherwise it waits for the next
//! tick. Only one sweep ever runs at a time.

use crate::bus::SessionBus;
use crate::config::PlatformConfig;
use crate::room::{RoomDeps, RoomRegistry, RoomSpec};
use crate::store::{now_rfc3339, ParticipantRow, QueueRow, RoomRow, Store};
use crate::wallet::{WalletError, WalletLedger};
use log::{error, info, warn};
use shared::{
    Color, GameType, LedgerKind, PlayerInfo, ServerEvent, PLATFORM_FEE_DEN, PLATFORM_FEE_NUM,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MatchmakingError {
    #[error("entry fee outside allowed range")]
    InvalidEntryFee,
    #[error("unsupported player count")]
    InvalidPlayerCount,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub struct Matchmaker {
    deps: RoomDeps,
    rooms: Arc<RoomRegistry>,
}

impl Matchmaker {
    pub fn new(deps: RoomDeps, rooms: Arc<RoomRegistry>) -> Self {
        Self { deps, rooms }
    }

    fn store(&self) -> &Store {
        &self.deps.store
    }

    fn bus(&self) -> &SessionBus {
        &self.deps.bus
    }

    fn config(&self) -> &PlatformConfig {
        &self.deps.config
    }

    /// Validates and enqueues a matchmaking request. A second enqueue by the
    /// same user replaces the previous entry.
    pub async fn enqueue(
        &self,
        user_id: &str,
        game_type: GameType,
        max_players: u8,
        entry_fee: i64,
    ) -> Result<(), MatchmakingError> {
        if !self.config().entry_fee_valid(entry_fee) {
            return Err(MatchmakingError::InvalidEntryFee);
        }
        if !game_type.valid_player_counts().contains(&max_players) {
            return Err(MatchmakingError::InvalidPlayerCount);
        }
        self.store()
            .replace_queue_entry(user_id, game_type.as_str(), max_players, entry_fee)
            .await?;
        info!(
            "User {} queued for {} ({} players, fee {})",
            user_id, game_type, max_players, entry_fee
        );
        Ok(())
    }

    /// Removes the user's queue entry. Returns true if one existed.
    pub async fn dequeue(&self, user_id: &str) -> Result<bool, MatchmakingError> {
        Ok(self.store().delete_queue_entry(user_id).await?)
    }

    /// Runs the sweep loop forever. Spawn exactly once.
    pub async fn run(self: Arc<Self>) {
        let tick = self.config().matchmaker_tick;
        loop {
            match self.sweep().await {
                Ok(matched) if matched > 0 => {
                    // A productive sweep may have unblocked more groups.
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!("Matchmaker sweep failed: {}", e),
            }
            tokio::time::sleep(tick).await;
        }
    }

    /// One sweep over the queue; returns the number of rooms created.
    pub async fn sweep(&self) -> Result<usize, MatchmakingError> {
        let queue = self.store().load_queue().await?;
        if queue.is_empty() {
            return Ok(0);
        }

        // Group while preserving FIFO order within each group.
        let mut groups: HashMap<(String, i64, i64), Vec<QueueRow>> = HashMap::new();
        for entry in queue {
            groups
                .entry((entry.game_type.clone(), entry.max_players, entry.entry_fee))
                .or_default()
                .push(entry);
        }

        // Largest pending group first.
        let mut ordered: Vec<((String, i64, i64), Vec<QueueRow>)> = groups.into_iter().collect();
        ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut matched = 0usize;
        for ((game_type_raw, max_players, entry_fee), mut entries) in ordered {
            let Some(game_type) = GameType::parse(&game_type_raw) else {
                warn!("Dropping queue entries with unknown game type {}", game_type_raw);
                for entry in &entries {
                    let _ = self.store().delete_queue_entry(&entry.user_id).await;
                }
                continue;
            };
            let seats = max_players as usize;

            while entries.len() >= seats {
                let candidates: Vec<QueueRow> = entries.drain(..seats).collect();
                match self.form_match(game_type, entry_fee, &candidates).await {
                    Ok(spec) => {
                        self.rooms.activate(spec).await;
                        matched += 1;
                    }
                    Err(FormMatchError::InsufficientBalance { user_id }) => {
                        // Drop only the broke entry; everyone else goes back
                        // in front of the remaining candidates.
                        let _ = self.store().delete_queue_entry(&user_id).await;
                        self.bus()
                            .emit_to_user(
                                &user_id,
                                ServerEvent::MatchmakingError {
                                    message: "insufficient balance for entry fee".to_string(),
                                },
                            )
                            .await;
                        warn!("Dropped {} from queue: insufficient balance", user_id);
                        let mut rest: Vec<QueueRow> = candidates
                            .into_iter()
                            .filter(|c| c.user_id != user_id)
                            .collect();
                        rest.extend(entries.drain(..));
                        entries = rest;
                    }
                    Err(FormMatchError::Storage(e)) => {
                        error!("Match formation aborted: {}", e);
                        break;
                    }
                }
            }
        }
        Ok(matched)
    }

    /// Debits every candidate, creates the room and participants, and
    /// removes the queue entries, all in one transaction.
    async fn form_match(
        &self,
        game_type: GameType,
        entry_fee: i64,
        candidates: &[QueueRow],
    ) -> Result<RoomSpec, FormMatchError> {
        let room_id = Uuid::new_v4().to_string();
        let seats = candidates.len();
        let prize_pool = entry_fee * seats as i64 * PLATFORM_FEE_NUM / PLATFORM_FEE_DEN;

        let mut tx = self
            .store()
            .begin()
            .await
            .map_err(|e| FormMatchError::Storage(e.into()))?;

        for candidate in candidates {
            if entry_fee > 0 {
                match WalletLedger::debit_tx(
                    &mut tx,
                    &candidate.user_id,
                    LedgerKind::GameEntry,
                    entry_fee,
                    "match entry fee",
                    Some(&room_id),
                )
                .await
                {
                    Ok(_) => {}
                    Err(WalletError::InsufficientBalance) | Err(WalletError::NotFound) => {
                        return Err(FormMatchError::InsufficientBalance {
                            user_id: candidate.user_id.clone(),
                        });
                    }
                    Err(e) => return Err(FormMatchError::Storage(e)),
                }
            }
        }

        Store::insert_room_tx(
            &mut tx,
            &RoomRow {
                id: room_id.clone(),
                game_type: game_type.as_str().to_string(),
                max_players: seats as i64,
                entry_fee,
                prize_pool,
                status: "WAITING".to_string(),
                engine_state: None,
                current_turn: 0,
                winner: None,
                created_at: now_rfc3339(),
                started_at: None,
                finished_at: None,
            },
        )
        .await
        .map_err(|e| FormMatchError::Storage(e.into()))?;

        for (seat, candidate) in candidates.iter().enumerate() {
            Store::insert_participant_tx(
                &mut tx,
                &ParticipantRow {
                    room_id: room_id.clone(),
                    user_id: candidate.user_id.clone(),
                    seat: seat as i64,
                    color: Color::for_seat(seat).as_str().to_string(),
                    score: 0,
                },
            )
            .await
            .map_err(|e| FormMatchError::Storage(e.into()))?;
            Store::delete_queue_entry_tx(&mut tx, candidate.id)
                .await
                .map_err(|e| FormMatchError::Storage(e.into()))?;
        }

        tx.commit()
            .await
            .map_err(|e| FormMatchError::Storage(e.into()))?;

        // The matchFound emit happens-after the durable room creation.
        let mut participants = Vec::with_capacity(seats);
        for (seat, candidate) in candidates.iter().enumerate() {
            let name = self
                .store()
                .user(&candidate.user_id)
                .await
                .map_err(|e| FormMatchError::Storage(e.into()))?
                .map(|u| u.name)
                .unwrap_or_else(|| candidate.user_id.clone());
            participants.push(PlayerInfo {
                user_id: candidate.user_id.clone(),
                name,
                seat: seat as u8,
                color: Color::for_seat(seat),
            });
        }

        info!(
            "Matched room {} ({}, {} seats, fee {})",
            room_id, game_type, seats, entry_fee
        );
        Ok(RoomSpec {
            id: room_id,
            game_type,
            max_players: seats as u8,
            entry_fee,
            prize_pool,
            participants,
        })
    }
}

enum FormMatchError {
    InsufficientBalance { user_id: String },
    Storage(WalletError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::settlement::Settlement;
    use crate::wallet::WalletLimits;

    async fn setup() -> (RoomDeps, Arc<RoomRegistry>, Matchmaker) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let wallet = WalletLedger::new(
            store.clone(),
            b"secret".to_vec(),
            WalletLimits {
                deposit_min: 10_00,
                deposit_max: 50_000_00,
                withdrawal_min: 100_00,
            },
        );
        let connections = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(SessionBus::new(Arc::clone(&connections)));
        let settlement = Arc::new(Settlement::new(wallet.clone()));
        let deps = RoomDeps {
            store,
            wallet,
            bus,
            connections,
            settlement,
            config: Arc::new(PlatformConfig::default()),
        };
        let rooms = Arc::new(RoomRegistry::new(deps.clone()));
        let matchmaker = Matchmaker::new(deps.clone(), Arc::clone(&rooms));
        (deps, rooms, matchmaker)
    }

    async fn seed_user(deps: &RoomDeps, user: &str, balance: i64) {
        deps.store
            .ensure_user(user, user, &format!("+91-{user}"))
            .await
            .unwrap();
        if balance > 0 {
            deps.wallet
                .credit(user, LedgerKind::Deposit, balance, "seed", None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_free_match_forms_room() {
        let (deps, rooms, matchmaker) = setup().await;
        seed_user(&deps, "u1", 0).await;
        seed_user(&deps, "u2", 0).await;

        matchmaker
            .enqueue("u1", GameType::Memory, 2, 0)
            .await
            .unwrap();
        matchmaker
            .enqueue("u2", GameType::Memory, 2, 0)
            .await
            .unwrap();

        let matched = matchmaker.sweep().await.unwrap();
        assert_eq!(matched, 1);
        assert!(deps.store.load_queue().await.unwrap().is_empty());

        let active = deps.store.active_rooms().await.unwrap();
        assert_eq!(active.len(), 1);
        let room = &active[0];
        assert_eq!(room.game_type, "MEMORY");
        assert_eq!(room.max_players, 2);
        assert_eq!(room.prize_pool, 0);
        assert!(rooms.is_live(&room.id).await);

        let participants = deps.store.participants(&room.id).await.unwrap();
        let seats: Vec<i64> = participants.iter().map(|p| p.seat).collect();
        assert_eq!(seats, vec![0, 1]);
        let colors: Vec<&str> = participants.iter().map(|p| p.color.as_str()).collect();
        assert_eq!(colors, vec!["red", "blue"]);
    }

    #[tokio::test]
    async fn test_fee_match_debits_all() {
        let (deps, _rooms, matchmaker) = setup().await;
        seed_user(&deps, "u1", 100_00).await;
        seed_user(&deps, "u2", 100_00).await;

        matchmaker
            .enqueue("u1", GameType::ClassicLudo, 2, 50_00)
            .await
            .unwrap();
        matchmaker
            .enqueue("u2", GameType::ClassicLudo, 2, 50_00)
            .await
            .unwrap();
        assert_eq!(matchmaker.sweep().await.unwrap(), 1);

        assert_eq!(deps.wallet.balance("u1").await.unwrap(), 50_00);
        assert_eq!(deps.wallet.balance("u2").await.unwrap(), 50_00);

        let room = &deps.store.active_rooms().await.unwrap()[0];
        assert_eq!(room.prize_pool, 90_00);
        let ledger = deps.store.ledger_for_game(&room.id).await.unwrap();
        assert_eq!(
            ledger.iter().filter(|e| e.kind == "GAME_ENTRY").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_broke_user_dropped_others_matched() {
        let (deps, _rooms, matchmaker) = setup().await;
        seed_user(&deps, "u1", 100_00).await;
        seed_user(&deps, "broke", 10_00).await;
        seed_user(&deps, "u3", 100_00).await;

        for user in ["u1", "broke", "u3"] {
            matchmaker
                .enqueue(user, GameType::ClassicLudo, 2, 50_00)
                .await
                .unwrap();
        }
        let matched = matchmaker.sweep().await.unwrap();
        assert_eq!(matched, 1);

        // The broke user is gone; u1 and u3 got the room.
        assert!(deps.store.load_queue().await.unwrap().is_empty());
        assert_eq!(deps.wallet.balance("broke").await.unwrap(), 10_00);
        assert_eq!(deps.wallet.balance("u1").await.unwrap(), 50_00);
        assert_eq!(deps.wallet.balance("u3").await.unwrap(), 50_00);

        let participants = deps
            .store
            .participants(&deps.store.active_rooms().await.unwrap()[0].id)
            .await
            .unwrap();
        let users: Vec<&str> = participants.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(users, vec!["u1", "u3"]);
    }

    #[tokio::test]
    async fn test_no_partial_debits_on_abort() {
        let (deps, _rooms, matchmaker) = setup().await;
        // u1 can pay, u2 cannot; the transaction with both must leave u1
        // untouched.
        seed_user(&deps, "u1", 100_00).await;
        seed_user(&deps, "u2", 0).await;

        matchmaker
            .enqueue("u1", GameType::FastLudo, 2, 50_00)
            .await
            .unwrap();
        matchmaker
            .enqueue("u2", GameType::FastLudo, 2, 50_00)
            .await
            .unwrap();
        let matched = matchmaker.sweep().await.unwrap();
        assert_eq!(matched, 0);
        assert_eq!(deps.wallet.balance("u1").await.unwrap(), 100_00);
        // u1 stays queued for the next tick.
        let queue = deps.store.load_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_fifo_leaves_newest_waiting() {
        let (deps, _rooms, matchmaker) = setup().await;
        for user in ["u1", "u2", "u3"] {
            seed_user(&deps, user, 0).await;
            matchmaker
                .enqueue(user, GameType::SnakesLadders, 2, 0)
                .await
                .unwrap();
        }
        assert_eq!(matchmaker.sweep().await.unwrap(), 1);

        let queue = deps.store.load_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].user_id, "u3", "oldest two were matched first");
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let (deps, _rooms, matchmaker) = setup().await;
        seed_user(&deps, "u1", 0).await;
        assert!(matches!(
            matchmaker
                .enqueue("u1", GameType::Memory, 2, 99_999_99)
                .await,
            Err(MatchmakingError::InvalidEntryFee)
        ));
        assert!(matches!(
            matchmaker.enqueue("u1", GameType::Memory, 7, 0).await,
            Err(MatchmakingError::InvalidPlayerCount)
        ));
    }

    #[tokio::test]
    async fn test_dequeue() {
        let (deps, _rooms, matchmaker) = setup().await;
        seed_user(&deps, "u1", 0).await;
        matchmaker
            .enqueue("u1", GameType::Memory, 2, 0)
            .await
            .unwrap();
        assert!(matchmaker.dequeue("u1").await.unwrap());
        assert!(!matchmaker.dequeue("u1").await.unwrap());
        assert!(deps.store.load_queue().await.unwrap().is_empty());
    }
}
