//! Prize settlement.
//!
//! When a room reaches FINISHED with a declared winner, the prize pool (90%
//! of pooled entry fees) is credited exactly once. Two guards stack: an
//! in-process set of settled room ids, and the ledger's uniqueness of
//! `(game_id, GAME_WINNING)` entries, so a FINISHED transition replayed
//! after a restart still cannot double-credit.

use crate::wallet::{WalletError, WalletLedger};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Mutex;

pub struct Settlement {
    wallet: WalletLedger,
    settled: Mutex<HashSet<String>>,
}

impl Settlement {
    pub fn new(wallet: WalletLedger) -> Self {
        Self {
            wallet,
            settled: Mutex::new(HashSet::new()),
        }
    }

    /// Credits `amount` to `winner` for `room_id`. Repeat calls for the same
    /// room are silent no-ops. A zero prize (free room) settles trivially.
    pub async fn settle(
        &self,
        room_id: &str,
        winner: &str,
        amount: i64,
    ) -> Result<(), WalletError> {
        if amount <= 0 {
            return Ok(());
        }
        {
            let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
            if !settled.insert(room_id.to_string()) {
                return Ok(());
            }
        }
        match self.wallet.settle_game_winning(winner, amount, room_id).await {
            Ok(outcome) => {
                info!(
                    "Settled room {}: {} to {} (balance {})",
                    room_id, amount, winner, outcome.new_balance
                );
                Ok(())
            }
            Err(e) => {
                // Allow a retry on the next FINISHED delivery.
                warn!("Settlement for room {} failed: {}", room_id, e);
                let mut settled = self.settled.lock().unwrap_or_else(|er| er.into_inner());
                settled.remove(room_id);
                Err(e)
            }
        }
    }
}
