//! Wallet ledger: append-only transactions with atomic balance mutation.
//!
//! Every operation runs inside one serializable transaction that writes the
//! ledger row, mutates the balance, and re-checks the ledger/balance sum
//! invariant before committing. Amounts are positive in the public API and
//! signed by kind in the ledger (credits positive, debits negative).
//!
//! Withdrawal requests hold the funds immediately: the balance is debited
//! while the row stays PENDING until the external payout resolves. The sum
//! invariant therefore counts COMPLETED entries plus PENDING withdrawal
//! holds.

use crate::store::{now_rfc3339, Store};
use hmac::{Hmac, Mac};
use log::{error, warn};
use sha2::Sha256;
use shared::types::{LedgerKind, LedgerStatus};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("amount outside allowed limits")]
    LimitExceeded,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("gateway signature mismatch")]
    SignatureInvalid,
    #[error("ledger entry not found")]
    NotFound,
    #[error("ledger entry is not pending")]
    InvalidState,
    #[error("ledger sum diverged from balance for user {0}")]
    LedgerDiverged(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Result of a balance-mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub new_balance: i64,
    pub ledger_id: String,
}

/// Limits applied to deposits and withdrawals.
#[derive(Debug, Clone)]
pub struct WalletLimits {
    pub deposit_min: i64,
    pub deposit_max: i64,
    pub withdrawal_min: i64,
}

/// The authoritative wallet service. Cloneable handle over the shared store.
#[derive(Clone)]
pub struct WalletLedger {
    store: Store,
    gateway_secret: Vec<u8>,
    limits: WalletLimits,
}

impl WalletLedger {
    pub fn new(store: Store, gateway_secret: Vec<u8>, limits: WalletLimits) -> Self {
        Self {
            store,
            gateway_secret,
            limits,
        }
    }

    // ---- core credit/debit ----

    /// Credits `amount` to `user_id` as a COMPLETED entry of `kind`.
    pub async fn credit(
        &self,
        user_id: &str,
        kind: LedgerKind,
        amount: i64,
        memo: &str,
        game_ref: Option<&str>,
    ) -> Result<MutationOutcome, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        let mut tx = self.store.begin().await?;
        let outcome = Self::credit_tx(&mut tx, user_id, kind, amount, memo, game_ref).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Debits `amount` from `user_id` as a COMPLETED entry of `kind`.
    pub async fn debit(
        &self,
        user_id: &str,
        kind: LedgerKind,
        amount: i64,
        memo: &str,
        game_ref: Option<&str>,
    ) -> Result<MutationOutcome, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        let mut tx = self.store.begin().await?;
        let outcome = Self::debit_tx(&mut tx, user_id, kind, amount, memo, game_ref).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Credit inside a caller-owned transaction (used by refunds and the
    /// matchmaker). The caller commits.
    pub async fn credit_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        kind: LedgerKind,
        amount: i64,
        memo: &str,
        game_ref: Option<&str>,
    ) -> Result<MutationOutcome, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        let balance = Self::balance_tx(tx, user_id).await?;
        let new_balance = balance + amount;
        Self::set_balance_tx(tx, user_id, new_balance).await?;
        let ledger_id = Self::insert_entry_tx(
            tx,
            user_id,
            kind,
            amount,
            LedgerStatus::Completed,
            memo,
            game_ref,
            None,
        )
        .await?;
        Self::check_invariant_tx(tx, user_id, new_balance).await?;
        Ok(MutationOutcome {
            new_balance,
            ledger_id,
        })
    }

    /// Debit inside a caller-owned transaction. Fails with
    /// `InsufficientBalance` without writing anything if the balance does
    /// not cover `amount`.
    pub async fn debit_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        kind: LedgerKind,
        amount: i64,
        memo: &str,
        game_ref: Option<&str>,
    ) -> Result<MutationOutcome, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        let balance = Self::balance_tx(tx, user_id).await?;
        if balance < amount {
            return Err(WalletError::InsufficientBalance);
        }
        let new_balance = balance - amount;
        Self::set_balance_tx(tx, user_id, new_balance).await?;
        let ledger_id = Self::insert_entry_tx(
            tx,
            user_id,
            kind,
            -amount,
            LedgerStatus::Completed,
            memo,
            game_ref,
            None,
        )
        .await?;
        Self::check_invariant_tx(tx, user_id, new_balance).await?;
        Ok(MutationOutcome {
            new_balance,
            ledger_id,
        })
    }

    // ---- deposits ----

    /// Creates a PENDING deposit row. No balance change until confirmation.
    pub async fn reserve_deposit(
        &self,
        user_id: &str,
        amount: i64,
    ) -> Result<String, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        if amount < self.limits.deposit_min || amount > self.limits.deposit_max {
            return Err(WalletError::LimitExceeded);
        }
        let mut tx = self.store.begin().await?;
        // Verify the wallet exists before recording intent.
        Self::balance_tx(&mut tx, user_id).await?;
        let ledger_id = Self::insert_entry_tx(
            &mut tx,
            user_id,
            LedgerKind::Deposit,
            amount,
            LedgerStatus::Pending,
            "deposit reserved",
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(ledger_id)
    }

    /// Confirms a pending deposit against the gateway receipt.
    ///
    /// On signature mismatch the row is marked FAILED (a committed effect)
    /// and `SignatureInvalid` is returned. A receipt that was already
    /// consumed, or a row already COMPLETED, is a silent success.
    pub async fn confirm_deposit(
        &self,
        pending_id: &str,
        order_id: &str,
        payment_id: &str,
        signature_hex: &str,
    ) -> Result<i64, WalletError> {
        let mut tx = self.store.begin().await?;
        let row = sqlx::query("SELECT user_id, kind, amount, status FROM ledger WHERE id = ?")
            .bind(pending_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(WalletError::NotFound)?;
        let user_id: String = row.get("user_id");
        let kind: String = row.get("kind");
        let amount: i64 = row.get("amount");
        let status: String = row.get("status");

        if kind != LedgerKind::Deposit.as_str() {
            return Err(WalletError::InvalidState);
        }
        if status == LedgerStatus::Completed.as_str() {
            // Duplicate confirmation: no double effect.
            let balance = Self::balance_tx(&mut tx, &user_id).await?;
            return Ok(balance);
        }
        if status != LedgerStatus::Pending.as_str() {
            return Err(WalletError::InvalidState);
        }

        if !self.receipt_signature_valid(order_id, payment_id, signature_hex) {
            sqlx::query("UPDATE ledger SET status = ? WHERE id = ?")
                .bind(LedgerStatus::Failed.as_str())
                .bind(pending_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            warn!("Deposit {} rejected: gateway signature mismatch", pending_id);
            return Err(WalletError::SignatureInvalid);
        }

        // A receipt already consumed by another entry makes this confirm a
        // duplicate: close the pending row without crediting.
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM ledger WHERE receipt = ?")
                .bind(payment_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            sqlx::query("UPDATE ledger SET status = ? WHERE id = ?")
                .bind(LedgerStatus::Cancelled.as_str())
                .bind(pending_id)
                .execute(&mut *tx)
                .await?;
            let balance = Self::balance_tx(&mut tx, &user_id).await?;
            tx.commit().await?;
            return Ok(balance);
        }

        let balance = Self::balance_tx(&mut tx, &user_id).await?;
        let new_balance = balance + amount;
        Self::set_balance_tx(&mut tx, &user_id, new_balance).await?;
        sqlx::query("UPDATE ledger SET status = ?, receipt = ? WHERE id = ?")
            .bind(LedgerStatus::Completed.as_str())
            .bind(payment_id)
            .bind(pending_id)
            .execute(&mut *tx)
            .await?;
        Self::check_invariant_tx(&mut tx, &user_id, new_balance).await?;
        tx.commit().await?;
        Ok(new_balance)
    }

    // ---- withdrawals ----

    /// Debits the balance now (hold) and records a PENDING withdrawal.
    pub async fn request_withdrawal(
        &self,
        user_id: &str,
        amount: i64,
        bank_details: &str,
    ) -> Result<String, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        if amount < self.limits.withdrawal_min {
            return Err(WalletError::LimitExceeded);
        }
        let mut tx = self.store.begin().await?;
        let balance = Self::balance_tx(&mut tx, user_id).await?;
        if balance < amount {
            return Err(WalletError::InsufficientBalance);
        }
        let new_balance = balance - amount;
        Self::set_balance_tx(&mut tx, user_id, new_balance).await?;
        let ledger_id = Self::insert_entry_tx(
            &mut tx,
            user_id,
            LedgerKind::Withdrawal,
            -amount,
            LedgerStatus::Pending,
            bank_details,
            None,
            None,
        )
        .await?;
        Self::check_invariant_tx(&mut tx, user_id, new_balance).await?;
        tx.commit().await?;
        Ok(ledger_id)
    }

    /// Marks a pending withdrawal COMPLETED after external payout success.
    pub async fn payout_succeeded(&self, pending_id: &str) -> Result<(), WalletError> {
        let mut tx = self.store.begin().await?;
        let (user_id, _amount) =
            Self::take_pending_tx(&mut tx, pending_id, LedgerKind::Withdrawal).await?;
        sqlx::query("UPDATE ledger SET status = ? WHERE id = ?")
            .bind(LedgerStatus::Completed.as_str())
            .bind(pending_id)
            .execute(&mut *tx)
            .await?;
        let balance = Self::balance_tx(&mut tx, &user_id).await?;
        Self::check_invariant_tx(&mut tx, &user_id, balance).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Marks a pending withdrawal FAILED and credits the held amount back,
    /// both inside one transaction.
    pub async fn payout_failed(&self, pending_id: &str) -> Result<MutationOutcome, WalletError> {
        let mut tx = self.store.begin().await?;
        let (user_id, amount) =
            Self::take_pending_tx(&mut tx, pending_id, LedgerKind::Withdrawal).await?;
        sqlx::query("UPDATE ledger SET status = ? WHERE id = ?")
            .bind(LedgerStatus::Failed.as_str())
            .bind(pending_id)
            .execute(&mut *tx)
            .await?;
        let outcome = Self::credit_tx(
            &mut tx,
            &user_id,
            LedgerKind::Refund,
            amount.abs(),
            "withdrawal payout failed",
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Terminal PENDING -> CANCELLED transition with compensating credit for
    /// withdrawal holds. Pending deposits are closed without balance change.
    pub async fn refund(&self, pending_id: &str, reason: &str) -> Result<(), WalletError> {
        let mut tx = self.store.begin().await?;
        let row = sqlx::query("SELECT user_id, kind, amount, status FROM ledger WHERE id = ?")
            .bind(pending_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(WalletError::NotFound)?;
        let user_id: String = row.get("user_id");
        let kind: String = row.get("kind");
        let amount: i64 = row.get("amount");
        let status: String = row.get("status");
        if status != LedgerStatus::Pending.as_str() {
            return Err(WalletError::InvalidState);
        }
        sqlx::query("UPDATE ledger SET status = ?, memo = ? WHERE id = ?")
            .bind(LedgerStatus::Cancelled.as_str())
            .bind(reason)
            .bind(pending_id)
            .execute(&mut *tx)
            .await?;
        if kind == LedgerKind::Withdrawal.as_str() {
            Self::credit_tx(&mut tx, &user_id, LedgerKind::Refund, amount.abs(), reason, None)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- game money movement ----

    /// Credits the room prize to the winner exactly once per room. A second
    /// call for the same room is a silent success.
    pub async fn settle_game_winning(
        &self,
        user_id: &str,
        amount: i64,
        game_id: &str,
    ) -> Result<MutationOutcome, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        let mut tx = self.store.begin().await?;
        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT id, amount FROM ledger
             WHERE game_id = ? AND kind = ? AND status = ?",
        )
        .bind(game_id)
        .bind(LedgerKind::GameWinning.as_str())
        .bind(LedgerStatus::Completed.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((ledger_id, _)) = existing {
            let balance = Self::balance_tx(&mut tx, user_id).await?;
            return Ok(MutationOutcome {
                new_balance: balance,
                ledger_id,
            });
        }
        let outcome = Self::credit_tx(
            &mut tx,
            user_id,
            LedgerKind::GameWinning,
            amount,
            "prize settlement",
            Some(game_id),
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Refunds every COMPLETED entry-fee debit keyed to `game_id`. Used when
    /// a room is cancelled; idempotent per (user, room).
    pub async fn refund_room_entries(&self, game_id: &str) -> Result<usize, WalletError> {
        let mut tx = self.store.begin().await?;
        let debits: Vec<(String, i64)> = sqlx::query_as(
            "SELECT user_id, amount FROM ledger
             WHERE game_id = ? AND kind = ? AND status = ?",
        )
        .bind(game_id)
        .bind(LedgerKind::GameEntry.as_str())
        .bind(LedgerStatus::Completed.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut refunded = 0usize;
        for (user_id, amount) in debits {
            let already: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM ledger
                 WHERE game_id = ? AND user_id = ? AND kind = ? AND status = ?",
            )
            .bind(game_id)
            .bind(&user_id)
            .bind(LedgerKind::Refund.as_str())
            .bind(LedgerStatus::Completed.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            if already.is_some() {
                continue;
            }
            Self::credit_tx(
                &mut tx,
                &user_id,
                LedgerKind::Refund,
                amount.abs(),
                "room cancelled",
                Some(game_id),
            )
            .await?;
            refunded += 1;
        }
        tx.commit().await?;
        Ok(refunded)
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, WalletError> {
        self.store
            .balance(user_id)
            .await?
            .ok_or(WalletError::NotFound)
    }

    // ---- internals ----

    fn receipt_signature_valid(&self, order_id: &str, payment_id: &str, sig_hex: &str) -> bool {
        let Ok(sig) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.gateway_secret) else {
            return false;
        };
        mac.update(format!("{order_id}|{payment_id}").as_bytes());
        mac.verify_slice(&sig).is_ok()
    }

    async fn balance_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
    ) -> Result<i64, WalletError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM wallets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|(b,)| b).ok_or(WalletError::NotFound)
    }

    async fn set_balance_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        balance: i64,
    ) -> Result<(), WalletError> {
        if balance < 0 {
            return Err(WalletError::InsufficientBalance);
        }
        sqlx::query("UPDATE wallets SET balance = ? WHERE user_id = ?")
            .bind(balance)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_entry_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        kind: LedgerKind,
        signed_amount: i64,
        status: LedgerStatus,
        memo: &str,
        game_id: Option<&str>,
        receipt: Option<&str>,
    ) -> Result<String, WalletError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO ledger (id, user_id, kind, amount, status, memo, game_id, receipt, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(kind.as_str())
        .bind(signed_amount)
        .bind(status.as_str())
        .bind(memo)
        .bind(game_id)
        .bind(receipt)
        .bind(now_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Loads a PENDING row of the expected kind, returning (user, amount).
    async fn take_pending_tx(
        tx: &mut Transaction<'_, Sqlite>,
        pending_id: &str,
        expected_kind: LedgerKind,
    ) -> Result<(String, i64), WalletError> {
        let row = sqlx::query("SELECT user_id, kind, amount, status FROM ledger WHERE id = ?")
            .bind(pending_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(WalletError::NotFound)?;
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        if kind != expected_kind.as_str() {
            return Err(WalletError::InvalidState);
        }
        if status != LedgerStatus::Pending.as_str() {
            return Err(WalletError::InvalidState);
        }
        Ok((row.get("user_id"), row.get("amount")))
    }

    /// Fatal-check: the signed sum of COMPLETED entries plus PENDING
    /// withdrawal holds must equal the stored balance.
    async fn check_invariant_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        expected_balance: i64,
    ) -> Result<(), WalletError> {
        let (sum,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM ledger
             WHERE user_id = ?
               AND (status = 'COMPLETED' OR (status = 'PENDING' AND kind = 'WITHDRAWAL'))",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;
        if sum != expected_balance {
            error!(
                "Ledger sum {} diverged from balance {} for user {}",
                sum, expected_balance, user_id
            );
            return Err(WalletError::LedgerDiverged(user_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-gateway-secret";

    fn limits() -> WalletLimits {
        WalletLimits {
            deposit_min: 10_00,
            deposit_max: 50_000_00,
            withdrawal_min: 100_00,
        }
    }

    async fn wallet_with_user(user: &str) -> (Store, WalletLedger) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store
            .ensure_user(user, "Player", &format!("+91{user}"))
            .await
            .unwrap();
        let wallet = WalletLedger::new(store.clone(), SECRET.to_vec(), limits());
        (store, wallet)
    }

    fn sign_receipt(order_id: &str, payment_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET).unwrap();
        mac.update(format!("{order_id}|{payment_id}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn test_credit_then_debit() {
        let (_store, wallet) = wallet_with_user("u1").await;
        let credit = wallet
            .credit("u1", LedgerKind::Deposit, 100_00, "seed", None)
            .await
            .unwrap();
        assert_eq!(credit.new_balance, 100_00);

        let debit = wallet
            .debit("u1", LedgerKind::GameEntry, 50_00, "entry", Some("r1"))
            .await
            .unwrap();
        assert_eq!(debit.new_balance, 50_00);
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let (_store, wallet) = wallet_with_user("u1").await;
        assert!(matches!(
            wallet.credit("u1", LedgerKind::Deposit, 0, "x", None).await,
            Err(WalletError::InvalidAmount)
        ));
        assert!(matches!(
            wallet.debit("u1", LedgerKind::GameEntry, -5, "x", None).await,
            Err(WalletError::InvalidAmount)
        ));
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let (_store, wallet) = wallet_with_user("u1").await;
        let result = wallet
            .debit("u1", LedgerKind::GameEntry, 10_00, "entry", None)
            .await;
        assert!(matches!(result, Err(WalletError::InsufficientBalance)));
        assert_eq!(wallet.balance("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ledger_sum_matches_balance() {
        let (store, wallet) = wallet_with_user("u1").await;
        wallet
            .credit("u1", LedgerKind::Deposit, 500_00, "seed", None)
            .await
            .unwrap();
        wallet
            .debit("u1", LedgerKind::GameEntry, 50_00, "entry", Some("r1"))
            .await
            .unwrap();
        wallet
            .credit("u1", LedgerKind::GameWinning, 90_00, "prize", Some("r1"))
            .await
            .unwrap();

        let entries = store.ledger_for_user("u1").await.unwrap();
        let sum: i64 = entries
            .iter()
            .filter(|e| e.status == "COMPLETED")
            .map(|e| e.amount)
            .sum();
        assert_eq!(sum, wallet.balance("u1").await.unwrap());
        assert_eq!(sum, 540_00);
    }

    #[tokio::test]
    async fn test_deposit_confirm_happy_path() {
        let (_store, wallet) = wallet_with_user("u1").await;
        let pending = wallet.reserve_deposit("u1", 200_00).await.unwrap();
        assert_eq!(wallet.balance("u1").await.unwrap(), 0);

        let sig = sign_receipt("order-1", "pay-1");
        let balance = wallet
            .confirm_deposit(&pending, "order-1", "pay-1", &sig)
            .await
            .unwrap();
        assert_eq!(balance, 200_00);
    }

    #[tokio::test]
    async fn test_deposit_bad_signature_marks_failed() {
        let (store, wallet) = wallet_with_user("u1").await;
        let pending = wallet.reserve_deposit("u1", 200_00).await.unwrap();

        let result = wallet
            .confirm_deposit(&pending, "order-1", "pay-1", "deadbeef")
            .await;
        assert!(matches!(result, Err(WalletError::SignatureInvalid)));
        assert_eq!(wallet.balance("u1").await.unwrap(), 0);

        let row = store.ledger_entry(&pending).await.unwrap().unwrap();
        assert_eq!(row.status, "FAILED");
    }

    #[tokio::test]
    async fn test_deposit_duplicate_receipt_is_silent() {
        let (store, wallet) = wallet_with_user("u1").await;
        let first = wallet.reserve_deposit("u1", 200_00).await.unwrap();
        let second = wallet.reserve_deposit("u1", 200_00).await.unwrap();
        let sig = sign_receipt("order-1", "pay-1");

        wallet
            .confirm_deposit(&first, "order-1", "pay-1", &sig)
            .await
            .unwrap();
        // Same receipt on a different pending row: no double credit.
        let balance = wallet
            .confirm_deposit(&second, "order-1", "pay-1", &sig)
            .await
            .unwrap();
        assert_eq!(balance, 200_00);

        let completed: Vec<_> = store
            .ledger_for_user("u1")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.status == "COMPLETED")
            .collect();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_deposit_confirm_twice_is_silent() {
        let (_store, wallet) = wallet_with_user("u1").await;
        let pending = wallet.reserve_deposit("u1", 200_00).await.unwrap();
        let sig = sign_receipt("o", "p");
        wallet.confirm_deposit(&pending, "o", "p", &sig).await.unwrap();
        let balance = wallet.confirm_deposit(&pending, "o", "p", &sig).await.unwrap();
        assert_eq!(balance, 200_00);
    }

    #[tokio::test]
    async fn test_deposit_limits() {
        let (_store, wallet) = wallet_with_user("u1").await;
        assert!(matches!(
            wallet.reserve_deposit("u1", 5_00).await,
            Err(WalletError::LimitExceeded)
        ));
        assert!(matches!(
            wallet.reserve_deposit("u1", 60_000_00).await,
            Err(WalletError::LimitExceeded)
        ));
    }

    #[tokio::test]
    async fn test_withdrawal_hold_and_success() {
        let (store, wallet) = wallet_with_user("u1").await;
        wallet
            .credit("u1", LedgerKind::Deposit, 500_00, "seed", None)
            .await
            .unwrap();

        let pending = wallet
            .request_withdrawal("u1", 200_00, "bank:xxxx")
            .await
            .unwrap();
        // Held immediately.
        assert_eq!(wallet.balance("u1").await.unwrap(), 300_00);

        wallet.payout_succeeded(&pending).await.unwrap();
        assert_eq!(wallet.balance("u1").await.unwrap(), 300_00);
        let row = store.ledger_entry(&pending).await.unwrap().unwrap();
        assert_eq!(row.status, "COMPLETED");
    }

    #[tokio::test]
    async fn test_withdrawal_failure_refunds() {
        let (store, wallet) = wallet_with_user("u1").await;
        wallet
            .credit("u1", LedgerKind::Deposit, 500_00, "seed", None)
            .await
            .unwrap();
        let pending = wallet
            .request_withdrawal("u1", 200_00, "bank:xxxx")
            .await
            .unwrap();

        let refund = wallet.payout_failed(&pending).await.unwrap();
        assert_eq!(refund.new_balance, 500_00);

        let entries = store.ledger_for_user("u1").await.unwrap();
        assert!(entries.iter().any(|e| e.kind == "REFUND" && e.status == "COMPLETED"));
        assert!(entries.iter().any(|e| e.kind == "WITHDRAWAL" && e.status == "FAILED"));
    }

    #[tokio::test]
    async fn test_withdrawal_minimum() {
        let (_store, wallet) = wallet_with_user("u1").await;
        wallet
            .credit("u1", LedgerKind::Deposit, 500_00, "seed", None)
            .await
            .unwrap();
        assert!(matches!(
            wallet.request_withdrawal("u1", 50_00, "bank").await,
            Err(WalletError::LimitExceeded)
        ));
    }

    #[tokio::test]
    async fn test_refund_cancels_withdrawal_hold() {
        let (store, wallet) = wallet_with_user("u1").await;
        wallet
            .credit("u1", LedgerKind::Deposit, 500_00, "seed", None)
            .await
            .unwrap();
        let pending = wallet
            .request_withdrawal("u1", 150_00, "bank")
            .await
            .unwrap();
        wallet.refund(&pending, "user cancelled").await.unwrap();

        assert_eq!(wallet.balance("u1").await.unwrap(), 500_00);
        let row = store.ledger_entry(&pending).await.unwrap().unwrap();
        assert_eq!(row.status, "CANCELLED");
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let (store, wallet) = wallet_with_user("u1").await;
        let first = wallet.settle_game_winning("u1", 90_00, "r1").await.unwrap();
        let second = wallet.settle_game_winning("u1", 90_00, "r1").await.unwrap();
        assert_eq!(first.ledger_id, second.ledger_id);
        assert_eq!(wallet.balance("u1").await.unwrap(), 90_00);

        let winnings: Vec<_> = store
            .ledger_for_game("r1")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == "GAME_WINNING")
            .collect();
        assert_eq!(winnings.len(), 1);
    }

    #[tokio::test]
    async fn test_refund_room_entries() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let wallet = WalletLedger::new(store.clone(), SECRET.to_vec(), limits());
        for user in ["u1", "u2"] {
            store.ensure_user(user, "P", &format!("+91{user}")).await.unwrap();
            wallet
                .credit(user, LedgerKind::Deposit, 100_00, "seed", None)
                .await
                .unwrap();
            wallet
                .debit(user, LedgerKind::GameEntry, 50_00, "entry", Some("r1"))
                .await
                .unwrap();
        }

        let refunded = wallet.refund_room_entries("r1").await.unwrap();
        assert_eq!(refunded, 2);
        assert_eq!(wallet.balance("u1").await.unwrap(), 100_00);
        assert_eq!(wallet.balance("u2").await.unwrap(), 100_00);

        // Idempotent.
        let again = wallet.refund_room_entries("r1").await.unwrap();
        assert_eq!(again, 0);
    }
}
