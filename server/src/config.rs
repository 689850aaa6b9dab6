//! Platform limits and tunables.
//!
//! All monetary values are in the smallest currency unit (two fractional
//! digits), matching the wallet ledger.

use std::time::Duration;

/// Runtime configuration for the platform core. Defaults match production
/// values; tests override individual fields.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Inclusive entry-fee range accepted by matchmaking.
    pub entry_fee_min: i64,
    pub entry_fee_max: i64,

    /// Inclusive deposit range accepted by the wallet.
    pub deposit_min: i64,
    pub deposit_max: i64,

    /// Minimum withdrawal amount.
    pub withdrawal_min: i64,

    /// Matchmaker sweep interval.
    pub matchmaker_tick: Duration,

    /// How long a WAITING room waits for participants before auto-starting.
    pub join_window: Duration,

    /// How long a FINISHED room stays resident to serve late state queries.
    pub finished_grace: Duration,

    /// How long a 2-player PLAYING room tolerates one side being fully
    /// offline before declaring the connected player the winner.
    pub offline_grace: Duration,

    /// Display delay before a revealed Memory pair is resolved.
    pub reveal_delay_ms: u64,

    /// Delay before an automatic turn advance (blocked Ludo roll, Snakes &
    /// Ladders animation window).
    pub auto_advance_ms: u64,

    /// Secret for bearer-token validation.
    pub token_secret: Vec<u8>,

    /// Shared secret for payment-gateway receipt signatures.
    pub gateway_secret: Vec<u8>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            entry_fee_min: 0,
            entry_fee_max: 10_000_00,
            deposit_min: 10_00,
            deposit_max: 50_000_00,
            withdrawal_min: 100_00,
            matchmaker_tick: Duration::from_secs(5),
            join_window: Duration::from_secs(10),
            finished_grace: Duration::from_secs(30),
            offline_grace: Duration::from_secs(30),
            reveal_delay_ms: 700,
            auto_advance_ms: 3000,
            token_secret: b"dev-token-secret".to_vec(),
            gateway_secret: b"dev-gateway-secret".to_vec(),
        }
    }
}

impl PlatformConfig {
    /// True if `fee` is an acceptable room entry fee.
    pub fn entry_fee_valid(&self, fee: i64) -> bool {
        fee >= self.entry_fee_min && fee <= self.entry_fee_max
    }

    /// The wallet's view of the monetary limits.
    pub fn wallet_limits(&self) -> crate::wallet::WalletLimits {
        crate::wallet::WalletLimits {
            deposit_min: self.deposit_min,
            deposit_max: self.deposit_max,
            withdrawal_min: self.withdrawal_min,
        }
    }
}
