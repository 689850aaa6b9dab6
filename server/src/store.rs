//! Durable storage for users, wallets, the ledger, rooms, participants and
//! the matchmaking queue.
//!
//! The store is a thin SQLite layer. The pool is capped at a single
//! connection, so statements never interleave and every multi-statement
//! transaction is serializable by construction. Room snapshot writes are
//! last-writer-wins keyed by room id and only ever issued from the room's
//! worker task.

use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use std::str::FromStr;

/// Wall-clock audit timestamp. Monotonic time is used for all gameplay
/// clocks; this is for record-keeping only.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn is_transient(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
}

/// Reads are retried at most once on a transient storage error. Writes are
/// never retried here; the caller surfaces the error and leaves its state
/// unchanged so the client can retry.
async fn read_retry<T, Fut>(make: impl Fn() -> Fut) -> Result<T, sqlx::Error>
where
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match make().await {
        Err(e) if is_transient(&e) => make().await,
        other => other,
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub phone: String,
    pub name: String,
    pub verified: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub amount: i64,
    pub status: String,
    pub memo: Option<String>,
    pub game_id: Option<String>,
    pub receipt: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct RoomRow {
    pub id: String,
    #[sqlx(rename = "type")]
    pub game_type: String,
    pub max_players: i64,
    pub entry_fee: i64,
    pub prize_pool: i64,
    pub status: String,
    pub engine_state: Option<String>,
    pub current_turn: i64,
    pub winner: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ParticipantRow {
    pub room_id: String,
    pub user_id: String,
    pub seat: i64,
    pub color: String,
    pub score: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub id: i64,
    pub user_id: String,
    #[sqlx(rename = "type")]
    pub game_type: String,
    pub max_players: i64,
    pub entry_fee: i64,
    pub enqueued_at: String,
}

/// SQLite-backed store shared by all subsystems.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database at `url` and applies the
    /// schema. Use `sqlite::memory:` for an ephemeral store.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("Store ready at {}", url);
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                phone      TEXT NOT NULL UNIQUE,
                name       TEXT NOT NULL,
                verified   INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY REFERENCES users(id),
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS ledger (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL,
                kind       TEXT NOT NULL,
                amount     INTEGER NOT NULL,
                status     TEXT NOT NULL,
                memo       TEXT,
                game_id    TEXT,
                receipt    TEXT,
                created_at TEXT NOT NULL
            )"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS ledger_receipt_unique
                ON ledger(receipt) WHERE receipt IS NOT NULL"#,
            "CREATE INDEX IF NOT EXISTS ledger_user_idx ON ledger(user_id)",
            "CREATE INDEX IF NOT EXISTS ledger_game_idx ON ledger(game_id)",
            r#"CREATE TABLE IF NOT EXISTS rooms (
                id           TEXT PRIMARY KEY,
                type         TEXT NOT NULL,
                max_players  INTEGER NOT NULL,
                entry_fee    INTEGER NOT NULL,
                prize_pool   INTEGER NOT NULL,
                status       TEXT NOT NULL,
                engine_state TEXT,
                current_turn INTEGER NOT NULL DEFAULT 0,
                winner       TEXT,
                created_at   TEXT NOT NULL,
                started_at   TEXT,
                finished_at  TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS participants (
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                seat    INTEGER NOT NULL,
                color   TEXT NOT NULL,
                score   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (room_id, user_id),
                UNIQUE (room_id, seat)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS queue (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     TEXT NOT NULL UNIQUE,
                type        TEXT NOT NULL,
                max_players INTEGER NOT NULL,
                entry_fee   INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL
            )"#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- users & wallets ----

    /// Creates the user and an empty wallet if they do not exist yet.
    pub async fn ensure_user(&self, id: &str, name: &str, phone: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (id, phone, name, verified, created_at)
             VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(phone)
        .bind(name)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT INTO wallets (user_id, balance) VALUES (?, 0) ON CONFLICT(user_id) DO NOTHING")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn user(&self, id: &str) -> Result<Option<UserRow>, sqlx::Error> {
        read_retry(|| {
            sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
        })
        .await
    }

    pub async fn balance(&self, user_id: &str) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> = read_retry(|| {
            sqlx::query_as("SELECT balance FROM wallets WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(row.map(|(b,)| b))
    }

    // ---- matchmaking queue ----

    /// Enqueues `user_id`, replacing any prior entry (remove-then-insert).
    pub async fn replace_queue_entry(
        &self,
        user_id: &str,
        game_type: &str,
        max_players: u8,
        entry_fee: i64,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO queue (user_id, type, max_players, entry_fee, enqueued_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(game_type)
        .bind(max_players as i64)
        .bind(entry_fee)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Removes a user's queue entry. Returns true if one existed.
    pub async fn delete_queue_entry(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM queue WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All queue entries, oldest first with id tie-break (strict FIFO).
    pub async fn load_queue(&self) -> Result<Vec<QueueRow>, sqlx::Error> {
        read_retry(|| {
            sqlx::query_as::<_, QueueRow>(
                "SELECT * FROM queue ORDER BY enqueued_at ASC, id ASC",
            )
            .fetch_all(&self.pool)
        })
        .await
    }

    pub async fn delete_queue_entry_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---- rooms & participants ----

    pub async fn insert_room_tx(
        tx: &mut Transaction<'_, Sqlite>,
        room: &RoomRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO rooms
                 (id, type, max_players, entry_fee, prize_pool, status,
                  engine_state, current_turn, winner, created_at, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&room.id)
        .bind(&room.game_type)
        .bind(room.max_players)
        .bind(room.entry_fee)
        .bind(room.prize_pool)
        .bind(&room.status)
        .bind(&room.engine_state)
        .bind(room.current_turn)
        .bind(&room.winner)
        .bind(&room.created_at)
        .bind(&room.started_at)
        .bind(&room.finished_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn insert_participant_tx(
        tx: &mut Transaction<'_, Sqlite>,
        participant: &ParticipantRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO participants (room_id, user_id, seat, color, score)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&participant.room_id)
        .bind(&participant.user_id)
        .bind(participant.seat)
        .bind(&participant.color)
        .bind(participant.score)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn room(&self, id: &str) -> Result<Option<RoomRow>, sqlx::Error> {
        read_retry(|| {
            sqlx::query_as::<_, RoomRow>("SELECT * FROM rooms WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
        })
        .await
    }

    pub async fn participants(&self, room_id: &str) -> Result<Vec<ParticipantRow>, sqlx::Error> {
        read_retry(|| {
            sqlx::query_as::<_, ParticipantRow>(
                "SELECT * FROM participants WHERE room_id = ? ORDER BY seat ASC",
            )
            .bind(room_id)
            .fetch_all(&self.pool)
        })
        .await
    }

    /// Rooms that were live when the process last stopped.
    pub async fn active_rooms(&self) -> Result<Vec<RoomRow>, sqlx::Error> {
        sqlx::query_as::<_, RoomRow>(
            "SELECT * FROM rooms WHERE status IN ('WAITING', 'PLAYING') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Persists a room snapshot. Last-writer-wins; only called from the
    /// room's worker.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_room_snapshot(
        &self,
        room_id: &str,
        status: &str,
        engine_state: Option<&str>,
        current_turn: i64,
        winner: Option<&str>,
        started_at: Option<&str>,
        finished_at: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE rooms SET
                 status = ?,
                 engine_state = ?,
                 current_turn = ?,
                 winner = ?,
                 started_at = COALESCE(?, started_at),
                 finished_at = COALESCE(?, finished_at)
             WHERE id = ?",
        )
        .bind(status)
        .bind(engine_state)
        .bind(current_turn)
        .bind(winner)
        .bind(started_at)
        .bind(finished_at)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_participant_score(
        &self,
        room_id: &str,
        user_id: &str,
        score: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE participants SET score = ? WHERE room_id = ? AND user_id = ?")
            .bind(score)
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- ledger reads (writes go through the wallet) ----

    pub async fn ledger_entry(&self, id: &str) -> Result<Option<LedgerRow>, sqlx::Error> {
        sqlx::query_as::<_, LedgerRow>("SELECT * FROM ledger WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn ledger_for_game(&self, game_id: &str) -> Result<Vec<LedgerRow>, sqlx::Error> {
        sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM ledger WHERE game_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerRow>, sqlx::Error> {
        sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM ledger WHERE user_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_user_creates_wallet() {
        let store = memory_store().await;
        store.ensure_user("u1", "Asha", "+911000000001").await.unwrap();
        assert_eq!(store.balance("u1").await.unwrap(), Some(0));
        // Idempotent.
        store.ensure_user("u1", "Asha", "+911000000001").await.unwrap();
        assert!(store.user("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queue_replace_semantics() {
        let store = memory_store().await;
        store.ensure_user("u1", "Asha", "+911000000001").await.unwrap();

        store
            .replace_queue_entry("u1", "MEMORY", 2, 0)
            .await
            .unwrap();
        store
            .replace_queue_entry("u1", "CLASSIC_LUDO", 4, 5000)
            .await
            .unwrap();

        let queue = store.load_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].game_type, "CLASSIC_LUDO");
        assert_eq!(queue[0].max_players, 4);
    }

    #[tokio::test]
    async fn test_queue_fifo_order() {
        let store = memory_store().await;
        for (i, user) in ["u1", "u2", "u3"].iter().enumerate() {
            store
                .ensure_user(user, "P", &format!("+9110000000{i:02}"))
                .await
                .unwrap();
            store
                .replace_queue_entry(user, "MEMORY", 2, 0)
                .await
                .unwrap();
        }
        let queue = store.load_queue().await.unwrap();
        let users: Vec<&str> = queue.iter().map(|q| q.user_id.as_str()).collect();
        assert_eq!(users, vec!["u1", "u2", "u3"]);
    }

    #[tokio::test]
    async fn test_room_snapshot_round_trip() {
        let store = memory_store().await;
        let mut tx = store.begin().await.unwrap();
        let room = RoomRow {
            id: "r1".to_string(),
            game_type: "MEMORY".to_string(),
            max_players: 2,
            entry_fee: 0,
            prize_pool: 0,
            status: "WAITING".to_string(),
            engine_state: None,
            current_turn: 0,
            winner: None,
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
        };
        Store::insert_room_tx(&mut tx, &room).await.unwrap();
        tx.commit().await.unwrap();

        store
            .save_room_snapshot(
                "r1",
                "PLAYING",
                Some(r#"{"pairs":15}"#),
                1,
                None,
                Some(&now_rfc3339()),
                None,
            )
            .await
            .unwrap();

        let loaded = store.room("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, "PLAYING");
        assert_eq!(loaded.current_turn, 1);
        assert!(loaded.engine_state.unwrap().contains("pairs"));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_participant_seat_uniqueness() {
        let store = memory_store().await;
        let mut tx = store.begin().await.unwrap();
        let room = RoomRow {
            id: "r1".to_string(),
            game_type: "MEMORY".to_string(),
            max_players: 2,
            entry_fee: 0,
            prize_pool: 0,
            status: "WAITING".to_string(),
            engine_state: None,
            current_turn: 0,
            winner: None,
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
        };
        Store::insert_room_tx(&mut tx, &room).await.unwrap();
        for (user, seat) in [("u1", 0), ("u2", 1)] {
            Store::insert_participant_tx(
                &mut tx,
                &ParticipantRow {
                    room_id: "r1".to_string(),
                    user_id: user.to_string(),
                    seat,
                    color: "red".to_string(),
                    score: 0,
                },
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        // Duplicate seat must be rejected.
        let mut tx = store.begin().await.unwrap();
        let dup = Store::insert_participant_tx(
            &mut tx,
            &ParticipantRow {
                room_id: "r1".to_string(),
                user_id: "u3".to_string(),
                seat: 1,
                color: "green".to_string(),
                score: 0,
            },
        )
        .await;
        assert!(dup.is_err());
    }
}
