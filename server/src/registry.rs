//! Connection registry: who is connected, from which sockets, in which rooms.
//!
//! This module tracks the {connection <-> user <-> room} mapping under churn.
//! One user may hold several concurrent connections (multi-device); a user is
//! offline only when their last socket detaches, and that detach implicitly
//! leaves every room audience. All four indexes live behind a single
//! reader/writer lock so every operation observes a consistent view.

use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Server-assigned connection identifier.
pub type ConnectionId = u64;

/// Outcome of a detach, used by the session layer to notify room workers
/// when a user went fully offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachOutcome {
    pub user_id: String,
    /// True if this was the user's last connection.
    pub went_offline: bool,
    /// Rooms the user was implicitly removed from (empty unless offline).
    pub rooms_left: Vec<String>,
}

#[derive(Default)]
struct Indexes {
    user_of_conn: HashMap<ConnectionId, String>,
    conns_of_user: HashMap<String, HashSet<ConnectionId>>,
    rooms_of_user: HashMap<String, HashSet<String>>,
    users_in_room: HashMap<String, HashSet<String>>,
}

/// Process-scoped registry of live connections and room audiences.
pub struct ConnectionRegistry {
    next_conn_id: AtomicU64,
    indexes: RwLock<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_conn_id: AtomicU64::new(1),
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Registers an authenticated connection and returns its id.
    pub async fn attach(&self, user_id: &str) -> ConnectionId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut idx = self.indexes.write().await;
        idx.user_of_conn.insert(conn_id, user_id.to_string());
        idx.conns_of_user
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);
        info!("Connection {} attached for user {}", conn_id, user_id);
        conn_id
    }

    /// Removes a connection. If it was the user's last one, the user leaves
    /// every room audience and the outcome lists those rooms.
    pub async fn detach(&self, conn_id: ConnectionId) -> Option<DetachOutcome> {
        let mut idx = self.indexes.write().await;
        let user_id = idx.user_of_conn.remove(&conn_id)?;

        let went_offline = match idx.conns_of_user.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    idx.conns_of_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        let rooms_left = if went_offline {
            Self::leave_all_rooms_locked(&mut idx, &user_id)
        } else {
            Vec::new()
        };

        info!(
            "Connection {} detached for user {} (offline: {})",
            conn_id, user_id, went_offline
        );
        Some(DetachOutcome {
            user_id,
            went_offline,
            rooms_left,
        })
    }

    pub async fn sockets_of_user(&self, user_id: &str) -> HashSet<ConnectionId> {
        let idx = self.indexes.read().await;
        idx.conns_of_user.get(user_id).cloned().unwrap_or_default()
    }

    pub async fn user_of_socket(&self, conn_id: ConnectionId) -> Option<String> {
        let idx = self.indexes.read().await;
        idx.user_of_conn.get(&conn_id).cloned()
    }

    pub async fn is_user_online(&self, user_id: &str) -> bool {
        let idx = self.indexes.read().await;
        idx.conns_of_user
            .get(user_id)
            .map(|conns| !conns.is_empty())
            .unwrap_or(false)
    }

    pub async fn join_room(&self, user_id: &str, room_id: &str) {
        let mut idx = self.indexes.write().await;
        idx.rooms_of_user
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());
        idx.users_in_room
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        debug!("User {} joined room audience {}", user_id, room_id);
    }

    pub async fn leave_room(&self, user_id: &str, room_id: &str) {
        let mut idx = self.indexes.write().await;
        if let Some(rooms) = idx.rooms_of_user.get_mut(user_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                idx.rooms_of_user.remove(user_id);
            }
        }
        if let Some(users) = idx.users_in_room.get_mut(room_id) {
            users.remove(user_id);
            if users.is_empty() {
                idx.users_in_room.remove(room_id);
            }
        }
    }

    /// Removes the user from every room audience; returns the rooms left.
    pub async fn leave_all_rooms(&self, user_id: &str) -> Vec<String> {
        let mut idx = self.indexes.write().await;
        Self::leave_all_rooms_locked(&mut idx, user_id)
    }

    pub async fn users_in_room(&self, room_id: &str) -> HashSet<String> {
        let idx = self.indexes.read().await;
        idx.users_in_room.get(room_id).cloned().unwrap_or_default()
    }

    pub async fn rooms_of_user(&self, user_id: &str) -> HashSet<String> {
        let idx = self.indexes.read().await;
        idx.rooms_of_user.get(user_id).cloned().unwrap_or_default()
    }

    /// Drops index entries whose reverse side is gone. Runs on a fixed
    /// schedule; the per-operation bookkeeping keeps the maps consistent, so
    /// this only catches entries orphaned by bugs or crashes mid-update.
    pub async fn cleanup(&self) -> usize {
        let mut idx = self.indexes.write().await;
        let mut removed = 0usize;

        let live_users: HashSet<String> = idx.conns_of_user.keys().cloned().collect();

        let stale_conns: Vec<ConnectionId> = idx
            .user_of_conn
            .iter()
            .filter(|(conn, user)| {
                idx.conns_of_user
                    .get(*user)
                    .map(|set| !set.contains(*conn))
                    .unwrap_or(true)
            })
            .map(|(conn, _)| *conn)
            .collect();
        for conn in stale_conns {
            idx.user_of_conn.remove(&conn);
            removed += 1;
        }

        let stale_room_users: Vec<String> = idx
            .rooms_of_user
            .keys()
            .filter(|user| !live_users.contains(*user))
            .cloned()
            .collect();
        for user in stale_room_users {
            removed += Self::leave_all_rooms_locked(&mut idx, &user).len();
        }

        if removed > 0 {
            info!("Registry cleanup removed {} stale entries", removed);
        }
        removed
    }

    pub async fn connection_count(&self) -> usize {
        self.indexes.read().await.user_of_conn.len()
    }

    fn leave_all_rooms_locked(idx: &mut Indexes, user_id: &str) -> Vec<String> {
        let rooms: Vec<String> = idx
            .rooms_of_user
            .remove(user_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for room_id in &rooms {
            if let Some(users) = idx.users_in_room.get_mut(room_id) {
                users.remove(user_id);
                if users.is_empty() {
                    idx.users_in_room.remove(room_id);
                }
            }
        }
        rooms
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
