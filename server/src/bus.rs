//! Outbound event fan-out.
//!
//! Each live connection registers an unbounded sender; a single writer task
//! per connection drains it onto the socket, so delivery is ordered per
//! recipient connection. Addressing is by connection, user (all of their
//! sockets) or room (every socket of every user in the audience). There is
//! no cross-connection ordering guarantee.

use crate::registry::{ConnectionId, ConnectionRegistry};
use log::debug;
use shared::ServerEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

/// Fan-out hub shared by all subsystems that emit to clients.
pub struct SessionBus {
    registry: Arc<ConnectionRegistry>,
    senders: RwLock<HashMap<ConnectionId, UnboundedSender<ServerEvent>>>,
}

impl SessionBus {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the outbound channel for a connection. The connection task
    /// owns the receiving end and the socket writer.
    pub async fn register(&self, conn_id: ConnectionId, sender: UnboundedSender<ServerEvent>) {
        self.senders.write().await.insert(conn_id, sender);
    }

    pub async fn unregister(&self, conn_id: ConnectionId) {
        self.senders.write().await.remove(&conn_id);
    }

    /// Emits to one connection. A closed channel is not an error: the
    /// connection is mid-teardown and the registry will catch up.
    pub async fn emit_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) {
        let senders = self.senders.read().await;
        if let Some(sender) = senders.get(&conn_id) {
            if sender.send(event).is_err() {
                debug!("Dropped emit to closing connection {}", conn_id);
            }
        }
    }

    /// Emits to every socket the user currently holds.
    pub async fn emit_to_user(&self, user_id: &str, event: ServerEvent) {
        let conns = self.registry.sockets_of_user(user_id).await;
        let senders = self.senders.read().await;
        for conn_id in conns {
            if let Some(sender) = senders.get(&conn_id) {
                if sender.send(event.clone()).is_err() {
                    debug!("Dropped emit to closing connection {}", conn_id);
                }
            }
        }
    }

    /// Emits to the whole room audience.
    pub async fn emit_to_room(&self, room_id: &str, event: ServerEvent) {
        let users = self.registry.users_in_room(room_id).await;
        for user_id in users {
            self.emit_to_user(&user_id, event.clone()).await;
        }
    }
}
