//! WebSocket session layer: handshake authentication, inbound dispatch and
//! the per-connection writer task.
//!
//! Each accepted socket is authenticated from the bearer token presented at
//! the handshake (query string or Authorization header), attached to the
//! connection registry, and given an unbounded outbound channel drained by a
//! dedicated writer task so emits stay ordered per connection. Inbound
//! frames are schema-validated into [`ClientEvent`]s and dispatched by name;
//! unknown event names are ignored with a diagnostic, malformed payloads are
//! rejected with an `error` event. The token is re-verified on every event.

use crate::auth::TokenVerifier;
use crate::bus::SessionBus;
use crate::engine::PlayerAction;
use crate::matchmaker::Matchmaker;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::room::{RoomMessage, RoomRegistry};
use crate::store::Store;
use crate::wallet::WalletLedger;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ClientEvent, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Shared handles the session layer needs to serve a connection.
#[derive(Clone)]
pub struct SessionContext {
    pub verifier: TokenVerifier,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<SessionBus>,
    pub rooms: Arc<RoomRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub wallet: WalletLedger,
    pub store: Store,
}

/// Accept loop: one spawned handler per socket.
pub async fn serve(listener: tokio::net::TcpListener, ctx: Arc<SessionContext>) {
    info!("Session layer accepting connections");
    while let Ok((stream, addr)) = listener.accept().await {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_client(stream, addr, ctx).await;
        });
    }
}

/// Event names the server understands; anything else inbound is dropped
/// with a diagnostic rather than an error.
const KNOWN_EVENTS: [&str; 7] = [
    "joinMatchmaking",
    "leaveMatchmaking",
    "joinGameRoom",
    "rollDice",
    "movePiece",
    "selectCard",
    "getWallet",
];

/// Outcome of classifying one inbound text frame.
#[derive(Debug)]
enum Inbound {
    Event(ClientEvent),
    UnknownName(String),
    Malformed(String),
}

fn classify_frame(text: &str) -> Inbound {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => Inbound::Event(event),
        Err(parse_err) => {
            let name = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(String::from));
            match name {
                Some(name) if !KNOWN_EVENTS.contains(&name.as_str()) => {
                    Inbound::UnknownName(name)
                }
                _ => Inbound::Malformed(parse_err.to_string()),
            }
        }
    }
}

/// Pulls the bearer token out of the handshake request: `?token=...` in the
/// query string, or an `Authorization: Bearer ...` header.
fn token_from_parts(query: Option<&str>, auth_header: Option<&str>) -> Option<String> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    auth_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, ctx: Arc<SessionContext>) {
    let mut token: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        token = token_from_parts(req.uri().query(), auth);
        Ok(resp)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let Some(token) = token else {
        warn!("Connection from {} presented no token", addr);
        return;
    };
    let user_id = match ctx.verifier.verify(&token) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("Connection from {} rejected: {}", addr, e);
            return;
        }
    };

    // The auth service owns user creation; make the row and wallet exist for
    // tokens minted out-of-band (tests, tooling).
    if let Err(e) = ctx
        .store
        .ensure_user(&user_id, &user_id, &format!("tok:{user_id}"))
        .await
    {
        error!("User bootstrap for {} failed: {}", user_id, e);
        return;
    }

    let conn_id = ctx.registry.attach(&user_id).await;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    ctx.bus.register(conn_id, outbound_tx).await;
    info!("User {} connected from {} (conn {})", user_id, addr, conn_id);

    let (mut ws_sink, mut ws_source) = ws_stream.split();

    // Writer task: sole owner of the sink, drains in emit order.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Event serialization failed: {}", e);
                    continue;
                }
            };
            if ws_sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_source.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!("WebSocket error from conn {}: {}", conn_id, e);
                break;
            }
        };
        match message {
            Message::Text(text) => {
                // Token re-verified per event; a revoked secret cuts the
                // session at the next action.
                if ctx.verifier.verify(&token).is_err() {
                    warn!("Conn {} token no longer valid", conn_id);
                    break;
                }
                dispatch_frame(&ctx, conn_id, &user_id, &text).await;
            }
            Message::Binary(_) => {
                debug!("Ignoring binary frame from conn {}", conn_id);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    teardown(&ctx, conn_id).await;
    writer.abort();
}

async fn dispatch_frame(ctx: &SessionContext, conn_id: ConnectionId, user_id: &str, text: &str) {
    let event = match classify_frame(text) {
        Inbound::Event(event) => event,
        Inbound::UnknownName(name) => {
            debug!("Conn {} sent unknown event '{}'", conn_id, name);
            return;
        }
        Inbound::Malformed(reason) => {
            debug!("Conn {} sent malformed frame: {}", conn_id, reason);
            ctx.bus
                .emit_to_connection(
                    conn_id,
                    ServerEvent::Error {
                        message: "malformed event payload".to_string(),
                    },
                )
                .await;
            return;
        }
    };

    match event {
        ClientEvent::JoinMatchmaking {
            game_type,
            max_players,
            entry_fee,
        } => match ctx
            .matchmaker
            .enqueue(user_id, game_type, max_players, entry_fee)
            .await
        {
            Ok(()) => {
                ctx.bus
                    .emit_to_connection(
                        conn_id,
                        ServerEvent::MatchmakingStatus {
                            status: "waiting".to_string(),
                        },
                    )
                    .await;
            }
            Err(e) => {
                ctx.bus
                    .emit_to_connection(
                        conn_id,
                        ServerEvent::Error {
                            message: e.to_string(),
                        },
                    )
                    .await;
            }
        },
        ClientEvent::LeaveMatchmaking => {
            match ctx.matchmaker.dequeue(user_id).await {
                Ok(_) => {
                    ctx.bus
                        .emit_to_connection(
                            conn_id,
                            ServerEvent::MatchmakingStatus {
                                status: "left".to_string(),
                            },
                        )
                        .await;
                }
                Err(e) => {
                    ctx.bus
                        .emit_to_connection(
                            conn_id,
                            ServerEvent::Error {
                                message: e.to_string(),
                            },
                        )
                        .await;
                }
            }
        }
        ClientEvent::JoinGameRoom { game_id } => {
            route_to_room(
                ctx,
                conn_id,
                &game_id,
                RoomMessage::Join {
                    user_id: user_id.to_string(),
                },
            )
            .await;
        }
        ClientEvent::RollDice { game_id } => {
            route_to_room(
                ctx,
                conn_id,
                &game_id,
                RoomMessage::Action {
                    user_id: user_id.to_string(),
                    action: PlayerAction::RollDice,
                },
            )
            .await;
        }
        ClientEvent::MovePiece { game_id, piece_id } => {
            route_to_room(
                ctx,
                conn_id,
                &game_id,
                RoomMessage::Action {
                    user_id: user_id.to_string(),
                    action: PlayerAction::MovePiece { piece_id },
                },
            )
            .await;
        }
        ClientEvent::SelectCard { game_id, position } => {
            route_to_room(
                ctx,
                conn_id,
                &game_id,
                RoomMessage::Action {
                    user_id: user_id.to_string(),
                    action: PlayerAction::SelectCard { position },
                },
            )
            .await;
        }
        ClientEvent::GetWallet => match ctx.wallet.balance(user_id).await {
            Ok(balance) => {
                ctx.bus
                    .emit_to_connection(conn_id, ServerEvent::WalletBalance { balance })
                    .await;
            }
            Err(e) => {
                ctx.bus
                    .emit_to_connection(
                        conn_id,
                        ServerEvent::Error {
                            message: e.to_string(),
                        },
                    )
                    .await;
            }
        },
    }
}

async fn route_to_room(
    ctx: &SessionContext,
    conn_id: ConnectionId,
    room_id: &str,
    message: RoomMessage,
) {
    if !ctx.rooms.send(room_id, message).await {
        ctx.bus
            .emit_to_connection(
                conn_id,
                ServerEvent::Error {
                    message: "game not found".to_string(),
                },
            )
            .await;
    }
}

/// Detach bookkeeping: unregister the outbound channel, drop the registry
/// entry, and tell every room the user left if this was their last socket.
/// Connection loss never cancels in-flight room work.
async fn teardown(ctx: &SessionContext, conn_id: ConnectionId) {
    ctx.bus.unregister(conn_id).await;
    if let Some(outcome) = ctx.registry.detach(conn_id).await {
        if outcome.went_offline {
            for room_id in &outcome.rooms_left {
                ctx.rooms
                    .send(
                        room_id,
                        RoomMessage::PlayerOffline {
                            user_id: outcome.user_id.clone(),
                        },
                    )
                    .await;
            }
        }
    }
}
