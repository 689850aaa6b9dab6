//! Integration tests for the platform core.
//!
//! These tests validate cross-component interactions: matchmaking over real
//! WebSocket connections, the debit/refund money paths, reconnect behaviour
//! mid-game, and snapshot recovery.

use futures_util::{SinkExt, StreamExt};
use server::auth::TokenVerifier;
use server::bus::SessionBus;
use server::config::PlatformConfig;
use server::connection::{self, SessionContext};
use server::matchmaker::Matchmaker;
use server::registry::ConnectionRegistry;
use server::room::{RoomDeps, RoomMessage, RoomRegistry};
use server::settlement::Settlement;
use server::store::Store;
use server::wallet::WalletLedger;
use shared::{GameType, LedgerKind, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
    deps: RoomDeps,
    rooms: Arc<RoomRegistry>,
}

async fn start_server() -> TestServer {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let config = Arc::new(PlatformConfig {
        matchmaker_tick: Duration::from_millis(100),
        join_window: Duration::from_millis(300),
        offline_grace: Duration::from_millis(500),
        ..PlatformConfig::default()
    });
    let wallet = WalletLedger::new(
        store.clone(),
        config.gateway_secret.clone(),
        config.wallet_limits(),
    );
    let connections = Arc::new(ConnectionRegistry::new());
    let bus = Arc::new(SessionBus::new(Arc::clone(&connections)));
    let settlement = Arc::new(Settlement::new(wallet.clone()));
    let deps = RoomDeps {
        store: store.clone(),
        wallet: wallet.clone(),
        bus: Arc::clone(&bus),
        connections: Arc::clone(&connections),
        settlement,
        config: Arc::clone(&config),
    };
    let rooms = Arc::new(RoomRegistry::new(deps.clone()));
    let matchmaker = Arc::new(Matchmaker::new(deps.clone(), Arc::clone(&rooms)));
    tokio::spawn(Arc::clone(&matchmaker).run());

    let ctx = Arc::new(SessionContext {
        verifier: TokenVerifier::new(&config.token_secret),
        registry: connections,
        bus,
        rooms: Arc::clone(&rooms),
        matchmaker,
        wallet,
        store,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        connection::serve(listener, serve_ctx).await;
    });

    TestServer {
        addr,
        ctx,
        deps,
        rooms,
    }
}

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(server: &TestServer, user: &str) -> WsClient {
    let token = server.ctx.verifier.sign(user);
    let url = format!("ws://{}/?token={}", server.addr, token);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_event(ws: &mut WsClient, json: &str) {
    ws.send(Message::Text(json.to_string())).await.unwrap();
}

async fn next_server_event(ws: &mut WsClient) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("event within deadline")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("valid server event");
        }
    }
}

async fn wait_for<F: Fn(&ServerEvent) -> bool>(ws: &mut WsClient, pred: F) -> ServerEvent {
    loop {
        let event = next_server_event(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Queues both users for a free 2-player game and joins them into the
/// matched room; returns the room id once the game has started.
async fn match_and_join(
    ws1: &mut WsClient,
    ws2: &mut WsClient,
    game_type: &str,
) -> String {
    let join = format!(
        r#"{{"event":"joinMatchmaking","data":{{"gameType":"{game_type}","maxPlayers":2,"entryFee":0}}}}"#
    );
    send_event(ws1, &join).await;
    send_event(ws2, &join).await;

    let found = wait_for(ws1, |e| matches!(e, ServerEvent::MatchFound { .. })).await;
    let game_id = match found {
        ServerEvent::MatchFound { game_id, .. } => game_id,
        _ => unreachable!(),
    };
    wait_for(ws2, |e| matches!(e, ServerEvent::MatchFound { .. })).await;

    let join_room = format!(r#"{{"event":"joinGameRoom","data":{{"gameId":"{game_id}"}}}}"#);
    send_event(ws1, &join_room).await;
    send_event(ws2, &join_room).await;
    wait_for(ws1, |e| matches!(e, ServerEvent::GameStarted { .. })).await;
    game_id
}

/// MATCHMAKING TESTS
mod matchmaking_tests {
    use super::*;

    /// Two users queue for a free 2-player Memory game and both receive
    /// `matchFound` with the same room, distinct seats, and a 30-card board.
    #[tokio::test]
    async fn two_player_memory_happy_path() {
        let server = start_server().await;
        let mut ws1 = connect(&server, "u1").await;
        let mut ws2 = connect(&server, "u2").await;

        send_event(
            &mut ws1,
            r#"{"event":"joinMatchmaking","data":{"gameType":"MEMORY","maxPlayers":2,"entryFee":0}}"#,
        )
        .await;
        let status = next_server_event(&mut ws1).await;
        assert!(
            matches!(status, ServerEvent::MatchmakingStatus { ref status } if status == "waiting")
        );

        send_event(
            &mut ws2,
            r#"{"event":"joinMatchmaking","data":{"gameType":"MEMORY","maxPlayers":2,"entryFee":0}}"#,
        )
        .await;

        let found1 = wait_for(&mut ws1, |e| matches!(e, ServerEvent::MatchFound { .. })).await;
        let found2 = wait_for(&mut ws2, |e| matches!(e, ServerEvent::MatchFound { .. })).await;

        let (game1, seat1) = match found1 {
            ServerEvent::MatchFound {
                game_id, your_seat, ..
            } => (game_id, your_seat),
            _ => unreachable!(),
        };
        let (game2, seat2) = match found2 {
            ServerEvent::MatchFound {
                game_id, your_seat, ..
            } => (game_id, your_seat),
            _ => unreachable!(),
        };
        assert_eq!(game1, game2);
        assert_ne!(seat1, seat2);

        // Join and receive the initial 30-card board when the game starts.
        send_event(
            &mut ws1,
            &format!(r#"{{"event":"joinGameRoom","data":{{"gameId":"{game1}"}}}}"#),
        )
        .await;
        send_event(
            &mut ws2,
            &format!(r#"{{"event":"joinGameRoom","data":{{"gameId":"{game2}"}}}}"#),
        )
        .await;

        let started = wait_for(&mut ws1, |e| matches!(e, ServerEvent::GameStarted { .. })).await;
        match started {
            ServerEvent::GameStarted { initial_state } => {
                assert_eq!(initial_state["board"].as_array().unwrap().len(), 30);
            }
            _ => unreachable!(),
        }
    }

    /// Leaving the queue is acknowledged and removes the entry.
    #[tokio::test]
    async fn leave_matchmaking() {
        let server = start_server().await;
        let mut ws = connect(&server, "u1").await;

        send_event(
            &mut ws,
            r#"{"event":"joinMatchmaking","data":{"gameType":"FAST_LUDO","maxPlayers":4,"entryFee":0}}"#,
        )
        .await;
        wait_for(&mut ws, |e| {
            matches!(e, ServerEvent::MatchmakingStatus { status } if status == "waiting")
        })
        .await;

        send_event(&mut ws, r#"{"event":"leaveMatchmaking"}"#).await;
        wait_for(&mut ws, |e| {
            matches!(e, ServerEvent::MatchmakingStatus { status } if status == "left")
        })
        .await;
        assert!(server.deps.store.load_queue().await.unwrap().is_empty());
    }

    /// An unknown event name is ignored; a malformed known event errors.
    #[tokio::test]
    async fn unknown_and_malformed_frames() {
        let server = start_server().await;
        let mut ws = connect(&server, "u1").await;

        send_event(&mut ws, r#"{"event":"teleport","data":{}}"#).await;
        send_event(&mut ws, r#"{"event":"joinGameRoom","data":{}}"#).await;

        // Only the malformed frame produces a response.
        let event = next_server_event(&mut ws).await;
        assert!(matches!(event, ServerEvent::Error { .. }));
    }

    /// A connection with a bad token never becomes a session.
    #[tokio::test]
    async fn invalid_token_gets_no_session() {
        let server = start_server().await;
        let url = format!("ws://{}/?token=u1.deadbeef", server.addr);
        if let Ok((mut ws, _)) = tokio_tungstenite::connect_async(url).await {
            let _ = ws
                .send(Message::Text(r#"{"event":"getWallet"}"#.to_string()))
                .await;
            let got = timeout(Duration::from_millis(500), ws.next()).await;
            if let Ok(Some(Ok(Message::Text(_)))) = got {
                panic!("rejected token must not receive events");
            }
        }
        assert!(!server.ctx.registry.is_user_online("u1").await);
    }
}

/// MONEY PATH TESTS
mod money_tests {
    use super::*;

    /// Entry fees are debited at match time and fully refunded when the
    /// room is cancelled before it starts.
    #[tokio::test]
    async fn debit_then_refund_on_cancel() {
        let server = start_server().await;
        for user in ["u1", "u2"] {
            server
                .deps
                .store
                .ensure_user(user, user, &format!("+91-{user}"))
                .await
                .unwrap();
            server
                .deps
                .wallet
                .credit(user, LedgerKind::Deposit, 100_00, "seed", None)
                .await
                .unwrap();
        }

        let matchmaker = Matchmaker::new(server.deps.clone(), Arc::clone(&server.rooms));
        matchmaker
            .enqueue("u1", GameType::ClassicLudo, 2, 50_00)
            .await
            .unwrap();
        matchmaker
            .enqueue("u2", GameType::ClassicLudo, 2, 50_00)
            .await
            .unwrap();
        assert_eq!(matchmaker.sweep().await.unwrap(), 1);

        assert_eq!(server.deps.wallet.balance("u1").await.unwrap(), 50_00);
        assert_eq!(server.deps.wallet.balance("u2").await.unwrap(), 50_00);

        let room = &server.deps.store.active_rooms().await.unwrap()[0];
        assert_eq!(room.prize_pool, 90_00);

        assert!(server.rooms.cancel_room(&room.id, "admin cancel").await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(server.deps.wallet.balance("u1").await.unwrap(), 100_00);
        assert_eq!(server.deps.wallet.balance("u2").await.unwrap(), 100_00);

        let ledger = server.deps.store.ledger_for_game(&room.id).await.unwrap();
        assert_eq!(ledger.iter().filter(|e| e.kind == "GAME_ENTRY").count(), 2);
        assert_eq!(ledger.iter().filter(|e| e.kind == "REFUND").count(), 2);

        let row = server.deps.store.room(&room.id).await.unwrap().unwrap();
        assert_eq!(row.status, "CANCELLED");
    }

    /// Balance always equals the signed sum of COMPLETED ledger entries,
    /// through deposit, entry fee, and (idempotent) winnings.
    #[tokio::test]
    async fn ledger_sum_invariant_held() {
        let server = start_server().await;
        let wallet = &server.deps.wallet;
        server
            .deps
            .store
            .ensure_user("u1", "u1", "+91-u1")
            .await
            .unwrap();

        wallet
            .credit("u1", LedgerKind::Deposit, 500_00, "seed", None)
            .await
            .unwrap();
        wallet
            .debit("u1", LedgerKind::GameEntry, 50_00, "entry", Some("g"))
            .await
            .unwrap();
        wallet.settle_game_winning("u1", 90_00, "g").await.unwrap();
        wallet.settle_game_winning("u1", 90_00, "g").await.unwrap();

        let entries = server.deps.store.ledger_for_user("u1").await.unwrap();
        let sum: i64 = entries
            .iter()
            .filter(|e| e.status == "COMPLETED")
            .map(|e| e.amount)
            .sum();
        assert_eq!(sum, wallet.balance("u1").await.unwrap());
        assert_eq!(sum, 540_00);
    }

    /// The wallet query event answers with the live balance.
    #[tokio::test]
    async fn get_wallet_over_socket() {
        let server = start_server().await;
        let mut ws = connect(&server, "u1").await;
        server
            .deps
            .wallet
            .credit("u1", LedgerKind::Deposit, 42_00, "seed", None)
            .await
            .unwrap();

        send_event(&mut ws, r#"{"event":"getWallet"}"#).await;
        let event = wait_for(&mut ws, |e| {
            matches!(e, ServerEvent::WalletBalance { .. })
        })
        .await;
        assert!(matches!(event, ServerEvent::WalletBalance { balance } if balance == 42_00));
    }
}

/// RECONNECT TESTS
mod reconnect_tests {
    use super::*;

    /// A dropped connection does not advance the turn; rejoining replays the
    /// current state with the clock still running.
    #[tokio::test]
    async fn reconnect_mid_turn_resumes_state() {
        let server = start_server().await;
        let mut ws1 = connect(&server, "u1").await;
        let mut ws2 = connect(&server, "u2").await;
        let game_id = match_and_join(&mut ws1, &mut ws2, "MEMORY").await;

        // u1 (the first actor) drops mid-turn.
        drop(ws1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.ctx.registry.is_user_online("u1").await);

        // Reconnect within the grace window and rejoin.
        let mut ws1 = connect(&server, "u1").await;
        send_event(
            &mut ws1,
            &format!(r#"{{"event":"joinGameRoom","data":{{"gameId":"{game_id}"}}}}"#),
        )
        .await;

        let state = wait_for(&mut ws1, |e| matches!(e, ServerEvent::GameState { .. })).await;
        match state {
            ServerEvent::GameState {
                status,
                current_player_id,
                remaining_seconds,
                ..
            } => {
                assert_eq!(status, "PLAYING");
                assert_eq!(current_player_id, Some("u1".to_string()));
                // The turn clock kept running while u1 was away.
                assert!(remaining_seconds.is_some());
            }
            _ => unreachable!(),
        }
    }

    /// If the dropped player stays away past the offline grace in a
    /// 2-player room, the remaining player wins.
    #[tokio::test]
    async fn offline_grace_awards_remaining_player() {
        let server = start_server().await;
        let mut ws1 = connect(&server, "u1").await;
        let mut ws2 = connect(&server, "u2").await;
        let game_id = match_and_join(&mut ws1, &mut ws2, "SNAKES_LADDERS").await;

        drop(ws1);

        let ended = wait_for(&mut ws2, |e| matches!(e, ServerEvent::GameEnded { .. })).await;
        match ended {
            ServerEvent::GameEnded { winner_id, .. } => {
                assert_eq!(winner_id, Some("u2".to_string()));
            }
            _ => unreachable!(),
        }
        let row = server.deps.store.room(&game_id).await.unwrap().unwrap();
        assert_eq!(row.status, "FINISHED");
        assert_eq!(row.winner, Some("u2".to_string()));
    }
}

/// RECOVERY TESTS
mod recovery_tests {
    use super::*;

    /// A PLAYING room is rehydrated from its persisted snapshot by a fresh
    /// room registry, as after a process restart.
    #[tokio::test]
    async fn playing_room_restored_from_snapshot() {
        let server = start_server().await;
        let mut ws1 = connect(&server, "u1").await;
        let mut ws2 = connect(&server, "u2").await;
        let game_id = match_and_join(&mut ws1, &mut ws2, "MEMORY").await;

        // A second registry over the same store plays the part of a
        // restarted process.
        let fresh = RoomRegistry::new(server.deps.clone());
        let restored = fresh.restore_active_rooms().await.unwrap();
        assert!(restored >= 1);
        assert!(fresh.is_live(&game_id).await);

        // The restored room still accepts a join from its participant.
        assert!(
            fresh
                .send(
                    &game_id,
                    RoomMessage::Join {
                        user_id: "u1".to_string()
                    }
                )
                .await
        );
    }
}
