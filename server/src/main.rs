use clap::Parser;
use log::info;
use server::auth::TokenVerifier;
use server::bus::SessionBus;
use server::config::PlatformConfig;
use server::connection::{self, SessionContext};
use server::matchmaker::Matchmaker;
use server::registry::ConnectionRegistry;
use server::room::{RoomDeps, RoomRegistry};
use server::settlement::Settlement;
use server::store::Store;
use server::wallet::WalletLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// WebSocket port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// SQLite database URL
    #[clap(short, long, default_value = "sqlite://platform.db")]
    database: String,

    /// Secret used to validate bearer tokens
    #[clap(long, env = "TOKEN_SECRET", default_value = "dev-token-secret")]
    token_secret: String,

    /// Shared secret for payment-gateway receipt signatures
    #[clap(long, env = "GATEWAY_SECRET", default_value = "dev-gateway-secret")]
    gateway_secret: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let config = Arc::new(PlatformConfig {
        token_secret: args.token_secret.into_bytes(),
        gateway_secret: args.gateway_secret.into_bytes(),
        ..PlatformConfig::default()
    });

    let store = Store::connect(&args.database).await?;
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
    let restored = rooms.restore_active_rooms().await?;
    if restored > 0 {
        info!("Restored {} live rooms from persistence", restored);
    }

    let matchmaker = Arc::new(Matchmaker::new(deps.clone(), Arc::clone(&rooms)));
    tokio::spawn(Arc::clone(&matchmaker).run());

    // Periodic registry cleanup for entries orphaned by crashes.
    let cleanup_registry = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cleanup_registry.cleanup().await;
        }
    });

    let ctx = Arc::new(SessionContext {
        verifier: TokenVerifier::new(&config.token_secret),
        registry: connections,
        bus,
        rooms,
        matchmaker,
        wallet,
        store,
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Game server listening on ws://{}", addr);

    connection::serve(listener, ctx).await;
    Ok(())
}
