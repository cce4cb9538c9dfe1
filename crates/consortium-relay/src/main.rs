//! Consortium Relay Server
//!
//! Zero-knowledge relay that brokers end-to-end-encrypted coding-assistant
//! sessions between headless agents and interactive viewers.

use std::net::SocketAddr;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consortium_relay::auth::TokenService;
use consortium_relay::server::{build_router, AppState};
use consortium_relay::storage::RelayDatabase;

#[derive(Parser, Debug)]
#[command(name = "consortium-relay")]
#[command(
    version,
    about = "Consortium relay server - encrypted session router"
)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3005, env = "PORT")]
    port: u16,

    /// Database connection string (sqlite URL or file path).
    #[arg(long, default_value = "consortium.db", env = "DATABASE_URL")]
    database_url: String,

    /// Master secret the token-signing key is derived from (>= 32 chars).
    /// Changing it invalidates all issued tokens.
    #[arg(long, env = "CONSORTIUM_MASTER_SECRET", hide_env_values = true)]
    master_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "consortium_relay=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "Starting consortium-relay"
    );

    let tokens = TokenService::new(&args.master_secret)?;
    let db = RelayDatabase::open(&args.database_url).await?;

    let state = AppState::new(db, tokens);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Relay server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Relay stopped");
    Ok(())
}
