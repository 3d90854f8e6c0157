//! clawlet entrypoint.
//!
//! Serves the operation catalog over JSON-HTTP (default) or over the stdio
//! tool protocol (`--stdio`), both against the same persistent state under
//! `<cwd>/.clawlet/state.json`.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the HTTP binding address
//! - `DEMO_MODE=true` disables every non-read operation
//! - `CLAWLET_DIR` overrides the state directory
//! - `RUST_LOG` controls log filtering

use clap::Parser;
use dotenvy::dotenv;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use clawlet::broker::SESSION_SWEEP_INTERVAL;
use clawlet::shutdown::shutdown_token;
use clawlet::store::{DATA_DIR, StateStore};
use clawlet::tools::App;
use clawlet::{handlers, rpc};

#[derive(Parser, Debug)]
#[command(name = "clawlet", version, about = "Spend-control broker for x402 payments")]
struct Cli {
    /// Port for the HTTP binding.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Address for the HTTP binding.
    #[arg(long, env = "HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// State directory; defaults to .clawlet under the working directory.
    #[arg(long, env = "CLAWLET_DIR")]
    state_dir: Option<PathBuf>,

    /// Disable every non-read operation.
    #[arg(long, env = "DEMO_MODE")]
    demo_mode: bool,

    /// Speak the stdio tool protocol instead of serving HTTP.
    #[arg(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    // In stdio mode stdout is the protocol stream; logs go to stderr either way.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?.join(DATA_DIR),
    };
    let store = Arc::new(StateStore::open(&state_dir).await?);
    let app = App::new(store, cli.demo_mode);

    let cancel = shutdown_token()?;
    let sweeper = app.broker.spawn_sweeper(cancel.clone());
    tracing::debug!(
        interval_secs = SESSION_SWEEP_INTERVAL.as_secs(),
        "Session sweeper running"
    );

    if cli.stdio {
        tracing::info!(state_dir = %state_dir.display(), "Serving stdio tool protocol");
        rpc::serve(app, cancel).await?;
    } else {
        let http_endpoints = axum::Router::new()
            .merge(handlers::routes())
            .with_state(app)
            .layer(TraceLayer::new_for_http())
            .layer(
                cors::CorsLayer::new()
                    .allow_origin(cors::Any)
                    .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                    .allow_headers(cors::Any),
            );

        let addr = SocketAddr::new(cli.host, cli.port);
        tracing::info!(state_dir = %state_dir.display(), "Starting server at http://{addr}");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let graceful = cancel.clone();
        axum::serve(listener, http_endpoints)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await?;
    }

    sweeper.abort();
    Ok(())
}
