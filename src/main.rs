//! chatd - TCP chat relay
//!
//! ## Modes
//!
//! **Default / `chatd serve`**: listens on port 7270 over IPv6 and IPv4 and
//! relays every message a client sends to all other connected clients.
//!
//! **`chatd connect`**: a line-mode client. Lines typed on stdin are sent as
//! messages; everything the server sends is printed to stdout.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use chatd::{
    client::Client,
    config::{ServerConfig, DEFAULT_PORT},
    framing::Framing,
    registry::DEFAULT_MAX_USERS,
    server::{Server, ServerError},
};
use clap::{Args, Parser as ClapParser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// chatd - TCP chat relay
#[derive(ClapParser, Debug)]
#[command(name = "chatd", version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the chat server (the default)
    Serve(ServeArgs),

    /// Connect to a server as a line-mode client
    Connect {
        /// Display name to register
        #[arg(long, short)]
        name: String,

        /// Server address
        #[arg(long, default_value = "[::1]:7270")]
        addr: String,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// TCP port to listen on
    #[arg(long, env = "CHATD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// IPv4 address to listen on
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    ipv4: Ipv4Addr,

    /// IPv6 address to listen on
    #[arg(long, default_value_t = Ipv6Addr::UNSPECIFIED)]
    ipv6: Ipv6Addr,

    /// Do not open the IPv4 listener
    #[arg(long, conflicts_with = "no_ipv6")]
    no_ipv4: bool,

    /// Do not open the IPv6 listener
    #[arg(long)]
    no_ipv6: bool,

    /// Maximum number of registered clients
    #[arg(long, env = "CHATD_MAX_USERS", default_value_t = DEFAULT_MAX_USERS)]
    max_users: usize,

    /// Message framing: "read" (one read per message) or "line" (newline-delimited)
    #[arg(long, default_value_t = Framing::Read)]
    framing: Framing,

    /// Seconds a new connection may take to send its display name
    #[arg(long, default_value_t = 30)]
    name_timeout: u64,

    /// Consecutive failed deliveries before a client is dropped (0 = never)
    #[arg(long, default_value_t = chatd::broadcast::DEFAULT_WRITE_FAILURE_THRESHOLD)]
    write_failure_threshold: usize,

    /// Do not announce departures to the remaining clients
    #[arg(long)]
    quiet_departures: bool,
}

impl ServeArgs {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            ipv4: (!self.no_ipv4).then_some(self.ipv4),
            ipv6: (!self.no_ipv6).then_some(self.ipv6),
            max_users: self.max_users,
            framing: self.framing,
            name_timeout: Duration::from_secs(self.name_timeout),
            write_failure_threshold: self.write_failure_threshold,
            announce_departures: !self.quiet_departures,
            ..ServerConfig::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatdError {
    #[error("server setup failed: {0}")]
    Setup(#[from] ServerError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ChatdError> {
    let cli = Cli::parse();

    // Client mode: stdout is the chat window, so logs go to stderr
    match cli.command {
        Some(Commands::Connect { name, addr }) => {
            init_tracing_stderr();
            run_connect(name, addr).await
        }
        Some(Commands::Serve(args)) => {
            init_tracing();
            run_server(args.into_config()).await
        }
        None => {
            init_tracing();
            run_server(cli.serve.into_config()).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chatd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chatd=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: ServerConfig) -> Result<(), ChatdError> {
    tracing::info!(
        port = config.port,
        max_users = config.max_users,
        framing = %config.framing,
        "chatd starting"
    );

    let server = Server::bind(config).map_err(|e| {
        tracing::error!(%e, "failed to start listeners");
        e
    })?;
    let state = server.state().clone();
    let stop = CancellationToken::new();
    let accept_handle = tokio::spawn(server.run(stop.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, closing listeners");
    stop.cancel();
    accept_handle.await?;

    if !state.tracker.is_empty() {
        tracing::info!(
            online = state.registry.len(),
            "waiting for clients to leave (Ctrl+C again to disconnect everyone)"
        );
        tokio::select! {
            _ = state.tracker.wait() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("disconnecting all clients");
                state.disconnect_all.cancel();
                state.tracker.wait().await;
            }
        }
    }

    tracing::info!("chatd exiting");
    Ok(())
}

// ── Client mode ────────────────────────────────────────────────────

async fn run_connect(name: String, addr: String) -> Result<(), ChatdError> {
    let client = Client::connect(addr.as_str(), &name).await.map_err(|e| {
        eprintln!("chatd connect: failed to connect to {}: {}", addr, e);
        ChatdError::Io(e)
    })?;
    println!("Connected to {addr} as {name}. Type /exit to leave.");

    client.run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
