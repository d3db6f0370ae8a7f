//! save-sync: share game saves between players on a LAN.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use save_sync_core::{EventBus, SessionEvent, StateStore};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use save_sync_daemon::{connection_info, join, ClientExit, Config, SessionContext, SessionHost};

#[derive(Parser, Debug)]
#[command(name = "save-sync")]
#[command(about = "Peer-to-peer save game sharing")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Port to listen on or connect to (overrides SAVE_SYNC_PORT)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a session and push local saves to everyone who joins
    Host {
        /// Session password; saves are signed when set
        #[arg(long)]
        password: Option<String>,

        /// Do not watch the save directory
        #[arg(long)]
        no_watch: bool,
    },
    /// Join a hosted session
    Join {
        /// Host address, `ip` or `ip:port`
        host: String,

        /// Session password, needed when the host signs saves
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the addresses others can use to reach this machine
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,save_sync_daemon=debug"
    } else {
        "info,save_sync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    match args.command {
        Command::Host { password, no_watch } => run_host(config, password, no_watch).await,
        Command::Join { host, password } => run_join(config, &host, password).await,
        Command::Info => {
            let info =
                connection_info::lookup(&config.route_addr, &config.ip_echo_url, config.port)
                    .await;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

fn state_store(config: &Config, password: Option<String>) -> Arc<StateStore> {
    let events = Arc::new(EventBus::new());
    let store = StateStore::new(events);
    let store = match password.or_else(|| config.password.clone()) {
        Some(password) => store.with_password_provider(move || Some(password.clone())),
        None => store,
    };
    Arc::new(store)
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::PeersChanged { peers } => info!("Peers: {:?}", peers),
        SessionEvent::StateUpdated { state } => {
            info!("State: {}", serde_json::Value::Object(state))
        }
        SessionEvent::IncomingSave { path, sha256, .. } => {
            info!("Save written to {} (SHA-256 {})", path, sha256)
        }
        SessionEvent::TextReceived { from, message } => println!("[{from}] {message}"),
        SessionEvent::SaveReloadRequested { path } => info!("Reload the game to pick up {}", path),
    }
}

async fn run_host(config: Config, password: Option<String>, no_watch: bool) -> Result<()> {
    let password = password.or_else(|| config.password.clone());
    let store = state_store(&config, password.clone());
    let _subscription = store.events().subscribe(log_event);

    let host = SessionHost::new(SessionContext::with_state_store(config, store));
    host.start(password.as_deref()).await?;

    if !no_watch {
        if let Err(e) = host.start_save_watcher() {
            warn!("Not watching saves: {}", e);
        }
    }

    host.connection_info_with(|info| {
        info!(
            "Share this address: {}:{} (LAN) / {}:{} (internet)",
            info.local_ip, info.port, info.public_ip, info.port
        );
    });

    info!("Hosting. Type a line to send a message, Ctrl+C to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = host.push_text(line.trim()).await {
                        warn!("Message not sent: {}", e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutdown signal received");
    host.stop().await;
    Ok(())
}

async fn run_join(config: Config, address: &str, password: Option<String>) -> Result<()> {
    let store = state_store(&config, password);
    let _subscription = store.events().subscribe(log_event);

    let client = join(address, SessionContext::with_state_store(config, store)).await?;
    client.wait_ready().await?;

    info!("Joined. Type a line to send a message, Ctrl+C to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = client.send_text(line.trim()).await {
                        warn!("Message not sent: {}", e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = client.closed() => break,
            _ = tokio::signal::ctrl_c() => {
                client.close().await;
                return Ok(());
            }
        }
    }

    report_exit(client.wait().await)
}

fn report_exit(exit: ClientExit) -> Result<()> {
    match exit {
        ClientExit::Closed => {
            info!("Host closed the session");
            Ok(())
        }
        ClientExit::Failed(e) => Err(e).context("Connection to host failed"),
        ClientExit::Aborted(e) => Err(e).context("Session aborted"),
    }
}
