//! Gore Game Server
//!
//! A 2D online RPG server: NPC spawners, a fixed-rate world tick and
//! line-delimited JSON sessions over TCP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gore_server::config::{LogFormat, ServerConfig};
use gore_server::game::world::WorldObserver;
use gore_server::net::handler::ConnectionHandler;
use gore_server::state::AppState;
use gore_server::VERSION;

/// How often idle sessions are swept
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up .env before anything reads the environment
    dotenv::dotenv().ok();

    // Load configuration; it picks the log format
    let config = ServerConfig::load().await?;

    // Initialize logging
    init_logging(config.log_format);

    info!("╔══════════════════════════════════════════════╗");
    info!("║          Gore Game Server v{}             ║", VERSION);
    info!("╚══════════════════════════════════════════════╝");

    if config.config_path.exists() {
        info!(
            "Configuration loaded from: {}",
            config.config_path.display()
        );
    } else {
        warn!(
            "Config file not found at {}, using defaults",
            config.config_path.display()
        );
    }

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = Arc::new(
        AppState::new(config.clone(), shutdown_tx.clone())
            .context("Failed to initialize application state")?,
    );
    let maps = state.load_world().context("Failed to load maps")?;
    if maps == 0 {
        warn!("No maps loaded, characters will have nowhere to go");
    }
    info!(maps = maps, "Application state initialized");

    // Start the game world tick
    let world = Arc::clone(&state.world);
    let observer: Arc<dyn WorldObserver> = state.dispatcher.clone();
    let mut world_shutdown_rx = shutdown_tx.subscribe();
    let world_handle = tokio::spawn(async move {
        world.run(&mut world_shutdown_rx, observer).await;
    });

    // Sweep idle sessions
    let idle_state = state.clone();
    let mut idle_shutdown_rx = shutdown_tx.subscribe();
    let idle_handle = tokio::spawn(async move {
        sweep_idle_sessions(idle_state, &mut idle_shutdown_rx).await;
    });

    // Start TCP listener for game connections
    let game_addr = config.bind_address();
    let game_listener = TcpListener::bind(game_addr)
        .await
        .with_context(|| format!("Failed to bind {}", game_addr))?;
    info!("Game server listening on: {}", game_addr);

    let game_state = state.clone();
    let mut game_shutdown_rx = shutdown_tx.subscribe();
    let game_handle = tokio::spawn(async move {
        accept_game_connections(game_listener, game_state, &mut game_shutdown_rx).await;
    });

    info!("Server startup complete!");
    info!("World {} is ready for connections", config.server_name);

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    // Stop accepting before the sessions go
    let _ = game_handle.await;
    let _ = idle_handle.await;

    // Save and remove every character while the world still holds them
    let disconnected = state.dispatcher.disconnect_all("Server shutting down");
    info!(sessions = disconnected, "All sessions disconnected");

    let _ = world_handle.await;

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gore_server=debug"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Accept incoming game (TCP) connections
async fn accept_game_connections(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!("New game connection from: {}", addr);
                        let handler = ConnectionHandler::new(state.dispatcher.clone());
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_tcp(stream, addr).await {
                                warn!("Game connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept game connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Game connection acceptor shutting down");
                break;
            }
        }
    }
}

/// Periodically disconnect sessions that have gone quiet
async fn sweep_idle_sessions(state: Arc<AppState>, shutdown_rx: &mut broadcast::Receiver<()>) {
    let mut sweep = interval(IDLE_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                state.dispatcher.cleanup_idle();
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
