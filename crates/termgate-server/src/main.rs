//! termgate-server: browser terminal bridge.
//!
//! Accepts WebSocket upgrades on `/api/terminal/{host_id}`, bridges each one to
//! an interactive SSH shell on the requested host and records every session
//! into a SQLite audit store.

mod audit;
mod auth;
mod commands;
mod config;
mod hosts;
mod server;
mod session;
mod transport;

use clap::{Parser, Subcommand};
use config::{CliOverrides, ServerConfig, DEFAULT_CONFIG_PATH};
use server::TermServer;
use std::path::PathBuf;
use termgate_core::SessionQuery;
use tracing::{error, info, warn};

/// termgate-server: WebSocket-to-SSH terminal bridge
#[derive(Parser, Debug)]
#[command(name = "termgate-server", version, about = "WebSocket-to-SSH terminal bridge")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Listen port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Listen address
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Audit database path
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the terminal bridge (default)
    Serve,

    /// List recorded sessions, newest first
    Sessions {
        /// Only sessions of this user
        #[arg(long)]
        user: Option<u32>,
        /// Only sessions on this host
        #[arg(long)]
        host: Option<u32>,
        /// Started at or after (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = commands::audit::parse_time)]
        since: Option<chrono::DateTime<chrono::Utc>>,
        /// Started at or before (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = commands::audit::parse_time)]
        until: Option<chrono::DateTime<chrono::Utc>>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = termgate_core::audit::DEFAULT_PAGE_SIZE)]
        page_size: u32,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show every recorded operation of a session
    Operations {
        session_id: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete a session and its operations
    DeleteSession {
        session_id: i64,
    },

    /// Check SSH connectivity to a configured host
    Probe {
        host_id: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind.clone(),
        database: cli.database.clone(),
    };
    let server_config = match ServerConfig::load(&PathBuf::from(&cli.config), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(server_config).await,
        Command::Sessions {
            user,
            host,
            since,
            until,
            page,
            page_size,
            json,
        } => commands::audit::run_sessions(
            &server_config,
            SessionQuery {
                user_id: user,
                host_id: host,
                started_after: since,
                started_before: until,
                page,
                page_size,
            },
            json,
        ),
        Command::Operations { session_id, json } => {
            commands::audit::run_operations(&server_config, session_id, json)
        }
        Command::DeleteSession { session_id } => {
            commands::audit::run_delete(&server_config, session_id)
        }
        Command::Probe { host_id } => commands::probe::run(&server_config, host_id).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("termgate-server: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr,
        "starting termgate-server"
    );
    let server = TermServer::new(config)?;
    server.run(shutdown_signal()).await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    info!("received shutdown signal");
}
