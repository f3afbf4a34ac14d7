//! `probe HOST_ID`: check that a configured host accepts our credentials.
//!
//! Opens a fresh SSH connection, runs `echo 'test'` and expects the echo
//! back. Nothing is recorded in the audit store.

use crate::config::ServerConfig;
use crate::session::SshConnector;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

const PROBE_COMMAND: &str = "echo 'test'";

/// Overall budget for connect + command.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(config: &ServerConfig, host_id: u32) -> Result<()> {
    let host = config
        .hosts
        .iter()
        .find(|h| h.id == host_id)
        .with_context(|| format!("host {host_id} is not configured"))?;
    info!(host_id, addr = %host.socket_addr(), "probing host");

    let connector = SshConnector::new(config.connect_timeout);
    let output = connector
        .run_command(host, PROBE_COMMAND, PROBE_TIMEOUT)
        .await
        .with_context(|| format!("probe of host {} ({}) failed", host.name, host.socket_addr()))?;

    let reply = String::from_utf8_lossy(&output);
    if reply.trim() != "test" {
        anyhow::bail!("unexpected probe reply from {}: {:?}", host.name, reply.trim());
    }
    println!(
        "Host {} ({}) is reachable as {}.",
        host.name,
        host.socket_addr(),
        host.username
    );
    Ok(())
}
