//! Core server: accepts terminal connections and runs one bridge per
//! connection.
//!
//! Owns the audit store, the SSH connector and the admission gate, and
//! coordinates process shutdown across all live bridges.

use crate::audit::{AuditRecorder, SqliteRecorder};
use crate::auth::AdmissionGate;
use crate::config::ServerConfig;
use crate::hosts::StaticHosts;
use crate::session::{SessionBridge, ShellConnector, SshConnector};
use crate::transport::websocket::{self, UpgradedConnection};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termgate_core::TermResult;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long live bridges get to tear down once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct TermServer {
    config: ServerConfig,
    recorder: Arc<dyn AuditRecorder>,
    connector: Arc<dyn ShellConnector>,
    gate: Arc<AdmissionGate>,
}

impl TermServer {
    /// Open the audit store and build the server's collaborators.
    pub fn new(config: ServerConfig) -> TermResult<Self> {
        let recorder = Arc::new(SqliteRecorder::open(&config.database)?);
        let connector = Arc::new(SshConnector::new(config.connect_timeout));
        Ok(Self::with_parts(config, recorder, connector))
    }

    pub fn with_parts(
        config: ServerConfig,
        recorder: Arc<dyn AuditRecorder>,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        let hosts = StaticHosts::new(config.hosts.iter().cloned());
        if hosts.is_empty() {
            warn!("no hosts configured, every terminal request will be rejected");
        } else {
            info!(count = hosts.len(), "loaded host inventory");
        }
        let gate = Arc::new(AdmissionGate::new(config.policy.clone(), Arc::new(hosts)));
        Self {
            config,
            recorder,
            connector,
            gate,
        }
    }

    /// Bind the listener and return its address plus the future that serves
    /// it until `shutdown` resolves.
    pub async fn bind(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> TermResult<(SocketAddr, BoxFuture<'static, TermResult<()>>)> {
        // Sessions left active by a crash can never be closed by their bridge.
        match self.recorder.close_orphaned_sessions() {
            Ok(0) => {}
            Ok(count) => info!(count, "closed audit sessions left open by a previous run"),
            Err(e) => warn!(error = %e, "could not close orphaned audit sessions"),
        }

        let (addr, conns) = websocket::start_listener(
            self.config.bind_addr,
            self.gate.clone(),
            self.config.max_message_size,
        )
        .await?;
        info!(addr = %addr, "termgate-server ready");
        Ok((addr, Box::pin(self.serve(conns, shutdown))))
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> TermResult<()> {
        let (_, serving) = self.bind(shutdown).await?;
        serving.await
    }

    async fn serve(
        self,
        mut conns: mpsc::Receiver<UpgradedConnection>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> TermResult<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut bridges = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                conn = conns.recv() => {
                    let Some(conn) = conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let bridge = SessionBridge::new(
                        self.recorder.clone(),
                        self.connector.clone(),
                        stop_rx.clone(),
                    );
                    bridges.spawn(handle_connection(bridge, conn));
                }
                Some(joined) = bridges.join_next(), if !bridges.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "bridge task failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        drop(conns);
        if !bridges.is_empty() {
            info!(live = bridges.len(), "stopping live sessions");
        }
        stop_tx.send_replace(true);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while bridges.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = bridges.len(), "sessions did not stop in time, aborting");
            bridges.abort_all();
        }
        info!("termgate-server stopped");
        Ok(())
    }
}

async fn handle_connection(bridge: SessionBridge, conn: UpgradedConnection) {
    let UpgradedConnection {
        link,
        grant,
        remote_addr,
    } = conn;
    let host_id = grant.host.id;
    debug!(remote = %remote_addr, host_id, user_id = grant.user_id, "starting terminal session");

    match bridge.run(link, &grant.host, grant.user_id).await {
        Ok(reason) => {
            debug!(remote = %remote_addr, host_id, %reason, "terminal connection finished");
        }
        Err(e) if e.is_setup_failure() => {
            warn!(remote = %remote_addr, host_id, error = %e, "terminal session could not start");
        }
        Err(e) => {
            warn!(remote = %remote_addr, host_id, error = %e, "terminal connection error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BearerPolicy;
    use crate::session::remote::{RemoteChannel, ShellCommand, ShellEndpoint, ShellHandle};
    use futures_util::{SinkExt, StreamExt};
    use termgate_core::{
        Credential, HostRecord, OperationKind, SessionQuery, SessionStatus, TermSize,
    };
    use tokio_tungstenite::tungstenite::Message;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";
    const WAIT: Duration = Duration::from_secs(5);

    /// Echoes every write back as output.
    struct EchoConnector;

    struct EchoChannel;

    impl ShellConnector for EchoConnector {
        fn open<'a>(
            &'a self,
            _host: &'a HostRecord,
        ) -> BoxFuture<'a, TermResult<Box<dyn RemoteChannel>>> {
            Box::pin(async { Ok(Box::new(EchoChannel) as Box<dyn RemoteChannel>) })
        }
    }

    impl RemoteChannel for EchoChannel {
        fn request_interactive_shell(
            self: Box<Self>,
            _size: TermSize,
        ) -> BoxFuture<'static, TermResult<ShellHandle>> {
            Box::pin(async {
                let (handle, endpoint) = ShellHandle::channel(16);
                tokio::spawn(echo(endpoint));
                Ok(handle)
            })
        }
    }

    async fn echo(mut endpoint: ShellEndpoint) {
        loop {
            let command = tokio::select! {
                command = endpoint.commands.recv() => command,
                _ = endpoint.closed.wait_for(|closed| *closed) => break,
            };
            match command {
                Some(ShellCommand::Write { data, ack }) => {
                    let _ = ack.send(Ok(data.len()));
                    if !endpoint.forward(data).await {
                        break;
                    }
                }
                Some(ShellCommand::Resize(_)) => {}
                None => break,
            }
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            database: ":memory:".into(),
            connect_timeout: Duration::from_secs(1),
            max_message_size: 1024,
            policy: BearerPolicy::default(),
            hosts: vec![HostRecord {
                id: 3,
                name: "echo".into(),
                address: "127.0.0.1".into(),
                port: 22,
                username: "me".into(),
                credential: Credential::Password("pw".into()),
            }],
        }
    }

    #[tokio::test]
    async fn serves_sessions_and_stops_them_on_shutdown() {
        let store = Arc::new(SqliteRecorder::open_in_memory().unwrap());
        // A session a previous run never closed.
        store.open_session(1, 3, "stale").unwrap();

        let server = TermServer::with_parts(config(), store.clone(), Arc::new(EchoConnector));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (addr, serving) = server
            .bind(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
        let serving = tokio::spawn(serving);

        let url = format!("ws://{addr}/api/terminal/3?token={TOKEN}");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
            .send(Message::Text("echo hi\n".to_string().into()))
            .await
            .unwrap();
        let reply = tokio::time::timeout(WAIT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.into_text().unwrap().as_str(), "echo hi\n");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(WAIT, serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let page = store.query_sessions(&SessionQuery::default()).unwrap();
        assert_eq!(page.total, 2);
        assert!(page
            .sessions
            .iter()
            .all(|s| s.status == SessionStatus::Closed));

        let live = page.sessions.iter().find(|s| s.token != "stale").unwrap();
        let ops = store.list_operations(live.id).unwrap();
        let kinds: Vec<_> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::SessionStart,
                OperationKind::Input,
                OperationKind::Output,
                OperationKind::SessionEnd,
            ]
        );
        assert_eq!(
            ops[3].content_lossy(),
            "Session terminated (server shutdown)"
        );
    }
}
