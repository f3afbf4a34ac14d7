//! The session bridge: one client link wired to one remote shell.
//!
//! A running bridge is two pump tasks plus the task that called
//! [`SessionBridge::run`]:
//!
//! - the client pump reads client messages, applies resize frames and forwards
//!   everything else to the shell's input;
//! - the remote pump forwards shell output to the client;
//! - the orchestrator waits for the shell to exit, a pump to give up, or the
//!   server to stop.
//!
//! Whoever notices the end first stops the session through [`Teardown`]; the
//! first reason wins. The orchestrator then waits for both pumps and only
//! after that writes `session_end`, so nothing is recorded behind it.

use super::journal::SessionJournal;
use super::remote::{ShellConnector, ShellHandle, ShellOutput, ShellWriter};
use crate::audit::AuditRecorder;
use crate::transport::{ClientLink, ClientSink, ClientSource};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use termgate_core::frame::resize_description;
use termgate_core::{ClientFrame, HostRecord, OperationKind, TermError, TermResult, TermSize};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a finished shell's remaining output may take to reach the client.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopped pump may take to notice before it is aborted.
const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The remote shell exited, with its status if the server sent one.
    RemoteExit(Option<u32>),
    RemoteWriteFailed,
    ClientClosed,
    ClientReadFailed,
    ClientWriteFailed,
    ServerShutdown,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::RemoteExit(Some(code)) => write!(f, "remote exited with status {code}"),
            Termination::RemoteExit(None) => f.write_str("remote closed"),
            Termination::RemoteWriteFailed => f.write_str("remote write failed"),
            Termination::ClientClosed => f.write_str("client disconnected"),
            Termination::ClientReadFailed => f.write_str("client read failed"),
            Termination::ClientWriteFailed => f.write_str("client write failed"),
            Termination::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

pub struct SessionBridge {
    recorder: Arc<dyn AuditRecorder>,
    connector: Arc<dyn ShellConnector>,
    /// Flips to `true` when the whole server is stopping.
    server_shutdown: watch::Receiver<bool>,
}

impl SessionBridge {
    pub fn new(
        recorder: Arc<dyn AuditRecorder>,
        connector: Arc<dyn ShellConnector>,
        server_shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            recorder,
            connector,
            server_shutdown,
        }
    }

    /// Run one terminal session to completion.
    ///
    /// Setup failures are reported once to the client and returned as errors;
    /// every other ending is a [`Termination`].
    pub async fn run(
        &self,
        link: ClientLink,
        host: &HostRecord,
        user_id: u32,
    ) -> TermResult<Termination> {
        let journal = Arc::new(SessionJournal::open(self.recorder.clone(), user_id, host.id));
        let ClientLink { source, mut sink } = link;

        // Shutdown interrupts setup too.
        let mut server_shutdown = self.server_shutdown.clone();
        let established = tokio::select! {
            shell = self.establish(host) => shell,
            () = server_stopping(&mut server_shutdown) => {
                Err(TermError::Connect("server is shutting down".into()))
            }
        };
        let shell = match established {
            Ok(shell) => shell,
            Err(e) => {
                let diagnostic = setup_diagnostic(&e);
                warn!(session = %journal.token(), host_id = host.id, error = %e, "terminal setup failed");
                if let Err(send_err) = sink.send_text(&diagnostic).await {
                    debug!(error = %send_err, "could not deliver setup diagnostic");
                }
                journal.record(OperationKind::Error, diagnostic.as_bytes());
                journal.close();
                if let Err(close_err) = sink.close().await {
                    debug!(error = %close_err, "client close failed");
                }
                return Err(e);
            }
        };

        journal.record(
            OperationKind::SessionStart,
            host.connected_description().as_bytes(),
        );
        info!(
            session = %journal.token(),
            host_id = host.id,
            user_id,
            recording = journal.is_recording(),
            "terminal session started"
        );

        let ShellHandle {
            writer,
            output,
            mut waiter,
        } = shell;
        let teardown = Arc::new(Teardown::new(writer.clone(), journal.clone()));
        let mut stopped = teardown.subscribe();

        let client_pump = tokio::spawn(client_pump(
            source,
            writer,
            journal.clone(),
            teardown.clone(),
        ));
        let mut remote_pump = Some(tokio::spawn(remote_pump(
            output,
            sink,
            journal,
            teardown.clone(),
        )));

        let reason = tokio::select! {
            exit = waiter.wait() => Termination::RemoteExit(exit.code),
            stop = stopped.wait_for(Option::is_some) => match stop {
                Ok(reason) => (*reason).unwrap_or(Termination::ClientClosed),
                Err(_) => Termination::ClientClosed,
            },
            () = server_stopping(&mut server_shutdown) => Termination::ServerShutdown,
        };

        if matches!(reason, Termination::RemoteExit(_)) {
            // Let the remote pump deliver what the shell printed before it
            // went away.
            if let Some(mut pump) = remote_pump.take() {
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await {
                    Ok(Err(e)) => warn!(pump = "remote", error = %e, "pump task failed"),
                    Ok(Ok(())) => {}
                    Err(_) => {
                        debug!("remote output drain timed out");
                        remote_pump = Some(pump);
                    }
                }
            }
        }

        let reason = teardown.stop(reason);
        join_pump(client_pump, "client").await;
        if let Some(pump) = remote_pump {
            join_pump(pump, "remote").await;
        }
        Ok(teardown.finish(reason).await)
    }

    async fn establish(&self, host: &HostRecord) -> TermResult<ShellHandle> {
        let channel = self.connector.open(host).await?;
        channel.request_interactive_shell(TermSize::DEFAULT).await
    }
}

/// The one message a client sees when its session never started.
fn setup_diagnostic(err: &TermError) -> String {
    match err {
        TermError::Shell(detail) => format!("Shell startup failed: {detail}"),
        TermError::Connect(detail) => format!("SSH connection failed: {detail}"),
        other => format!("SSH connection failed: {other}"),
    }
}

async fn server_stopping(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody will ever ask us to stop.
    if shutdown.wait_for(|stopping| *stopping).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Wait for a stopped pump. One that hangs is aborted, so it cannot record
/// anything once this returns.
async fn join_pump(mut pump: JoinHandle<()>, which: &str) {
    match tokio::time::timeout(PUMP_STOP_TIMEOUT, &mut pump).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(pump = which, error = %e, "pump task failed"),
        Err(_) => {
            warn!(pump = which, "pump ignored stop, aborting");
            pump.abort();
            let _ = pump.await;
        }
    }
}

/// Session shutdown shared by the pumps and the orchestrator.
///
/// Anyone may [`stop`](Teardown::stop) the session. Only the orchestrator
/// calls [`finish`](Teardown::finish), after both pumps are gone.
pub(crate) struct Teardown {
    done: OnceCell<Termination>,
    stopping: watch::Sender<Option<Termination>>,
    writer: ShellWriter,
    journal: Arc<SessionJournal>,
}

impl Teardown {
    pub(crate) fn new(writer: ShellWriter, journal: Arc<SessionJournal>) -> Self {
        Self {
            done: OnceCell::new(),
            stopping: watch::channel(None).0,
            writer,
            journal,
        }
    }

    /// Observes the reason once teardown has started.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Termination>> {
        self.stopping.subscribe()
    }

    /// Signal both pumps and release the shell. Records nothing. Returns the
    /// reason of whichever call came first.
    pub(crate) fn stop(&self, reason: Termination) -> Termination {
        let mut first = reason;
        self.stopping.send_if_modified(|current| match current {
            Some(earlier) => {
                first = *earlier;
                false
            }
            None => {
                *current = Some(reason);
                true
            }
        });
        self.writer.close();
        first
    }

    /// Write `session_end` and close the session, once. Callers must have
    /// joined both pumps first.
    pub(crate) async fn finish(&self, reason: Termination) -> Termination {
        let reason = self.stop(reason);
        *self
            .done
            .get_or_init(|| async {
                self.journal.record(
                    OperationKind::SessionEnd,
                    format!("Session terminated ({reason})").as_bytes(),
                );
                self.journal.close();
                info!(session = %self.journal.token(), %reason, "terminal session ended");
                reason
            })
            .await
    }
}

async fn until_stopped(stop: &mut watch::Receiver<Option<Termination>>) {
    let _ = stop.wait_for(Option::is_some).await;
}

/// Client → remote. Message N, including its audit record, is fully handled
/// before message N+1 is read.
async fn client_pump(
    mut source: Box<dyn ClientSource>,
    writer: ShellWriter,
    journal: Arc<SessionJournal>,
    teardown: Arc<Teardown>,
) {
    let mut stop = teardown.subscribe();
    let reason = loop {
        let message = tokio::select! {
            message = source.next_message() => message,
            _ = until_stopped(&mut stop) => return,
        };
        match message {
            Ok(Some(message)) => match ClientFrame::classify(message) {
                ClientFrame::Resize(size) => {
                    writer.resize(size).await;
                    journal.record(OperationKind::Resize, resize_description(size).as_bytes());
                }
                ClientFrame::Input(data) => {
                    journal.record(OperationKind::Input, &data);
                    let written = tokio::select! {
                        written = writer.write(&data) => written,
                        _ = until_stopped(&mut stop) => return,
                    };
                    if let Err(e) = written {
                        debug!(session = %journal.token(), error = %e, "remote write failed");
                        break Termination::RemoteWriteFailed;
                    }
                }
            },
            Ok(None) => break Termination::ClientClosed,
            Err(e) => {
                debug!(session = %journal.token(), error = %e, "client read failed");
                break Termination::ClientReadFailed;
            }
        }
    };
    teardown.stop(reason);
}

/// Remote → client. Closes the client link on the way out.
async fn remote_pump(
    mut output: ShellOutput,
    mut sink: Box<dyn ClientSink>,
    journal: Arc<SessionJournal>,
    teardown: Arc<Teardown>,
) {
    let mut stop = teardown.subscribe();
    loop {
        let chunk = tokio::select! {
            chunk = output.next_chunk() => chunk,
            _ = until_stopped(&mut stop) => break,
        };
        let Some(chunk) = chunk else { break };

        journal.record(OperationKind::Output, &chunk);
        let sent = tokio::select! {
            sent = sink.send(&chunk) => sent,
            _ = until_stopped(&mut stop) => break,
        };
        if let Err(e) = sent {
            debug!(session = %journal.token(), error = %e, "client write failed");
            teardown.stop(Termination::ClientWriteFailed);
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(session = %journal.token(), error = %e, "client close failed");
    }
}
