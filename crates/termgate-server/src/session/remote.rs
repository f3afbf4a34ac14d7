//! Remote interactive shells over SSH.
//!
//! A [`ShellConnector`] opens an authenticated transport to a host and hands
//! back a [`RemoteChannel`]; asking that channel for an interactive shell
//! yields a [`ShellHandle`], split into an input side ([`ShellWriter`]), an
//! output side ([`ShellOutput`]) and a termination future ([`ShellWaiter`]).
//!
//! The SSH channel itself is owned by a single driver task. The handle talks
//! to it over channels, so both pumps of a bridge can use their half without
//! sharing the channel.

use futures_util::future::BoxFuture;
use russh::client;
use russh::{ChannelMsg, Disconnect, Pty};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use termgate_core::{Credential, HostRecord, TermError, TermResult, TermSize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Output chunks buffered between the driver and the remote pump.
const OUTPUT_BUFFER: usize = 64;

const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Opens transports to remote hosts.
pub trait ShellConnector: Send + Sync {
    /// Connect and authenticate to `host`. Fails with [`TermError::Connect`].
    fn open<'a>(&'a self, host: &'a HostRecord) -> BoxFuture<'a, TermResult<Box<dyn RemoteChannel>>>;
}

/// An authenticated transport that has not started a shell yet.
pub trait RemoteChannel: Send {
    /// Allocate a PTY of `size` and start the login shell.
    ///
    /// Fails with [`TermError::Shell`]; the transport is released either way
    /// on failure.
    fn request_interactive_shell(
        self: Box<Self>,
        size: TermSize,
    ) -> BoxFuture<'static, TermResult<ShellHandle>>;
}

/// How a remote shell ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShellExit {
    /// Exit status, when the server reported one.
    pub code: Option<u32>,
}

/// Requests from a [`ShellWriter`] to the task that owns the shell.
#[derive(Debug)]
pub enum ShellCommand {
    Write {
        data: Vec<u8>,
        ack: oneshot::Sender<io::Result<usize>>,
    },
    Resize(TermSize),
}

/// A running interactive shell.
pub struct ShellHandle {
    pub writer: ShellWriter,
    pub output: ShellOutput,
    pub waiter: ShellWaiter,
}

/// The owning side of a [`ShellHandle`], held by whatever task drives the
/// actual shell.
pub struct ShellEndpoint {
    pub commands: mpsc::Receiver<ShellCommand>,
    pub output: mpsc::Sender<Vec<u8>>,
    pub exit: watch::Sender<Option<ShellExit>>,
    /// Flips to `true` once any writer asks for the shell to be released.
    pub closed: watch::Receiver<bool>,
}

impl ShellEndpoint {
    /// Forward one output chunk, giving up if the shell is being released.
    ///
    /// Returns `false` once the handle asked for close or dropped its output
    /// side.
    pub async fn forward(&mut self, chunk: Vec<u8>) -> bool {
        forward_output(&self.output, &mut self.closed, chunk).await
    }

    /// Resolves once the handle asked for close or every writer is gone.
    pub async fn close_requested(&mut self) {
        release_requested(&mut self.closed).await;
    }
}

/// Resolves once `closed` flips or its sender is gone. Yields nothing
/// borrowed, so `closed` is free again in the other `select!` arms.
async fn release_requested(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn forward_output(
    output: &mpsc::Sender<Vec<u8>>,
    closed: &mut watch::Receiver<bool>,
    chunk: Vec<u8>,
) -> bool {
    tokio::select! {
        sent = output.send(chunk) => sent.is_ok(),
        () = release_requested(closed) => false,
    }
}

impl ShellHandle {
    /// Create a connected handle/endpoint pair.
    pub fn channel(capacity: usize) -> (ShellHandle, ShellEndpoint) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (close_tx, close_rx) = watch::channel(false);

        let handle = ShellHandle {
            writer: ShellWriter {
                commands: command_tx,
                close: Arc::new(close_tx),
            },
            output: ShellOutput { rx: output_rx },
            waiter: ShellWaiter { exit: exit_rx },
        };
        let endpoint = ShellEndpoint {
            commands: command_rx,
            output: output_tx,
            exit: exit_tx,
            closed: close_rx,
        };
        (handle, endpoint)
    }
}

/// Input side of a shell. Cheap to clone.
#[derive(Clone)]
pub struct ShellWriter {
    commands: mpsc::Sender<ShellCommand>,
    close: Arc<watch::Sender<bool>>,
}

impl ShellWriter {
    /// Deliver `data` to the shell's stdin, returning once it was handed to
    /// the transport.
    pub async fn write(&self, data: &[u8]) -> TermResult<usize> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(ShellCommand::Write {
                data: data.to_vec(),
                ack,
            })
            .await
            .map_err(|_| TermError::Transport("remote shell closed".into()))?;
        match done.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TermError::Transport("remote shell closed".into())),
        }
    }

    /// Best effort window change. Failures are only logged.
    pub async fn resize(&self, size: TermSize) {
        if self.commands.send(ShellCommand::Resize(size)).await.is_err() {
            debug!(%size, "resize dropped, remote shell closed");
        }
    }

    /// Release the shell and its connection. Safe to call repeatedly.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }
}

/// Output side of a shell: stdout and stderr merged, in arrival order.
pub struct ShellOutput {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ShellOutput {
    /// Next chunk of output, or `None` once the remote side is done.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

pub struct ShellWaiter {
    exit: watch::Receiver<Option<ShellExit>>,
}

impl ShellWaiter {
    /// Resolves when the remote shell terminates.
    pub async fn wait(&mut self) -> ShellExit {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or_default(),
            // The driver went away without reporting, so the shell is gone.
            Err(_) => ShellExit::default(),
        }
    }
}

/// Host key checks are the inventory's concern; every key is accepted here.
struct SshClient;

#[async_trait::async_trait]
impl client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`ShellConnector`] backed by russh.
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// TCP connect, key exchange and authentication, bounded by the connect
    /// timeout.
    async fn connect(&self, host: &HostRecord) -> TermResult<client::Handle<SshClient>> {
        let addr = host.socket_addr();
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let attempt = async {
            let mut session = client::connect(config, addr.as_str(), SshClient)
                .await
                .map_err(|e| TermError::Connect(format!("{addr}: {e}")))?;
            authenticate(&mut session, host).await?;
            Ok::<_, TermError>(session)
        };

        let session = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| {
                TermError::Connect(format!(
                    "{addr}: timed out after {}s",
                    self.connect_timeout.as_secs_f32()
                ))
            })??;

        info!(host_id = host.id, addr = %addr, user = %host.username, "SSH connection established");
        Ok(session)
    }

    /// Run one command on a fresh connection and return its combined output.
    ///
    /// A non-zero exit status is an error. Not used by the bridge.
    pub async fn run_command(
        &self,
        host: &HostRecord,
        command: &str,
        timeout: Duration,
    ) -> TermResult<Vec<u8>> {
        let exchange = async {
            let session = self.connect(host).await?;
            let result = exec_collect(&session, command).await;
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            result
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TermError::Timeout)?
    }
}

impl ShellConnector for SshConnector {
    fn open<'a>(&'a self, host: &'a HostRecord) -> BoxFuture<'a, TermResult<Box<dyn RemoteChannel>>> {
        Box::pin(async move {
            let session = self.connect(host).await?;
            let channel = match session.channel_open_session().await {
                Ok(channel) => channel,
                Err(e) => {
                    release(&session).await;
                    return Err(TermError::Connect(format!("failed to open channel: {e}")));
                }
            };
            Ok(Box::new(SshChannel {
                session,
                channel,
                host_id: host.id,
            }) as Box<dyn RemoteChannel>)
        })
    }
}

async fn authenticate(session: &mut client::Handle<SshClient>, host: &HostRecord) -> TermResult<()> {
    let accepted = match &host.credential {
        Credential::Password(password) => session
            .authenticate_password(host.username.as_str(), password.as_str())
            .await
            .map_err(|e| TermError::Connect(format!("password auth failed: {e}")))?,
        Credential::PrivateKey { pem, passphrase } => {
            let key = russh_keys::decode_secret_key(pem, passphrase.as_deref())
                .map_err(|e| TermError::Connect(format!("failed to decode private key: {e}")))?;
            session
                .authenticate_publickey(host.username.as_str(), Arc::new(key))
                .await
                .map_err(|e| TermError::Connect(format!("public key auth failed: {e}")))?
        }
    };

    if !accepted {
        return Err(TermError::Connect(format!(
            "{} authentication rejected for {}@{}",
            host.credential.method(),
            host.username,
            host.address
        )));
    }
    Ok(())
}

async fn release(session: &client::Handle<SshClient>) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "SSH disconnect failed");
    }
}

async fn exec_collect(session: &client::Handle<SshClient>, command: &str) -> TermResult<Vec<u8>> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| TermError::Command(format!("failed to open channel: {e}")))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| TermError::Command(format!("failed to execute {command:?}: {e}")))?;

    let mut output = Vec::new();
    let mut exit_code = None;
    // Exit status may arrive after EOF, so read until the channel closes.
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                output.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
            Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    match exit_code {
        Some(code) if code != 0 => Err(TermError::Command(format!(
            "{command:?} exited with status {code}: {}",
            String::from_utf8_lossy(&output).trim_end()
        ))),
        _ => Ok(output),
    }
}

struct SshChannel {
    session: client::Handle<SshClient>,
    channel: russh::Channel<client::Msg>,
    host_id: u32,
}

impl RemoteChannel for SshChannel {
    fn request_interactive_shell(
        self: Box<Self>,
        size: TermSize,
    ) -> BoxFuture<'static, TermResult<ShellHandle>> {
        Box::pin(async move {
            let SshChannel {
                session,
                mut channel,
                host_id,
            } = *self;

            // Output can race ahead of the shell's success reply.
            let mut early = Vec::new();
            let started = start_shell(&mut channel, size, &mut early).await;
            if let Err(e) = started {
                release(&session).await;
                return Err(e);
            }

            debug!(host_id, %size, "interactive shell started");
            let (handle, endpoint) = ShellHandle::channel(OUTPUT_BUFFER);
            tokio::spawn(drive_shell(session, channel, endpoint, early, host_id));
            Ok(handle)
        })
    }
}

async fn start_shell(
    channel: &mut russh::Channel<client::Msg>,
    size: TermSize,
    early: &mut Vec<Vec<u8>>,
) -> TermResult<()> {
    channel
        .request_pty(
            true,
            "xterm",
            u32::from(size.cols),
            u32::from(size.rows),
            0,
            0,
            PTY_MODES,
        )
        .await
        .map_err(|e| TermError::Shell(format!("PTY request failed: {e}")))?;
    await_reply(channel, early, "PTY request").await?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| TermError::Shell(format!("shell request failed: {e}")))?;
    await_reply(channel, early, "shell request").await
}

async fn await_reply(
    channel: &mut russh::Channel<client::Msg>,
    early: &mut Vec<Vec<u8>>,
    what: &str,
) -> TermResult<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(TermError::Shell(format!("{what} rejected by server")))
            }
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                early.push(data.to_vec());
            }
            Some(ChannelMsg::Close) | None => {
                return Err(TermError::Shell(format!("channel closed during {what}")))
            }
            _ => {}
        }
    }
}

/// Owns the SSH channel for the lifetime of the shell.
async fn drive_shell(
    session: client::Handle<SshClient>,
    mut channel: russh::Channel<client::Msg>,
    endpoint: ShellEndpoint,
    early: Vec<Vec<u8>>,
    host_id: u32,
) {
    let ShellEndpoint {
        mut commands,
        output,
        exit,
        mut closed,
    } = endpoint;
    let mut exit_code = None;
    let mut released = false;

    for chunk in early {
        if !forward_output(&output, &mut closed, chunk).await {
            released = true;
            break;
        }
    }

    while !released {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if !forward_output(&output, &mut closed, data.to_vec()).await {
                        released = true;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            },
            command = commands.recv() => match command {
                Some(ShellCommand::Write { data, ack }) => {
                    let result = channel
                        .data(&data[..])
                        .await
                        .map(|()| data.len())
                        .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()));
                    let _ = ack.send(result);
                }
                Some(ShellCommand::Resize(size)) => {
                    if let Err(e) = channel
                        .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                        .await
                    {
                        warn!(host_id, %size, error = %e, "window change failed");
                    }
                }
                None => released = true,
            },
            () = release_requested(&mut closed) => released = true,
        }
    }

    // Drop the output sender first so the remote pump sees end of stream.
    drop(output);
    let _ = channel.close().await;
    release(&session).await;
    debug!(host_id, exit_code = ?exit_code, released, "SSH shell finished");
    exit.send_replace(Some(ShellExit { code: exit_code }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn host_at(port: u16) -> HostRecord {
        HostRecord {
            id: 1,
            name: "local".into(),
            address: "127.0.0.1".into(),
            port,
            username: "nobody".into(),
            credential: Credential::Password("secret".into()),
        }
    }

    #[tokio::test]
    async fn writer_round_trip_through_endpoint() {
        let (handle, mut endpoint) = ShellHandle::channel(4);
        let ShellHandle {
            writer,
            mut output,
            mut waiter,
        } = handle;

        let shell = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(command) = endpoint.commands.recv().await {
                match command {
                    ShellCommand::Write { data, ack } => {
                        let _ = ack.send(Ok(data.len()));
                        endpoint.forward(data).await;
                    }
                    ShellCommand::Resize(size) => seen.push(size),
                }
                if seen.len() == 1 {
                    break;
                }
            }
            endpoint.exit.send_replace(Some(ShellExit { code: Some(0) }));
            seen
        });

        assert_eq!(writer.write(b"echo hi\n").await.unwrap(), 8);
        assert_eq!(output.next_chunk().await.unwrap(), b"echo hi\n");
        writer.resize(TermSize::new(120, 30)).await;

        assert_eq!(waiter.wait().await, ShellExit { code: Some(0) });
        assert_eq!(shell.await.unwrap(), vec![TermSize::new(120, 30)]);
        // Driver is gone, so writes fail instead of hanging.
        assert!(writer.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observed() {
        let (handle, mut endpoint) = ShellHandle::channel(4);
        let writer = handle.writer.clone();
        assert!(!writer.is_closed());

        writer.close();
        writer.close();
        handle.writer.close();
        assert!(writer.is_closed());

        tokio::time::timeout(Duration::from_secs(1), endpoint.close_requested())
            .await
            .unwrap();
        // Nobody reads output, so a full buffer must not wedge the driver.
        let flood = async {
            for _ in 0..8 {
                endpoint.forward(b"dropped".to_vec()).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), flood).await.unwrap();
        drop(handle);
    }

    #[tokio::test]
    async fn release_interrupts_blocked_forward_and_stays_observable() {
        let (mut handle, mut endpoint) = ShellHandle::channel(1);
        assert!(endpoint.forward(b"fills".to_vec()).await);

        // Second chunk blocks on the full buffer until the handle closes.
        let writer = handle.writer.clone();
        let blocked = tokio::spawn(async move {
            let delivered = endpoint.forward(b"stuck".to_vec()).await;
            (delivered, endpoint)
        });
        tokio::task::yield_now().await;
        writer.close();
        let (delivered, mut endpoint) = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(!delivered);

        // Same receiver keeps reporting release to later waiters.
        tokio::time::timeout(Duration::from_secs(1), endpoint.close_requested())
            .await
            .unwrap();
        assert!(!endpoint.forward(b"late".to_vec()).await);
        assert_eq!(handle.output.next_chunk().await.unwrap(), b"fills");
    }

    #[tokio::test]
    async fn waiter_resolves_when_driver_vanishes() {
        let (handle, endpoint) = ShellHandle::channel(4);
        let mut waiter = handle.waiter;
        drop(endpoint);
        assert_eq!(waiter.wait().await, ShellExit { code: None });
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = SshConnector::new(Duration::from_secs(5));
        let err = match connector.open(&host_at(port)).await {
            Err(e) => e,
            Ok(_) => panic!("connect to a closed port succeeded"),
        };
        assert!(matches!(err, TermError::Connect(_)), "got {err:?}");
        assert!(err.is_setup_failure());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // Accepts TCP but never speaks SSH.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let connector = SshConnector::new(Duration::from_millis(200));
        let err = match connector.open(&host_at(port)).await {
            Err(e) => e,
            Ok(_) => panic!("handshake with a silent server succeeded"),
        };
        match err {
            TermError::Connect(msg) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("expected connect error, got {other:?}"),
        }
    }
}
