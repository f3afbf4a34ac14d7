//! WebSocket listener using tokio-tungstenite.
//!
//! Upgrade requests are admitted (or rejected with an HTTP status) inside the
//! handshake callback. Accepted sockets are split into a [`ClientLink`] and
//! handed to the server together with their [`SessionGrant`].

use super::{ClientLink, ClientSink, ClientSource};
use crate::auth::{AdmissionGate, SessionGrant};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use termgate_core::{TermError, TermResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Default cap on inbound message size (1 MiB).
pub const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

/// An upgraded, admitted terminal connection.
pub struct UpgradedConnection {
    pub link: ClientLink,
    pub grant: SessionGrant,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields admitted
/// connections. The accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    gate: Arc<AdmissionGate>,
    max_message_size: usize,
) -> TermResult<(SocketAddr, mpsc::Receiver<UpgradedConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TermError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<UpgradedConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = tcp_listener.accept() => accepted,
                _ = tx.closed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    tokio::spawn(async move {
                        if let Some(conn) = upgrade(stream, addr, &gate, max_message_size).await {
                            if tx.send(conn).await.is_err() {
                                warn!("WebSocket connection channel closed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    gate: &AdmissionGate,
    max_message_size: usize,
) -> Option<UpgradedConnection> {
    let mut grant = None;
    let callback = |request: &Request, response: Response| match gate.admit(request) {
        Ok(admitted) => {
            grant = Some(admitted);
            Ok(response)
        }
        Err(rejection) => {
            info!(
                remote = %addr,
                path = %request.uri().path(),
                status = rejection.status.as_u16(),
                reason = %rejection.body,
                "terminal request rejected"
            );
            Err(rejection.into_response())
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!(remote = %addr, error = %e, "WebSocket handshake failed");
            return None;
        }
    };
    let grant = grant?;

    debug!(remote = %addr, host_id = grant.host.id, "WebSocket connection accepted");
    let (sink, stream) = ws_stream.split();
    let link = ClientLink::new(
        Box::new(WsSource {
            stream,
            max_message_size,
        }),
        Box::new(WsSink { sink }),
    );
    Some(UpgradedConnection {
        link,
        grant,
        remote_addr: addr,
    })
}

struct WsSource {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_message_size: usize,
}

impl ClientSource for WsSource {
    fn next_message(&mut self) -> BoxFuture<'_, TermResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            loop {
                let data = match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(TermError::Transport(format!("WS recv failed: {e}")));
                    }
                };
                if data.len() > self.max_message_size {
                    return Err(TermError::InvalidMessage(format!(
                        "WS message too large: {} bytes (max {})",
                        data.len(),
                        self.max_message_size
                    )));
                }
                return Ok(Some(data));
            }
        })
    }
}

struct WsSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl ClientSink for WsSink {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, TermResult<()>> {
        Box::pin(async move {
            let message = match std::str::from_utf8(data) {
                Ok(text) => Message::Text(text.to_string().into()),
                Err(_) => Message::Binary(data.to_vec().into()),
            };
            self.sink
                .send(message)
                .await
                .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn send_text<'a>(&'a mut self, text: &'a str) -> BoxFuture<'a, TermResult<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Text(text.to_string().into()))
                .await
                .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, TermResult<()>> {
        Box::pin(async move {
            SinkExt::close(&mut self.sink)
                .await
                .map_err(|e| TermError::Transport(format!("WS close failed: {e}")))
        })
    }
}
