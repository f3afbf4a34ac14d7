//! Client-facing duplex links.
//!
//! A [`ClientLink`] is split in two so that each bridge pump owns exactly one
//! direction: the client pump reads the [`ClientSource`], the remote pump
//! writes the [`ClientSink`].

pub mod websocket;

use futures_util::future::BoxFuture;
use termgate_core::TermResult;

/// Inbound half of a client link.
pub trait ClientSource: Send {
    /// Next message from the client, `None` once it closed the link.
    fn next_message(&mut self) -> BoxFuture<'_, TermResult<Option<Vec<u8>>>>;
}

/// Outbound half of a client link.
pub trait ClientSink: Send {
    /// Send raw terminal output. Valid UTF-8 goes out as a text frame,
    /// anything else as binary.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, TermResult<()>>;

    /// Send a human-readable text message.
    fn send_text<'a>(&'a mut self, text: &'a str) -> BoxFuture<'a, TermResult<()>>;

    /// Start the close handshake.
    fn close(&mut self) -> BoxFuture<'_, TermResult<()>>;
}

pub struct ClientLink {
    pub source: Box<dyn ClientSource>,
    pub sink: Box<dyn ClientSink>,
}

impl ClientLink {
    pub fn new(source: Box<dyn ClientSource>, sink: Box<dyn ClientSink>) -> Self {
        Self { source, sink }
    }
}
