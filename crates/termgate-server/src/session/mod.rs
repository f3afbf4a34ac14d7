//! Terminal sessions: the remote shell, the audit journal and the bridge
//! between them and a client.

pub mod bridge;
pub mod journal;
pub mod remote;

pub use bridge::SessionBridge;
pub use remote::{ShellConnector, SshConnector};
