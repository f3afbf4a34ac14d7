//! termgate-core: Shared protocol library for the terminal bridge.
//!
//! Provides client frame classification, host records, audit record types,
//! session tokens and the error taxonomy used by the server.

pub mod audit;
pub mod error;
pub mod frame;
pub mod host;
pub mod token;

// Re-export commonly used items at crate root.
pub use audit::{
    AuditOperation, AuditSession, OperationKind, SessionPage, SessionQuery, SessionStatus,
};
pub use error::{AuditError, AuditResult, TermError, TermResult};
pub use frame::{ClientFrame, TermSize};
pub use host::{Credential, HostRecord};
pub use token::generate_session_token;
