//! Durable audit trail of terminal sessions.
//!
//! The recorder is shared process-wide by every live bridge and by the audit
//! CLI commands. Implementations must accept concurrent writers keyed by
//! distinct session tokens.

pub mod sqlite;

pub use sqlite::SqliteRecorder;

use termgate_core::{
    AuditOperation, AuditResult, AuditSession, OperationKind, SessionPage, SessionQuery,
};

pub trait AuditRecorder: Send + Sync {
    /// Create an active session row keyed by `token`.
    fn open_session(&self, user_id: u32, host_id: u32, token: &str) -> AuditResult<AuditSession>;

    /// Mark the session closed and stamp its end time.
    ///
    /// Returns `true` only for the call that performed the transition; closing
    /// an already-closed or unknown token is a no-op.
    fn close_session(&self, token: &str) -> AuditResult<bool>;

    /// Append one event to the session keyed by `token`.
    fn record_operation(&self, token: &str, kind: OperationKind, content: &[u8])
        -> AuditResult<()>;

    /// Sessions matching the filters, newest first.
    fn query_sessions(&self, query: &SessionQuery) -> AuditResult<SessionPage>;

    /// Events of one session in playback order. Unknown sessions yield nothing.
    fn list_operations(&self, session_id: i64) -> AuditResult<Vec<AuditOperation>>;

    /// Delete a session together with its events.
    fn delete_session(&self, session_id: i64) -> AuditResult<bool>;

    /// Close sessions left active by a process that never tore them down.
    fn close_orphaned_sessions(&self) -> AuditResult<usize>;
}
