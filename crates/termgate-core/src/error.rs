use thiserror::Error;

/// Errors produced by the terminal bridge and its collaborators.
#[derive(Debug, Error)]
pub enum TermError {
    /// Reaching or authenticating to the remote host failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// The remote side rejected PTY allocation or shell startup.
    #[error("shell error: {0}")]
    Shell(String),

    /// A one-shot remote command failed or exited non-zero.
    #[error("command failed: {0}")]
    Command(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl TermError {
    /// Whether this error happened while the session was being set up
    /// (as opposed to a steady-state I/O failure).
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, TermError::Connect(_) | TermError::Shell(_) | TermError::Timeout)
    }
}

pub type TermResult<T> = Result<T, TermError>;

/// Errors produced by the audit store.
///
/// These never interrupt a live session; the bridge logs and drops them.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    Store(String),

    #[error("audit session not found: {0}")]
    SessionNotFound(String),
}

pub type AuditResult<T> = Result<T, AuditError>;
