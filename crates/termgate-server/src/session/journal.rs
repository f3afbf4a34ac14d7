//! Per-session audit journal.
//!
//! Wraps the shared recorder for one bridge. If the session row could not be
//! opened the journal stays silent for the rest of the session, and every
//! store failure is logged and dropped; the terminal never waits on audit.

use crate::audit::AuditRecorder;
use std::sync::Arc;
use termgate_core::{generate_session_token, OperationKind};
use tracing::{debug, warn};

pub struct SessionJournal {
    recorder: Arc<dyn AuditRecorder>,
    token: String,
    /// Whether the session row exists.
    opened: bool,
}

impl SessionJournal {
    /// Generate a fresh token and open its session row.
    pub fn open(recorder: Arc<dyn AuditRecorder>, user_id: u32, host_id: u32) -> Self {
        let token = generate_session_token();
        let opened = match recorder.open_session(user_id, host_id, &token) {
            Ok(session) => {
                debug!(session = %token, audit_id = session.id, "audit journal opened");
                true
            }
            Err(e) => {
                warn!(session = %token, error = %e, "audit session unavailable, not recording");
                false
            }
        };
        Self {
            recorder,
            token,
            opened,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_recording(&self) -> bool {
        self.opened
    }

    /// Append an event. Errors are logged but do not propagate.
    pub fn record(&self, kind: OperationKind, content: &[u8]) {
        if !self.opened {
            return;
        }
        if let Err(e) = self.recorder.record_operation(&self.token, kind, content) {
            warn!(session = %self.token, kind = %kind, error = %e, "failed to record operation");
        }
    }

    /// Close the session row. Returns whether this call closed it.
    pub fn close(&self) -> bool {
        if !self.opened {
            return false;
        }
        match self.recorder.close_session(&self.token) {
            Ok(closed) => closed,
            Err(e) => {
                warn!(session = %self.token, error = %e, "failed to close audit session");
                false
            }
        }
    }
}
