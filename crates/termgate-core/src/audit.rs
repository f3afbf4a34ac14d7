//! Audit record types shared by the recorder, the bridge and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of an audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SessionStart,
    Input,
    Output,
    Resize,
    Error,
    SessionEnd,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::SessionStart => "session_start",
            OperationKind::Input => "input",
            OperationKind::Output => "output",
            OperationKind::Resize => "resize",
            OperationKind::Error => "error",
            OperationKind::SessionEnd => "session_end",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_start" => Ok(OperationKind::SessionStart),
            "input" => Ok(OperationKind::Input),
            "output" => Ok(OperationKind::Output),
            "resize" => Ok(OperationKind::Resize),
            "error" => Ok(OperationKind::Error),
            "session_end" => Ok(OperationKind::SessionEnd),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One terminal session as stored by the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSession {
    /// Store-assigned row id, used by the query interface.
    pub id: i64,
    /// Bridge-generated token correlating live events to this row.
    pub token: String,
    pub user_id: u32,
    pub host_id: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

impl AuditSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// One recorded event. Content is opaque and stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOperation {
    pub id: i64,
    pub session_id: i64,
    pub kind: OperationKind,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl AuditOperation {
    /// Content rendered for display; invalid UTF-8 is replaced, not rejected.
    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Filters and paging for session listings. `None` filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuery {
    pub user_id: Option<u32>,
    pub host_id: Option<u32>,
    /// Inclusive lower bound on start time.
    pub started_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on start time.
    pub started_before: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
}

impl SessionQuery {
    /// Clamp paging to sane values: page starts at 1, empty page size means
    /// the default.
    pub fn normalized(mut self) -> Self {
        if self.page < 1 {
            self.page = 1;
        }
        if self.page_size < 1 {
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        self
    }

    /// Row offset of the first session on this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPage {
    pub sessions: Vec<AuditSession>,
    /// Total number of sessions matching the filters, across all pages.
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}
