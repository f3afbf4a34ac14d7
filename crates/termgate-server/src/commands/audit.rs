//! `sessions` / `operations` / `delete-session`: audit queries against the
//! configured store.

use crate::audit::{AuditRecorder, SqliteRecorder};
use crate::config::ServerConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt::Write as _;
use termgate_core::{AuditOperation, SessionPage, SessionQuery};

/// Longest operation content shown before it is cut.
const PREVIEW_LEN: usize = 60;

fn open_store(config: &ServerConfig) -> Result<SqliteRecorder> {
    SqliteRecorder::open(&config.database)
        .with_context(|| format!("failed to open audit store {}", config.database.display()))
}

/// List sessions matching `query`, newest first.
pub fn run_sessions(config: &ServerConfig, query: SessionQuery, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let page = store
        .query_sessions(&query)
        .context("failed to query sessions")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        print!("{}", render_sessions(&page));
    }
    Ok(())
}

/// Print every operation of one session in order.
///
/// JSON output keeps content as raw byte arrays, since recorded content is
/// not guaranteed to be UTF-8.
pub fn run_operations(config: &ServerConfig, session_id: i64, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let ops = store
        .list_operations(session_id)
        .with_context(|| format!("failed to list operations of session {session_id}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ops)?);
    } else {
        print!("{}", render_operations(&ops));
    }
    Ok(())
}

pub fn run_delete(config: &ServerConfig, session_id: i64) -> Result<()> {
    let store = open_store(config)?;
    let deleted = store
        .delete_session(session_id)
        .with_context(|| format!("failed to delete session {session_id}"))?;
    if !deleted {
        anyhow::bail!("no session with id {session_id}");
    }
    println!("Deleted session {session_id} and its operations.");
    Ok(())
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_time(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| format!("expected RFC 3339 time or YYYY-MM-DD, got '{value}'"))
}

fn render_sessions(page: &SessionPage) -> String {
    let mut out = String::new();
    if page.sessions.is_empty() {
        let _ = writeln!(out, "No sessions found.");
        return out;
    }

    let _ = writeln!(
        out,
        "{:<8} {:<8} {:<8} {:<8} {:<20} {}",
        "ID", "USER", "HOST", "STATUS", "STARTED", "ENDED"
    );
    let _ = writeln!(
        out,
        "{:<8} {:<8} {:<8} {:<8} {:<20} {}",
        "──", "────", "────", "──────", "───────", "─────"
    );
    for s in &page.sessions {
        let ended = s
            .end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:<8} {:<8} {:<20} {}",
            s.id,
            s.user_id,
            s.host_id,
            s.status,
            s.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            ended
        );
    }

    let pages = page.total.div_ceil(u64::from(page.page_size.max(1)));
    let _ = writeln!(
        out,
        "\n{} session(s), page {} of {}.",
        page.total,
        page.page,
        pages.max(1)
    );
    out
}

fn render_operations(ops: &[AuditOperation]) -> String {
    let mut out = String::new();
    if ops.is_empty() {
        let _ = writeln!(out, "No operations recorded.");
        return out;
    }

    let _ = writeln!(out, "{:<26} {:<14} {}", "TIME", "KIND", "CONTENT");
    let _ = writeln!(out, "{:<26} {:<14} {}", "────", "────", "───────");
    for op in ops {
        let _ = writeln!(
            out,
            "{:<26} {:<14} {}",
            op.timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            op.kind,
            preview(&op.content_lossy())
        );
    }
    let _ = writeln!(out, "\n{} operation(s).", ops.len());
    out
}

/// Single-line, escaped, length-capped rendering of recorded content.
fn preview(content: &str) -> String {
    let escaped: String = content.escape_debug().collect();
    if escaped.chars().count() > PREVIEW_LEN {
        let cut: String = escaped.chars().take(PREVIEW_LEN).collect();
        format!("{cut}...")
    } else {
        escaped
    }
}
