//! SQLite-backed audit recorder.
//!
//! One connection serialized behind a mutex. Timestamps are stored as unix
//! microseconds; operation order ties are broken by row id, which SQLite
//! assigns monotonically.

use super::AuditRecorder;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use termgate_core::{
    AuditError, AuditOperation, AuditResult, AuditSession, OperationKind, SessionPage,
    SessionQuery, SessionStatus,
};
use tracing::{debug, info};

const SESSION_COLUMNS: &str =
    "id, session_token, user_id, host_id, start_time, end_time, status";

pub struct SqliteRecorder {
    conn: Mutex<Connection>,
}

impl SqliteRecorder {
    /// Open or create the audit database at `path`.
    pub fn open(path: &Path) -> AuditResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuditError::Store(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(store_err)?;
        let recorder = Self::with_connection(conn)?;
        info!(path = %path.display(), "audit store opened");
        Ok(recorder)
    }

    /// Throwaway store, used by tests.
    pub fn open_in_memory() -> AuditResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn with_connection(conn: Connection) -> AuditResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AuditResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Store("connection mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> AuditResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS terminal_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_token TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            host_id INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            status TEXT NOT NULL CHECK(status IN ('active', 'closed'))
        );

        CREATE TABLE IF NOT EXISTS terminal_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES terminal_sessions(id),
            kind TEXT NOT NULL,
            content BLOB NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_start
            ON terminal_sessions(start_time DESC);
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON terminal_sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_host
            ON terminal_sessions(host_id);
        CREATE INDEX IF NOT EXISTS idx_operations_session
            ON terminal_operations(session_id, timestamp);
        "#,
    )
    .map_err(store_err)
}

fn store_err(e: rusqlite::Error) -> AuditError {
    AuditError::Store(e.to_string())
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AuditSession> {
    Ok(AuditSession {
        id: row.get(0)?,
        token: row.get(1)?,
        user_id: row.get(2)?,
        host_id: row.get(3)?,
        start_time: from_micros(row.get(4)?),
        end_time: row.get::<_, Option<i64>>(5)?.map(from_micros),
        status: parse_column(6, row.get(6)?)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<AuditOperation> {
    Ok(AuditOperation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: parse_column(2, row.get(2)?)?,
        content: row.get(3)?,
        timestamp: from_micros(row.get(4)?),
    })
}

impl AuditRecorder for SqliteRecorder {
    fn open_session(&self, user_id: u32, host_id: u32, token: &str) -> AuditResult<AuditSession> {
        let conn = self.lock()?;
        let start = now_micros();
        conn.execute(
            "INSERT INTO terminal_sessions (session_token, user_id, host_id, start_time, status)
             VALUES (?1, ?2, ?3, ?4, 'active')",
            params![token, user_id, host_id, start],
        )
        .map_err(store_err)?;

        debug!(session = %token, user_id, host_id, "audit session opened");
        Ok(AuditSession {
            id: conn.last_insert_rowid(),
            token: token.to_string(),
            user_id,
            host_id,
            start_time: from_micros(start),
            end_time: None,
            status: SessionStatus::Active,
        })
    }

    fn close_session(&self, token: &str) -> AuditResult<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE terminal_sessions SET status = 'closed', end_time = ?1
                 WHERE session_token = ?2 AND status = 'active'",
                params![now_micros(), token],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn record_operation(
        &self,
        token: &str,
        kind: OperationKind,
        content: &[u8],
    ) -> AuditResult<()> {
        let conn = self.lock()?;
        let session_id: i64 = conn
            .query_row(
                "SELECT id FROM terminal_sessions WHERE session_token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?
            .ok_or_else(|| AuditError::SessionNotFound(token.to_string()))?;

        conn.execute(
            "INSERT INTO terminal_operations (session_id, kind, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, kind.as_str(), content, now_micros()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn query_sessions(&self, query: &SessionQuery) -> AuditResult<SessionPage> {
        let query = query.clone().normalized();

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(user_id) = query.user_id {
            clauses.push("user_id = ?");
            values.push(Value::Integer(i64::from(user_id)));
        }
        if let Some(host_id) = query.host_id {
            clauses.push("host_id = ?");
            values.push(Value::Integer(i64::from(host_id)));
        }
        if let Some(after) = query.started_after {
            clauses.push("start_time >= ?");
            values.push(Value::Integer(after.timestamp_micros()));
        }
        if let Some(before) = query.started_before {
            clauses.push("start_time <= ?");
            values.push(Value::Integer(before.timestamp_micros()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let conn = self.lock()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM terminal_sessions{filter}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(store_err)?;

        let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);
        let mut paged = values;
        paged.push(Value::Integer(i64::from(query.page_size)));
        paged.push(Value::Integer(offset));

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM terminal_sessions{filter}
                 ORDER BY start_time DESC, id DESC LIMIT ? OFFSET ?"
            ))
            .map_err(store_err)?;
        let sessions = stmt
            .query_map(params_from_iter(paged.iter()), session_from_row)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        Ok(SessionPage {
            sessions,
            total: u64::try_from(total).unwrap_or(0),
            page: query.page,
            page_size: query.page_size,
        })
    }

    fn list_operations(&self, session_id: i64) -> AuditResult<Vec<AuditOperation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, kind, content, timestamp FROM terminal_operations
                 WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )
            .map_err(store_err)?;
        let operations = stmt
            .query_map(params![session_id], operation_from_row)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(operations)
    }

    fn delete_session(&self, session_id: i64) -> AuditResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        let operations = tx
            .execute(
                "DELETE FROM terminal_operations WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(store_err)?;
        let sessions = tx
            .execute(
                "DELETE FROM terminal_sessions WHERE id = ?1",
                params![session_id],
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;

        debug!(session_id, operations, "audit session deleted");
        Ok(sessions > 0)
    }

    fn close_orphaned_sessions(&self) -> AuditResult<usize> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE terminal_sessions SET status = 'closed', end_time = ?1
             WHERE status = 'active'",
            params![now_micros()],
        )
        .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn recorder() -> SqliteRecorder {
        SqliteRecorder::open_in_memory().unwrap()
    }

    fn kinds(ops: &[AuditOperation]) -> Vec<OperationKind> {
        ops.iter().map(|op| op.kind).collect()
    }

    #[test]
    fn session_lifecycle() {
        let store = recorder();
        let session = store.open_session(1, 7, "tok-a").unwrap();
        assert!(session.is_active());
        assert_eq!(session.end_time, None);

        assert!(store.close_session("tok-a").unwrap());
        let page = store.query_sessions(&SessionQuery::default()).unwrap();
        assert_eq!(page.total, 1);
        let closed = &page.sessions[0];
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.end_time.unwrap() >= closed.start_time);
    }

    #[test]
    fn close_is_idempotent() {
        let store = recorder();
        store.open_session(1, 7, "tok-a").unwrap();
        assert!(store.close_session("tok-a").unwrap());
        let first_end = store.query_sessions(&SessionQuery::default()).unwrap().sessions[0]
            .end_time;

        assert!(!store.close_session("tok-a").unwrap());
        let second_end = store.query_sessions(&SessionQuery::default()).unwrap().sessions[0]
            .end_time;
        assert_eq!(first_end, second_end);

        assert!(!store.close_session("never-opened").unwrap());
    }

    #[test]
    fn duplicate_token_is_rejected() {
        let store = recorder();
        store.open_session(1, 7, "tok-a").unwrap();
        assert!(matches!(
            store.open_session(2, 8, "tok-a"),
            Err(AuditError::Store(_))
        ));
    }

    #[test]
    fn record_unknown_token_is_not_found() {
        let store = recorder();
        let err = store
            .record_operation("missing", OperationKind::Input, b"ls\n")
            .unwrap_err();
        assert!(matches!(err, AuditError::SessionNotFound(t) if t == "missing"));
    }

    #[test]
    fn operations_keep_emission_order_and_bytes() {
        let store = recorder();
        let session = store.open_session(1, 7, "tok-a").unwrap();
        store
            .record_operation("tok-a", OperationKind::SessionStart, b"Connected")
            .unwrap();
        store
            .record_operation("tok-a", OperationKind::Resize, b"Terminal resized to 100x40")
            .unwrap();
        store
            .record_operation("tok-a", OperationKind::Input, b"ls -la\n")
            .unwrap();
        store
            .record_operation("tok-a", OperationKind::Output, &[0x1b, b'[', 0xff])
            .unwrap();

        let ops = store.list_operations(session.id).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![
                OperationKind::SessionStart,
                OperationKind::Resize,
                OperationKind::Input,
                OperationKind::Output,
            ]
        );
        assert_eq!(ops[2].content, b"ls -la\n");
        assert_eq!(ops[3].content, vec![0x1b, b'[', 0xff]);
        assert!(ops.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(ops.iter().all(|op| op.session_id == session.id));
    }

    #[test]
    fn sessions_do_not_share_operations() {
        let store = recorder();
        let a = store.open_session(1, 7, "tok-a").unwrap();
        let b = store.open_session(2, 7, "tok-b").unwrap();
        store.record_operation("tok-a", OperationKind::Input, b"a").unwrap();
        store.record_operation("tok-b", OperationKind::Input, b"b").unwrap();
        store.record_operation("tok-b", OperationKind::Input, b"bb").unwrap();

        assert_eq!(store.list_operations(a.id).unwrap().len(), 1);
        assert_eq!(store.list_operations(b.id).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_writers() {
        let store = Arc::new(recorder());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let token = format!("tok-{i}");
                    store.open_session(i, 1, &token).unwrap();
                    for n in 0..25 {
                        store
                            .record_operation(&token, OperationKind::Output, format!("{n}").as_bytes())
                            .unwrap();
                    }
                    store.close_session(&token).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        let page = store
            .query_sessions(&SessionQuery {
                page_size: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 4);
        for session in page.sessions {
            let ops = store.list_operations(session.id).unwrap();
            let contents: Vec<String> = ops.iter().map(|op| op.content_lossy()).collect();
            let expected: Vec<String> = (0..25).map(|n| n.to_string()).collect();
            assert_eq!(contents, expected);
        }
    }

    #[test]
    fn query_filters_and_pagination() {
        let store = recorder();
        for i in 0..5 {
            store.open_session(1, 10, &format!("u1-{i}")).unwrap();
        }
        for i in 0..3 {
            store.open_session(2, 20, &format!("u2-{i}")).unwrap();
        }

        let all = store.query_sessions(&SessionQuery::default()).unwrap();
        assert_eq!(all.total, 8);
        assert_eq!(all.page, 1);
        assert_eq!(all.page_size, 20);
        // Newest first.
        assert_eq!(all.sessions[0].token, "u2-2");
        assert_eq!(all.sessions[7].token, "u1-0");

        let user1 = store
            .query_sessions(&SessionQuery {
                user_id: Some(1),
                page: 2,
                page_size: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(user1.total, 5);
        let tokens: Vec<&str> = user1.sessions.iter().map(|s| s.token.as_str()).collect();
        assert_eq!(tokens, vec!["u1-2", "u1-1"]);

        let host20 = store
            .query_sessions(&SessionQuery {
                host_id: Some(20),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(host20.total, 3);
        assert!(host20.sessions.iter().all(|s| s.host_id == 20));

        let past_end = store
            .query_sessions(&SessionQuery {
                page: 9,
                page_size: 5,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(past_end.total, 8);
        assert!(past_end.sessions.is_empty());
    }

    #[test]
    fn query_time_range() {
        let store = recorder();
        let session = store.open_session(1, 1, "tok-a").unwrap();
        let start = session.start_time;

        let within = store
            .query_sessions(&SessionQuery {
                started_after: Some(start - Duration::seconds(1)),
                started_before: Some(start + Duration::seconds(1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(within.total, 1);

        let later = store
            .query_sessions(&SessionQuery {
                started_after: Some(start + Duration::seconds(60)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(later.total, 0);
        assert!(later.sessions.is_empty());
    }

    #[test]
    fn delete_cascades_to_operations() {
        let store = recorder();
        let keep = store.open_session(1, 1, "keep").unwrap();
        let gone = store.open_session(1, 1, "gone").unwrap();
        store.record_operation("keep", OperationKind::Input, b"x").unwrap();
        store.record_operation("gone", OperationKind::Input, b"y").unwrap();
        store.record_operation("gone", OperationKind::Output, b"z").unwrap();

        assert!(store.delete_session(gone.id).unwrap());
        assert!(store.list_operations(gone.id).unwrap().is_empty());
        assert_eq!(store.list_operations(keep.id).unwrap().len(), 1);
        assert_eq!(store.query_sessions(&SessionQuery::default()).unwrap().total, 1);

        assert!(!store.delete_session(gone.id).unwrap());
        assert!(matches!(
            store.record_operation("gone", OperationKind::Input, b"late"),
            Err(AuditError::SessionNotFound(_))
        ));
    }

    #[test]
    fn orphans_are_closed() {
        let store = recorder();
        store.open_session(1, 1, "live-1").unwrap();
        store.open_session(1, 1, "live-2").unwrap();
        store.open_session(1, 1, "done").unwrap();
        store.close_session("done").unwrap();

        assert_eq!(store.close_orphaned_sessions().unwrap(), 2);
        assert_eq!(store.close_orphaned_sessions().unwrap(), 0);
        let page = store.query_sessions(&SessionQuery::default()).unwrap();
        assert!(page.sessions.iter().all(|s| !s.is_active()));
    }

    #[test]
    fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.db");
        {
            let store = SqliteRecorder::open(&path).unwrap();
            store.open_session(3, 4, "tok-file").unwrap();
            store.record_operation("tok-file", OperationKind::Input, b"pwd\n").unwrap();
        }
        let store = SqliteRecorder::open(&path).unwrap();
        let page = store.query_sessions(&SessionQuery::default()).unwrap();
        assert_eq!(page.total, 1);
        let ops = store.list_operations(page.sessions[0].id).unwrap();
        assert_eq!(ops[0].content, b"pwd\n");
    }
}
