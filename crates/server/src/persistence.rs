//! Persistence layer - the Session Store.
//!
//! A cheap-to-clone capability handle over SQLite, threaded explicitly into
//! every component at construction. Uses `spawn_blocking` for async-safe
//! access; every connection is opened with WAL + busy_timeout pragmas so
//! many connections and the sweeper can mutate rows concurrently.
//!
//! Closed sessions are sticky at the SQL level: every write that touches
//! `status` or `last_activity_at` carries `status != 'closed'`, so a stale
//! in-flight writer can never resurrect a closed session.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinError;

use chatdock_protocol::{new_id, ChatMessage, MessageRole, Session, SessionStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(#[from] JoinError),
}

/// Current time as RFC 3339 UTC with millisecond precision.
///
/// Fixed-width, so lexicographic order equals chronological order; the
/// sweep predicates and message ordering rely on this.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn open_connection(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Handle to the session/message store
#[derive(Clone)]
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            f(&conn)
        })
        .await?
    }

    /// Create a new session with status ACTIVE.
    pub async fn create_session(
        &self,
        visitor_id: &str,
        metadata: Option<Value>,
    ) -> Result<Session, StoreError> {
        let now = now_rfc3339();
        let session = Session {
            id: new_id(),
            visitor_id: visitor_id.to_string(),
            status: SessionStatus::Active,
            metadata,
            created_at: now.clone(),
            last_activity_at: now,
        };

        let row = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, visitor_id, status, metadata, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id,
                    row.visitor_id,
                    row.status.as_str(),
                    row.metadata.as_ref().map(|m| m.to_string()),
                    row.created_at,
                    row.last_activity_at,
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(session)
    }

    /// Point lookup by session id.
    pub async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let session = conn
                .query_row(
                    "SELECT id, visitor_id, status, metadata, created_at, last_activity_at
                     FROM sessions WHERE id = ?1",
                    params![id],
                    map_session,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    /// Most recently created non-closed session for a visitor, if any.
    pub async fn find_open_session_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let visitor_id = visitor_id.to_string();
        self.with_conn(move |conn| {
            let session = conn
                .query_row(
                    "SELECT id, visitor_id, status, metadata, created_at, last_activity_at
                     FROM sessions
                     WHERE visitor_id = ?1 AND status != 'closed'
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1",
                    params![visitor_id],
                    map_session,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    /// Force status ACTIVE and refresh last-activity, unless closed.
    /// Returns false when the session is closed or missing.
    pub async fn touch_session(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'active', last_activity_at = ?1
                 WHERE id = ?2 AND status != 'closed'",
                params![now_rfc3339(), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Transition to CLOSED, refreshing last-activity. Returns false when
    /// the session was already closed or missing (idempotent).
    pub async fn close_session(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'closed', last_activity_at = ?1
                 WHERE id = ?2 AND status != 'closed'",
                params![now_rfc3339(), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Append an immutable message to a session's history.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: new_id(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now_rfc3339(),
        };

        let row = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id,
                    row.session_id,
                    row.role.as_str(),
                    row.content,
                    row.created_at,
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(message)
    }

    /// The most recent `limit` messages of a session, ascending.
    ///
    /// Serves both history replay and the responder's trailing window;
    /// creation-time ascending order is the sole consistency contract.
    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, created_at
                 FROM messages
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;

            let mut messages: Vec<ChatMessage> = stmt
                .query_map(params![session_id, limit as i64], map_message)?
                .filter_map(|r| r.ok())
                .collect();
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    /// Bulk transition: ACTIVE sessions idle since before `cutoff` become
    /// INACTIVE. Returns the number of sessions transitioned.
    pub async fn sweep_inactive(&self, cutoff: &str) -> Result<usize, StoreError> {
        let cutoff = cutoff.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'inactive'
                 WHERE status = 'active' AND last_activity_at < ?1",
                params![cutoff],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Bulk transition: ACTIVE or INACTIVE sessions idle since before
    /// `cutoff` become CLOSED. Returns the number of sessions transitioned.
    pub async fn sweep_close(&self, cutoff: &str) -> Result<usize, StoreError> {
        let cutoff = cutoff.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'closed'
                 WHERE status IN ('active', 'inactive') AND last_activity_at < ?1",
                params![cutoff],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Backdate a session's last-activity. Test support for sweep logic.
    #[cfg(test)]
    pub async fn set_last_activity(&self, id: &str, ts: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let ts = ts.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
            Ok(())
        })
        .await
    }
}

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status_str: String = row.get(2)?;
    let metadata_str: Option<String> = row.get(3)?;

    Ok(Session {
        id: row.get(0)?,
        visitor_id: row.get(1)?,
        // Unknown status is treated as closed, refusing further writes.
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Closed),
        metadata: metadata_str.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: row.get(4)?,
        last_activity_at: row.get(5)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role_str: String = row.get(2)?;

    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse(&role_str).unwrap_or(MessageRole::System),
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test.db");
        let mut conn = Connection::open(&db_path).expect("open db");
        crate::migration_runner::run_migrations(&mut conn).expect("migrate");
        (SessionStore::new(db_path), dir)
    }

    #[tokio::test]
    async fn create_then_find_round_trips() {
        let (store, _dir) = test_store().await;

        let created = store
            .create_session("vis-1", Some(json!({"page": "/pricing"})))
            .await
            .expect("create");
        assert_eq!(created.status, SessionStatus::Active);

        let found = store
            .find_session(&created.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, created.id);
        assert_eq!(found.visitor_id, "vis-1");
        assert_eq!(found.metadata, Some(json!({"page": "/pricing"})));
    }

    #[tokio::test]
    async fn find_missing_returns_none() {
        let (store, _dir) = test_store().await;
        let found = store.find_session("no-such-id").await.expect("find");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn closed_is_sticky() {
        let (store, _dir) = test_store().await;
        let session = store.create_session("vis-1", None).await.expect("create");

        assert!(store.close_session(&session.id).await.expect("close"));
        let closed = store
            .find_session(&session.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(closed.status, SessionStatus::Closed);

        // Neither touch nor a second close may change the closed row.
        assert!(!store.touch_session(&session.id).await.expect("touch"));
        assert!(!store.close_session(&session.id).await.expect("reclose"));

        let after = store
            .find_session(&session.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(after.status, SessionStatus::Closed);
        assert_eq!(after.last_activity_at, closed.last_activity_at);
    }

    #[tokio::test]
    async fn touch_reactivates_inactive_session() {
        let (store, _dir) = test_store().await;
        let session = store.create_session("vis-1", None).await.expect("create");

        store
            .set_last_activity(&session.id, "2020-01-01T00:00:00.000Z")
            .await
            .expect("backdate");
        assert_eq!(store.sweep_inactive(&now_rfc3339()).await.expect("sweep"), 1);

        assert!(store.touch_session(&session.id).await.expect("touch"));
        let after = store
            .find_session(&session.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(after.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn visitor_lookup_prefers_most_recent_open() {
        let (store, _dir) = test_store().await;
        let first = store.create_session("vis-1", None).await.expect("create");
        let second = store.create_session("vis-1", None).await.expect("create");

        let found = store
            .find_open_session_for_visitor("vis-1")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, second.id);

        store.close_session(&second.id).await.expect("close");
        let found = store
            .find_open_session_for_visitor("vis-1")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, first.id);

        store.close_session(&first.id).await.expect("close");
        let found = store
            .find_open_session_for_visitor("vis-1")
            .await
            .expect("lookup");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn messages_replay_ascending_with_trailing_window() {
        let (store, _dir) = test_store().await;
        let session = store.create_session("vis-1", None).await.expect("create");

        for i in 1..=5 {
            store
                .append_message(&session.id, MessageRole::User, &format!("turn {i}"))
                .await
                .expect("append");
        }

        let all = store.list_messages(&session.id, 100).await.expect("list");
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].content, "turn 1");
        assert_eq!(all[4].content, "turn 5");

        let window = store.list_messages(&session.id, 3).await.expect("window");
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 3", "turn 4", "turn 5"]);
    }

    #[tokio::test]
    async fn user_then_bot_turn_is_visible_in_order() {
        let (store, _dir) = test_store().await;
        let session = store.create_session("vis-1", None).await.expect("create");

        store
            .append_message(&session.id, MessageRole::User, "hi")
            .await
            .expect("user");
        store
            .append_message(&session.id, MessageRole::Bot, "hello!")
            .await
            .expect("bot");

        let history = store.list_messages(&session.id, 50).await.expect("list");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Bot);
    }

    #[tokio::test]
    async fn sweep_inactive_only_ages_active_sessions() {
        let (store, _dir) = test_store().await;
        let idle = store.create_session("vis-1", None).await.expect("create");
        let fresh = store.create_session("vis-2", None).await.expect("create");
        let closed = store.create_session("vis-3", None).await.expect("create");

        store
            .set_last_activity(&idle.id, "2020-01-01T00:00:00.000Z")
            .await
            .expect("backdate");
        store.close_session(&closed.id).await.expect("close");
        store
            .set_last_activity(&closed.id, "2020-01-01T00:00:00.000Z")
            .await
            .expect("backdate");

        let cutoff = now_rfc3339();
        assert_eq!(store.sweep_inactive(&cutoff).await.expect("sweep"), 1);
        // Idempotent: the aged session is no longer ACTIVE.
        assert_eq!(store.sweep_inactive(&cutoff).await.expect("sweep"), 0);

        let idle = store.find_session(&idle.id).await.unwrap().unwrap();
        assert_eq!(idle.status, SessionStatus::Inactive);
        let fresh = store.find_session(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, SessionStatus::Active);
        let closed = store.find_session(&closed.id).await.unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn sweep_close_takes_active_and_inactive_but_not_closed() {
        let (store, _dir) = test_store().await;
        let active = store.create_session("vis-1", None).await.expect("create");
        let inactive = store.create_session("vis-2", None).await.expect("create");

        store
            .set_last_activity(&inactive.id, "2020-01-01T00:00:00.000Z")
            .await
            .expect("backdate");
        store
            .set_last_activity(&active.id, "2020-03-01T00:00:00.000Z")
            .await
            .expect("backdate");
        // Age only one of them to INACTIVE; the other goes straight from
        // ACTIVE to CLOSED within the close sweep.
        assert_eq!(
            store
                .sweep_inactive("2020-02-01T00:00:00.000Z")
                .await
                .expect("sweep"),
            1
        );

        let cutoff = now_rfc3339();
        assert_eq!(store.sweep_close(&cutoff).await.expect("close sweep"), 2);
        assert_eq!(store.sweep_close(&cutoff).await.expect("close sweep"), 0);

        for id in [&active.id, &inactive.id] {
            let session = store.find_session(id).await.unwrap().unwrap();
            assert_eq!(session.status, SessionStatus::Closed);
        }
    }
}
