//! Companion HTTP surface - a thin CRUD mirror of the session store.
//!
//! Point operations only: no handshake ordering, no broadcast semantics.
//! Live connections discover an HTTP-initiated close through the protocol's
//! own status re-check.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use chatdock_protocol::MessageRole;

use crate::persistence::StoreError;
use crate::AppContext;

pub fn router() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/messages", get(list_messages))
        .route("/api/sessions/{id}/heartbeat", post(heartbeat))
        .route("/api/sessions/{id}/close", post(close_session))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    visitor_id: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
}

async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    match ctx.store.create_session(&req.visitor_id, req.metadata).await {
        Ok(session) => (StatusCode::CREATED, Json(json!(session))).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match ctx.store.find_session(&id).await {
        Ok(Some(session)) => Json(json!(session)).into_response(),
        Ok(None) => not_found(),
        Err(e) => store_error(e),
    }
}

async fn list_messages(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> impl IntoResponse {
    match ctx.store.find_session(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return store_error(e),
    }

    let limit = query.limit.unwrap_or(ctx.history_page_size);
    match ctx.store.list_messages(&id, limit).await {
        Ok(messages) => Json(json!(messages)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match ctx.store.touch_session(&id).await {
        Ok(true) => Json(json!({"status": "active"})).into_response(),
        Ok(false) => not_found(),
        Err(e) => store_error(e),
    }
}

async fn close_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match ctx.store.find_session(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return store_error(e),
    }

    match ctx.store.close_session(&id).await {
        Ok(true) => {
            // Same best-effort marker as the protocol's end-session path.
            if let Err(e) = ctx
                .store
                .append_message(&id, MessageRole::System, "Session closed by operator")
                .await
            {
                warn!(
                    component = "http",
                    event = "session.close.marker_failed",
                    session_id = %id,
                    error = %e,
                    "Failed to append close marker"
                );
            }
            Json(json!({"status": "closed"})).into_response()
        }
        Ok(false) => Json(json!({"status": "closed"})).into_response(),
        Err(e) => store_error(e),
    }
}

fn not_found() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "session not found"})),
    )
        .into_response()
}

fn store_error(e: StoreError) -> axum::response::Response {
    warn!(
        component = "http",
        event = "http.store_error",
        error = %e,
        "Store operation failed"
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "storage operation failed"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SessionStore;
    use crate::registry::Registry;
    use crate::responder::ResponderClient;
    use chatdock_protocol::SessionStatus;
    use rusqlite::Connection;
    use std::time::Duration;

    async fn test_ctx() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test.db");
        let mut conn = Connection::open(&db_path).expect("open db");
        crate::migration_runner::run_migrations(&mut conn).expect("migrate");

        let ctx = Arc::new(AppContext {
            store: SessionStore::new(db_path),
            registry: Registry::new(),
            responder: ResponderClient::new(
                "http://127.0.0.1:9/reply".to_string(),
                Duration::from_secs(1),
            )
            .expect("responder"),
            history_page_size: 100,
            context_window: 50,
        });
        (ctx, dir)
    }

    #[tokio::test]
    async fn create_and_fetch_session_round_trips() {
        let (ctx, _dir) = test_ctx().await;

        let response = create_session(
            State(ctx.clone()),
            Json(CreateSessionRequest {
                visitor_id: "vis-1".to_string(),
                metadata: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let session = ctx
            .store
            .find_open_session_for_visitor("vis-1")
            .await
            .unwrap()
            .expect("created session");
        assert_eq!(session.status, SessionStatus::Active);

        let response = get_session(State(ctx.clone()), Path(session.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn heartbeat_is_not_found_after_close() {
        let (ctx, _dir) = test_ctx().await;
        let session = ctx.store.create_session("vis-1", None).await.unwrap();

        let response = heartbeat(State(ctx.clone()), Path(session.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = close_session(State(ctx.clone()), Path(session.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = heartbeat(State(ctx.clone()), Path(session.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let (ctx, _dir) = test_ctx().await;

        let response = get_session(State(ctx.clone()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = list_messages(
            State(ctx),
            Path("nope".to_string()),
            Query(ListMessagesQuery { limit: None }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
