pub mod aliases;
pub mod compose;
pub mod ingest;
pub mod provider;
pub mod read_state;
pub mod threading;
pub mod threads;
pub mod types;

use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;

use crate::shared::state::AppState;

/// Address lists and reference chains are stored as JSON text arrays.
pub fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_list(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/mail/inbound", post(ingest::receive_inbound))
        .route("/api/mail/send", post(compose::send_message))
        .route(
            "/api/mail/aliases",
            get(aliases::list_aliases).post(aliases::create_alias),
        )
        .route(
            "/api/mail/aliases/{alias_id}",
            put(aliases::update_alias).delete(aliases::delete_alias),
        )
        .route("/api/mail/threads", get(threads::list_threads))
        .route(
            "/api/mail/threads/unread-count",
            get(read_state::unread_count),
        )
        .route("/api/mail/threads/{thread_id}", get(threads::get_thread))
        .route(
            "/api/mail/threads/{thread_id}/read",
            post(read_state::mark_thread_read),
        )
        .route(
            "/api/mail/threads/{thread_id}/flags",
            post(read_state::update_thread_flags),
        )
}
