use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::state::AppState;

use super::types::{ApiResponse, CountRow, MailError, MarkReadRequest, TenantQuery, ThreadFlagsRequest, UnreadCountData};

/// Marks a whole thread read for one dashboard user. Idempotent; may race
/// harmlessly with unread-count queries.
pub async fn mark_thread_read(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Json<ApiResponse<()>>, MailError> {
    let conn = state.conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;
        let now = Utc::now();

        diesel::sql_query(
            "UPDATE email_threads SET is_read = true, updated_at = now()
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Uuid, _>(request.tenant_id)
        .execute(&mut db_conn)
        .map_err(|e| format!("Failed to mark thread read: {e}"))?;

        diesel::sql_query(
            "UPDATE email_messages SET is_read = true
             WHERE thread_id = $1 AND tenant_id = $2 AND is_read = false",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Uuid, _>(request.tenant_id)
        .execute(&mut db_conn)
        .map_err(|e| format!("Failed to mark messages read: {e}"))?;

        diesel::sql_query(
            "INSERT INTO thread_read_states (id, tenant_id, user_id, thread_id, last_read_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT ON CONSTRAINT thread_read_states_user_thread_unique
             DO UPDATE SET last_read_at = EXCLUDED.last_read_at",
        )
        .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
        .bind::<diesel::sql_types::Uuid, _>(request.tenant_id)
        .bind::<diesel::sql_types::Uuid, _>(request.user_id)
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Timestamptz, _>(now)
        .execute(&mut db_conn)
        .map_err(|e| format!("Failed to record read state: {e}"))?;

        Ok::<_, String>(())
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    debug!("thread {thread_id} marked read");

    Ok(Json(ApiResponse {
        success: true,
        data: Some(()),
        message: None,
    }))
}

/// Partial update of a thread's dashboard flags; absent fields keep their
/// current value. Trashing is a soft delete.
pub async fn update_thread_flags(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Json(request): Json<ThreadFlagsRequest>,
) -> Result<Json<ApiResponse<()>>, MailError> {
    let conn = state.conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        diesel::sql_query(
            "UPDATE email_threads
             SET is_read = COALESCE($3, is_read),
                 is_starred = COALESCE($4, is_starred),
                 is_archived = COALESCE($5, is_archived),
                 is_trashed = COALESCE($6, is_trashed),
                 updated_at = now()
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Uuid, _>(request.tenant_id)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Bool>, _>(request.is_read)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Bool>, _>(request.is_starred)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Bool>, _>(request.is_archived)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Bool>, _>(request.is_trashed)
        .execute(&mut db_conn)
        .map_err(|e| format!("Failed to update thread flags: {e}"))?;

        Ok::<_, String>(())
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    Ok(Json(ApiResponse {
        success: true,
        data: Some(()),
        message: None,
    }))
}

/// Unread badge for the dashboard: threads with unseen activity, excluding
/// archived and trashed views.
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<ApiResponse<UnreadCountData>>, MailError> {
    let conn = state.conn.clone();
    let count = tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        let row: CountRow = diesel::sql_query(
            "SELECT COUNT(*) AS count FROM email_threads
             WHERE tenant_id = $1 AND is_read = false
               AND is_archived = false AND is_trashed = false",
        )
        .bind::<diesel::sql_types::Uuid, _>(query.tenant_id)
        .get_result(&mut db_conn)
        .map_err(|e| format!("Unread count failed: {e}"))?;

        Ok::<_, String>(row.count)
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    Ok(Json(ApiResponse {
        success: true,
        data: Some(UnreadCountData {
            unread_threads: count,
        }),
        message: None,
    }))
}
