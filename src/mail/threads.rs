use axum::extract::{Path, Query, State};
use axum::Json;
use diesel::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::state::AppState;

use super::decode_list;
use super::types::{
    ApiResponse, AttachmentRow, AttachmentView, ListThreadsQuery, MailError, MessageDetailRow,
    MessageView, TenantQuery, ThreadDetailData, ThreadSummaryRow,
};

const THREAD_COLUMNS: &str = "id, alias_id, subject, message_count, last_message_at, \
                              is_read, is_starred, is_archived, is_trashed";

/// Thread list for one tenant, newest activity first. `view` selects the
/// inbox (default), starred, archived, or trash slice.
pub async fn list_threads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListThreadsQuery>,
) -> Result<Json<ApiResponse<Vec<ThreadSummaryRow>>>, MailError> {
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);

    let base_query = match query.view.as_deref() {
        Some("starred") => format!(
            "SELECT {THREAD_COLUMNS} FROM email_threads
             WHERE tenant_id = $1 AND is_starred = true AND is_trashed = false
             ORDER BY last_message_at DESC, id DESC LIMIT $2 OFFSET $3"
        ),
        Some("archived") => format!(
            "SELECT {THREAD_COLUMNS} FROM email_threads
             WHERE tenant_id = $1 AND is_archived = true AND is_trashed = false
             ORDER BY last_message_at DESC, id DESC LIMIT $2 OFFSET $3"
        ),
        Some("trashed") => format!(
            "SELECT {THREAD_COLUMNS} FROM email_threads
             WHERE tenant_id = $1 AND is_trashed = true
             ORDER BY last_message_at DESC, id DESC LIMIT $2 OFFSET $3"
        ),
        _ => format!(
            "SELECT {THREAD_COLUMNS} FROM email_threads
             WHERE tenant_id = $1 AND is_archived = false AND is_trashed = false
             ORDER BY last_message_at DESC, id DESC LIMIT $2 OFFSET $3"
        ),
    };

    let conn = state.conn.clone();
    let threads = tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        diesel::sql_query(base_query)
            .bind::<diesel::sql_types::Uuid, _>(query.tenant_id)
            .bind::<diesel::sql_types::BigInt, _>(limit)
            .bind::<diesel::sql_types::BigInt, _>(offset)
            .load::<ThreadSummaryRow>(&mut db_conn)
            .map_err(|e| format!("Thread query failed: {e}"))
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    Ok(Json(ApiResponse {
        success: true,
        data: Some(threads),
        message: None,
    }))
}

/// One conversation: the thread row plus its messages oldest-first, each with
/// attachment metadata.
pub async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<ApiResponse<ThreadDetailData>>, MailError> {
    let conn = state.conn.clone();
    let detail = tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        let thread: Option<ThreadSummaryRow> = diesel::sql_query(format!(
            "SELECT {THREAD_COLUMNS} FROM email_threads WHERE id = $1 AND tenant_id = $2"
        ))
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Uuid, _>(query.tenant_id)
        .get_result(&mut db_conn)
        .optional()
        .map_err(|e| format!("Thread query failed: {e}"))?;

        let Some(thread) = thread else {
            return Ok::<_, String>(None);
        };

        let messages: Vec<MessageDetailRow> = diesel::sql_query(
            "SELECT id, direction, status, from_address, to_addresses, cc_addresses, subject,
                    body_text, body_html, message_id, in_reply_to, references_list, is_read,
                    sent_at, received_at
             FROM email_messages WHERE thread_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .load(&mut db_conn)
        .map_err(|e| format!("Message query failed: {e}"))?;

        let attachments: Vec<AttachmentRow> = diesel::sql_query(
            "SELECT a.id, a.message_id, a.filename, a.content_type, a.size_bytes
             FROM email_attachments a
             JOIN email_messages m ON m.id = a.message_id
             WHERE m.thread_id = $1",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .load(&mut db_conn)
        .map_err(|e| format!("Attachment query failed: {e}"))?;

        let views = messages
            .into_iter()
            .map(|row| {
                let message_attachments = attachments
                    .iter()
                    .filter(|a| a.message_id == row.id)
                    .map(|a| AttachmentView {
                        id: a.id,
                        filename: a.filename.clone(),
                        content_type: a.content_type.clone(),
                        size_bytes: a.size_bytes,
                    })
                    .collect();

                MessageView {
                    id: row.id,
                    direction: row.direction,
                    status: row.status,
                    from: row.from_address,
                    to: decode_list(Some(&row.to_addresses)),
                    cc: decode_list(row.cc_addresses.as_deref()),
                    subject: row.subject,
                    body_text: row.body_text,
                    body_html: row.body_html,
                    message_id: row.message_id,
                    in_reply_to: row.in_reply_to,
                    references: decode_list(row.references_list.as_deref()),
                    is_read: row.is_read,
                    sent_at: row.sent_at,
                    received_at: row.received_at,
                    attachments: message_attachments,
                }
            })
            .collect();

        Ok(Some(ThreadDetailData {
            thread,
            messages: views,
        }))
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    match detail {
        Some(data) => Ok(Json(ApiResponse {
            success: true,
            data: Some(data),
            message: None,
        })),
        None => Ok(Json(ApiResponse {
            success: false,
            data: None,
            message: Some("Thread not found".to_string()),
        })),
    }
}
