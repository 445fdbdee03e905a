use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::schema::email_aliases;
use crate::shared::state::AppState;

use super::provider::{OutboundEmail, OutboundHeaders};
use super::threading::{build_references, create_thread, record_message};
use super::types::{Alias, ApiResponse, MailError, ReplyTargetRow, SendMessageRequest, SentMessageData};
use super::{decode_list, encode_list};

/// Fresh synthetic Message-ID scoped to the sending alias's domain.
pub fn new_message_id(domain: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), domain)
}

enum Prepared {
    Ready {
        alias: Alias,
        reply: Option<ReplyTargetRow>,
    },
    NoAlias,
    NoReplyTarget,
}

fn prepare_send(
    conn: &mut PgConnection,
    alias_id: Uuid,
    reply_to_message_id: Option<Uuid>,
) -> Result<Prepared, String> {
    use email_aliases::dsl;

    let alias = dsl::email_aliases
        .find(alias_id)
        .first::<Alias>(conn)
        .optional()
        .map_err(|e| format!("Alias lookup failed: {e}"))?;
    let Some(alias) = alias else {
        return Ok(Prepared::NoAlias);
    };

    let reply = match reply_to_message_id {
        None => None,
        Some(target_id) => {
            let target: Option<ReplyTargetRow> = diesel::sql_query(
                "SELECT id, thread_id, message_id, references_list, subject
                 FROM email_messages WHERE id = $1 AND tenant_id = $2",
            )
            .bind::<diesel::sql_types::Uuid, _>(target_id)
            .bind::<diesel::sql_types::Uuid, _>(alias.tenant_id)
            .get_result(conn)
            .optional()
            .map_err(|e| format!("Reply target lookup failed: {e}"))?;

            match target {
                Some(row) => Some(row),
                None => return Ok(Prepared::NoReplyTarget),
            }
        }
    };

    Ok(Prepared::Ready { alias, reply })
}

/// Records the sent copy. The reply's thread is reused when known; a fresh
/// send opens a new, already-read thread whose count the persist step
/// advances to one.
#[allow(clippy::too_many_arguments)]
pub fn persist_outbound(
    conn: &mut PgConnection,
    alias: &Alias,
    reply_thread: Option<Uuid>,
    request: &SendMessageRequest,
    message_id: &str,
    in_reply_to: Option<&str>,
    references: &[String],
    provider_message_id: &str,
    sent_at: DateTime<Utc>,
) -> Result<(Uuid, Uuid), String> {
    let row_id = Uuid::new_v4();
    conn.transaction::<(Uuid, Uuid), diesel::result::Error, _>(|conn| {
        let thread_id = match reply_thread {
            Some(thread_id) => thread_id,
            None => create_thread(conn, alias.tenant_id, alias.id, &request.subject, sent_at, true)?,
        };

        diesel::sql_query(
            "INSERT INTO email_messages
             (id, tenant_id, thread_id, alias_id, from_address, to_addresses, cc_addresses,
              bcc_addresses, subject, body_text, body_html, message_id, in_reply_to,
              references_list, direction, status, provider_message_id, is_read, sent_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     'outbound', 'sent', $15, true, $16)",
        )
        .bind::<diesel::sql_types::Uuid, _>(row_id)
        .bind::<diesel::sql_types::Uuid, _>(alias.tenant_id)
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Uuid, _>(alias.id)
        .bind::<diesel::sql_types::Text, _>(alias.from_header())
        .bind::<diesel::sql_types::Text, _>(encode_list(&request.to))
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(
            (!request.cc.is_empty()).then(|| encode_list(&request.cc)),
        )
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(
            (!request.bcc.is_empty()).then(|| encode_list(&request.bcc)),
        )
        .bind::<diesel::sql_types::Text, _>(&request.subject)
        .bind::<diesel::sql_types::Text, _>(&request.text)
        .bind::<diesel::sql_types::Text, _>(&request.html)
        .bind::<diesel::sql_types::Text, _>(message_id)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(in_reply_to)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(
            (!references.is_empty()).then(|| encode_list(references)),
        )
        .bind::<diesel::sql_types::Text, _>(provider_message_id)
        .bind::<diesel::sql_types::Timestamptz, _>(sent_at)
        .execute(conn)?;

        record_message(conn, thread_id, sent_at, false)?;
        Ok((row_id, thread_id))
    })
    .map_err(|e| format!("Failed to record sent message: {e}"))
}

/// Dashboard send action: build threading headers from the reply target,
/// deliver through the transactional provider, then record the sent copy.
/// Provider rejections map to a user-facing message and persist nothing.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<ApiResponse<SentMessageData>>, MailError> {
    if request.to.is_empty() {
        return Ok(Json(ApiResponse {
            success: false,
            data: None,
            message: Some("At least one recipient is required".to_string()),
        }));
    }

    let conn = state.conn.clone();
    let alias_id = request.alias_id;
    let reply_target = request.reply_to_message_id;
    let prepared = tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;
        prepare_send(&mut db_conn, alias_id, reply_target)
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    let (alias, reply) = match prepared {
        Prepared::Ready { alias, reply } => (alias, reply),
        Prepared::NoAlias => {
            return Ok(Json(ApiResponse {
                success: false,
                data: None,
                message: Some("Unknown sending alias".to_string()),
            }))
        }
        Prepared::NoReplyTarget => {
            return Ok(Json(ApiResponse {
                success: false,
                data: None,
                message: Some("The message being replied to no longer exists".to_string()),
            }))
        }
    };

    let message_id = new_message_id(&alias.domain);
    let (in_reply_to, references) = match &reply {
        Some(target) => {
            let prior_refs = decode_list(target.references_list.as_deref());
            (
                Some(target.message_id.clone()),
                build_references(&prior_refs, &target.message_id),
            )
        }
        None => (None, Vec::new()),
    };

    let email = OutboundEmail {
        from: alias.from_header(),
        to: request.to.clone(),
        cc: request.cc.clone(),
        bcc: request.bcc.clone(),
        subject: request.subject.clone(),
        text: request.text.clone(),
        html: request.html.clone(),
        headers: OutboundHeaders::new(&message_id, in_reply_to.as_deref(), &references),
    };

    let provider_message_id = match state.provider.send(&email).await {
        Ok(id) => id,
        Err(e) => {
            warn!("send from alias {} rejected: {e}", alias.address());
            return Ok(Json(ApiResponse {
                success: false,
                data: None,
                message: Some(e.user_message()),
            }));
        }
    };

    let sent_at = Utc::now();
    let conn = state.conn.clone();
    let reply_thread = reply.as_ref().map(|r| r.thread_id);
    let alias_for_persist = alias.clone();
    let provider_id_for_persist = provider_message_id.clone();
    let persisted = tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;
        persist_outbound(
            &mut db_conn,
            &alias_for_persist,
            reply_thread,
            &request,
            &message_id,
            in_reply_to.as_deref(),
            &references,
            &provider_id_for_persist,
            sent_at,
        )
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?;

    let (row_id, thread_id) = match persisted {
        Ok(ids) => ids,
        Err(e) => {
            // Delivery succeeded but the audit copy did not commit.
            error!("sent message {provider_message_id} could not be recorded: {e}");
            return Err(MailError(e));
        }
    };

    info!(
        "message {row_id} sent from {} in thread {thread_id} (provider id {provider_message_id})",
        alias.address()
    );

    Ok(Json(ApiResponse {
        success: true,
        data: Some(SentMessageData {
            message_id: row_id,
            thread_id,
            provider_message_id,
        }),
        message: Some("Email sent".to_string()),
    }))
}
