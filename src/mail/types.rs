use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Integer, Nullable, Text, Timestamptz, Uuid as DieselUuid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ===== Error Handling =====

/// Retryable mail-subsystem failure. Maps to a 500 so webhook callers
/// redeliver; routing misses and provider rejections never use this path.
#[derive(Debug)]
pub struct MailError(pub String);

impl IntoResponse for MailError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0).into_response()
    }
}

impl From<String> for MailError {
    fn from(s: String) -> Self {
        MailError(s)
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

// ===== Inbound Webhook =====

#[derive(Debug, Clone, Deserialize)]
pub struct InboundWebhookPayload {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
}

/// Always returned with HTTP 200. `persisted` is false for routing misses
/// and duplicate deliveries; the upstream provider must not retry either.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAck {
    pub success: bool,
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ===== Aliases =====

#[derive(Debug, Clone, Queryable, Serialize)]
pub struct Alias {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub local_part: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alias {
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }

    /// RFC-style From value: `Display Name <local@domain>`.
    pub fn from_header(&self) -> String {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.address()),
            _ => self.address(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAliasRequest {
    pub tenant_id: Uuid,
    pub local_part: String,
    /// Falls back to the configured default mail domain when absent.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAliasRequest {
    pub display_name: Option<String>,
    pub is_default: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Uuid,
}

// ===== Outbound Send =====

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub alias_id: Uuid,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub reply_to_message_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SentMessageData {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub provider_message_id: String,
}

// ===== Threads & Read State =====

#[derive(Debug, Deserialize)]
pub struct ListThreadsQuery {
    pub tenant_id: Uuid,
    pub view: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ThreadFlagsRequest {
    pub tenant_id: Uuid,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub is_archived: Option<bool>,
    pub is_trashed: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountData {
    pub unread_threads: i64,
}

#[derive(Debug, Serialize)]
pub struct ThreadDetailData {
    pub thread: ThreadSummaryRow,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub direction: String,
    pub status: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub is_read: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Serialize)]
pub struct AttachmentView {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
}

// ===== Raw Query Rows =====

#[derive(Debug, QueryableByName)]
pub struct ThreadIdRow {
    #[diesel(sql_type = DieselUuid)]
    pub id: Uuid,
}

#[derive(Debug, QueryableByName)]
pub struct MessageThreadRow {
    #[diesel(sql_type = DieselUuid)]
    pub id: Uuid,
    #[diesel(sql_type = DieselUuid)]
    pub thread_id: Uuid,
}

#[derive(Debug, QueryableByName)]
pub struct ReplyTargetRow {
    #[diesel(sql_type = DieselUuid)]
    pub id: Uuid,
    #[diesel(sql_type = DieselUuid)]
    pub thread_id: Uuid,
    #[diesel(sql_type = Text)]
    pub message_id: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub references_list: Option<String>,
    #[diesel(sql_type = Text)]
    pub subject: String,
}

#[derive(Debug, QueryableByName, Serialize)]
pub struct ThreadSummaryRow {
    #[diesel(sql_type = DieselUuid)]
    pub id: Uuid,
    #[diesel(sql_type = Nullable<DieselUuid>)]
    pub alias_id: Option<Uuid>,
    #[diesel(sql_type = Text)]
    pub subject: String,
    #[diesel(sql_type = Integer)]
    pub message_count: i32,
    #[diesel(sql_type = Timestamptz)]
    pub last_message_at: DateTime<Utc>,
    #[diesel(sql_type = Bool)]
    pub is_read: bool,
    #[diesel(sql_type = Bool)]
    pub is_starred: bool,
    #[diesel(sql_type = Bool)]
    pub is_archived: bool,
    #[diesel(sql_type = Bool)]
    pub is_trashed: bool,
}

#[derive(Debug, QueryableByName)]
pub struct MessageDetailRow {
    #[diesel(sql_type = DieselUuid)]
    pub id: Uuid,
    #[diesel(sql_type = Text)]
    pub direction: String,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Text)]
    pub from_address: String,
    #[diesel(sql_type = Text)]
    pub to_addresses: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub cc_addresses: Option<String>,
    #[diesel(sql_type = Text)]
    pub subject: String,
    #[diesel(sql_type = Text)]
    pub body_text: String,
    #[diesel(sql_type = Text)]
    pub body_html: String,
    #[diesel(sql_type = Text)]
    pub message_id: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub in_reply_to: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub references_list: Option<String>,
    #[diesel(sql_type = Bool)]
    pub is_read: bool,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub sent_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, QueryableByName)]
pub struct AttachmentRow {
    #[diesel(sql_type = DieselUuid)]
    pub id: Uuid,
    #[diesel(sql_type = DieselUuid)]
    pub message_id: Uuid,
    #[diesel(sql_type = Text)]
    pub filename: String,
    #[diesel(sql_type = Text)]
    pub content_type: String,
    #[diesel(sql_type = BigInt)]
    pub size_bytes: i64,
}

#[derive(Debug, QueryableByName)]
pub struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}
