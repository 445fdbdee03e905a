use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::state::AppState;

use super::aliases::resolve_alias;
use super::threading::{record_message, resolve_thread};
use super::types::{InboundAck, InboundWebhookPayload, MailError, MessageThreadRow};
use super::encode_list;

/// Case-insensitive lookup in the provider's header map.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Threading identifiers arrive angle-bracket wrapped on the wire; stored
/// values are always bare.
pub fn trim_angle(value: &str) -> &str {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
}

pub fn parse_references_header(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(trim_angle)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Inbound providers do not guarantee a Message-ID header; a missing one gets
/// a synthesized stand-in so dedupe and threading still have a key.
pub fn synthesize_message_id(at: DateTime<Utc>) -> String {
    format!("{}@inbound", at.timestamp_millis())
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// No recipient matched a known alias. Permanent; acknowledged so the
    /// provider never retries.
    NoRoute,
    Persisted {
        message_id: Uuid,
        thread_id: Uuid,
    },
    /// Redelivery of an already stored Message-ID; acknowledged as a no-op.
    Duplicate {
        message_id: Uuid,
        thread_id: Uuid,
    },
}

/// Runs the full inbound pipeline on one blocking connection: route by alias,
/// place in a thread, persist the message plus attachment metadata, and
/// advance the thread aggregates, all in one transaction.
pub fn ingest_payload(
    conn: &mut PgConnection,
    payload: &InboundWebhookPayload,
    received_at: DateTime<Utc>,
) -> Result<IngestOutcome, String> {
    let message_id = header_value(&payload.headers, "message-id")
        .map(trim_angle)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| synthesize_message_id(received_at));
    let in_reply_to = header_value(&payload.headers, "in-reply-to")
        .map(trim_angle)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let references = header_value(&payload.headers, "references")
        .map(parse_references_header)
        .unwrap_or_default();

    // To before Cc, in header order; the first registered alias wins.
    let mut candidates = payload.to.clone();
    candidates.extend(payload.cc.iter().cloned());

    let Some(alias) = resolve_alias(conn, &candidates).map_err(|e| format!("Alias lookup failed: {e}"))?
    else {
        return Ok(IngestOutcome::NoRoute);
    };

    if let Some(existing) = find_stored_message(conn, alias.tenant_id, &message_id)
        .map_err(|e| format!("Dedupe lookup failed: {e}"))?
    {
        return Ok(IngestOutcome::Duplicate {
            message_id: existing.id,
            thread_id: existing.thread_id,
        });
    }

    let row_id = Uuid::new_v4();
    let result = conn.transaction::<Uuid, diesel::result::Error, _>(|conn| {
        let resolution = resolve_thread(
            conn,
            alias.tenant_id,
            alias.id,
            in_reply_to.as_deref(),
            &payload.subject,
            received_at,
        )?;

        let inserted = diesel::sql_query(
            "INSERT INTO email_messages
             (id, tenant_id, thread_id, alias_id, from_address, to_addresses, cc_addresses,
              bcc_addresses, subject, body_text, body_html, message_id, in_reply_to,
              references_list, direction, status, is_read, received_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     'inbound', 'received', false, $15)
             ON CONFLICT ON CONSTRAINT email_messages_message_id_unique DO NOTHING",
        )
        .bind::<diesel::sql_types::Uuid, _>(row_id)
        .bind::<diesel::sql_types::Uuid, _>(alias.tenant_id)
        .bind::<diesel::sql_types::Uuid, _>(resolution.thread_id)
        .bind::<diesel::sql_types::Uuid, _>(alias.id)
        .bind::<diesel::sql_types::Text, _>(&payload.from)
        .bind::<diesel::sql_types::Text, _>(encode_list(&payload.to))
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(
            (!payload.cc.is_empty()).then(|| encode_list(&payload.cc)),
        )
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(
            (!payload.bcc.is_empty()).then(|| encode_list(&payload.bcc)),
        )
        .bind::<diesel::sql_types::Text, _>(&payload.subject)
        .bind::<diesel::sql_types::Text, _>(&payload.text)
        .bind::<diesel::sql_types::Text, _>(&payload.html)
        .bind::<diesel::sql_types::Text, _>(&message_id)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(in_reply_to.as_deref())
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(
            (!references.is_empty()).then(|| encode_list(&references)),
        )
        .bind::<diesel::sql_types::Timestamptz, _>(received_at)
        .execute(conn)?;

        // A concurrent delivery of the same Message-ID won the insert; roll
        // back so no stray thread or aggregate survives.
        if inserted == 0 {
            return Err(diesel::result::Error::RollbackTransaction);
        }

        for attachment in &payload.attachments {
            diesel::sql_query(
                "INSERT INTO email_attachments (id, message_id, filename, content_type, size_bytes)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
            .bind::<diesel::sql_types::Uuid, _>(row_id)
            .bind::<diesel::sql_types::Text, _>(&attachment.filename)
            .bind::<diesel::sql_types::Text, _>(&attachment.content_type)
            .bind::<diesel::sql_types::BigInt, _>(attachment.size)
            .execute(conn)?;
        }

        record_message(conn, resolution.thread_id, received_at, true)?;
        Ok(resolution.thread_id)
    });

    match result {
        Ok(thread_id) => Ok(IngestOutcome::Persisted {
            message_id: row_id,
            thread_id,
        }),
        Err(diesel::result::Error::RollbackTransaction) => {
            let existing = find_stored_message(conn, alias.tenant_id, &message_id)
                .map_err(|e| format!("Dedupe lookup failed: {e}"))?
                .ok_or_else(|| "Duplicate insert lost its original row".to_string())?;
            Ok(IngestOutcome::Duplicate {
                message_id: existing.id,
                thread_id: existing.thread_id,
            })
        }
        Err(e) => Err(format!("Failed to persist inbound message: {e}")),
    }
}

fn find_stored_message(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    message_id: &str,
) -> Result<Option<MessageThreadRow>, diesel::result::Error> {
    diesel::sql_query(
        "SELECT id, thread_id FROM email_messages
         WHERE tenant_id = $1 AND message_id = $2 LIMIT 1",
    )
    .bind::<diesel::sql_types::Uuid, _>(tenant_id)
    .bind::<diesel::sql_types::Text, _>(message_id)
    .get_result(conn)
    .optional()
}

/// Webhook entry point for the upstream receiving provider. Routing misses
/// and duplicates are acknowledged with 200 so the provider never retries
/// them; only persistence failures surface as 5xx.
pub async fn receive_inbound(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InboundWebhookPayload>,
) -> Result<Json<InboundAck>, MailError> {
    let received_at = Utc::now();

    let conn = state.conn.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;
        ingest_payload(&mut db_conn, &payload, received_at)
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    let ack = match outcome {
        IngestOutcome::NoRoute => {
            warn!("inbound message matched no alias, acknowledged without persisting");
            InboundAck {
                success: true,
                persisted: false,
                email_id: None,
                thread_id: None,
                message: Some("No matching alias for any recipient".to_string()),
            }
        }
        IngestOutcome::Persisted {
            message_id,
            thread_id,
        } => {
            info!("inbound message {message_id} stored in thread {thread_id}");
            InboundAck {
                success: true,
                persisted: true,
                email_id: Some(message_id),
                thread_id: Some(thread_id),
                message: None,
            }
        }
        IngestOutcome::Duplicate {
            message_id,
            thread_id,
        } => {
            info!("duplicate delivery of message {message_id}, acknowledged as no-op");
            InboundAck {
                success: true,
                persisted: false,
                email_id: Some(message_id),
                thread_id: Some(thread_id),
                message: Some("Duplicate delivery".to_string()),
            }
        }
    };

    Ok(Json(ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::types::CountRow;
    use crate::shared::utils::DbPool;
    use chrono::Duration;
    use diesel::r2d2::ConnectionManager;
    use diesel_migrations::MigrationHarness;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("Message-Id".to_string(), "<abc@x>".to_string());
        assert_eq!(header_value(&headers, "message-id"), Some("<abc@x>"));
        assert_eq!(header_value(&headers, "MESSAGE-ID"), Some("<abc@x>"));
        assert_eq!(header_value(&headers, "in-reply-to"), None);
    }

    #[test]
    fn angle_brackets_are_trimmed() {
        assert_eq!(trim_angle("<abc@x>"), "abc@x");
        assert_eq!(trim_angle(" abc@x "), "abc@x");
        assert_eq!(trim_angle("<abc@x"), "abc@x");
    }

    #[test]
    fn references_header_splits_and_unwraps() {
        assert_eq!(
            parse_references_header("<a@x> <b@x>  <c@x>"),
            vec!["a@x", "b@x", "c@x"]
        );
        assert!(parse_references_header("").is_empty());
    }

    #[test]
    fn synthesized_id_uses_timestamp() {
        let at = Utc::now();
        let id = synthesize_message_id(at);
        assert_eq!(id, format!("{}@inbound", at.timestamp_millis()));
    }

    #[test]
    fn payload_deserializes_with_sparse_fields() {
        let raw = r#"{
            "from": "Customer <customer@example.com>",
            "to": ["info@acme.test"],
            "subject": "Website question",
            "text": "Hello",
            "html": "<p>Hello</p>",
            "headers": { "message-id": "<m1@example.com>" },
            "attachments": [{ "filename": "logo.png", "content_type": "image/png", "size": 512 }]
        }"#;
        let payload: InboundWebhookPayload = serde_json::from_str(raw).unwrap();
        assert!(payload.cc.is_empty());
        assert!(payload.reply_to.is_none());
        assert_eq!(payload.attachments.len(), 1);
        assert_eq!(payload.attachments[0].size, 512);
    }

    #[test]
    fn ack_serializes_wire_field_names() {
        let ack = InboundAck {
            success: true,
            persisted: true,
            email_id: Some(Uuid::nil()),
            thread_id: None,
            message: None,
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["success"], true);
        assert!(value.get("emailId").is_some());
        assert!(value.get("threadId").is_none());
        assert!(value.get("message").is_none());
    }

    // ===== Database-backed flow tests (skipped without TEST_DATABASE_URL) =====

    fn test_pool() -> Option<DbPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let manager = ConnectionManager::new(url);
        let pool = DbPool::builder().max_size(2).build(manager).ok()?;
        let mut conn = pool.get().ok()?;
        conn.run_pending_migrations(crate::MIGRATIONS).ok()?;
        Some(pool)
    }

    fn seed_alias(conn: &mut PgConnection, tenant_id: Uuid, local: &str, domain: &str) {
        diesel::sql_query(
            "INSERT INTO email_aliases (id, tenant_id, local_part, domain, display_name, is_default)
             VALUES ($1, $2, $3, $4, 'Test Inbox', true)",
        )
        .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
        .bind::<diesel::sql_types::Uuid, _>(tenant_id)
        .bind::<diesel::sql_types::Text, _>(local)
        .bind::<diesel::sql_types::Text, _>(domain)
        .execute(conn)
        .unwrap();
    }

    fn payload(to: &str, subject: &str, message_id: Option<&str>, in_reply_to: Option<&str>) -> InboundWebhookPayload {
        let mut headers = HashMap::new();
        if let Some(id) = message_id {
            headers.insert("message-id".to_string(), format!("<{id}>"));
        }
        if let Some(parent) = in_reply_to {
            headers.insert("in-reply-to".to_string(), format!("<{parent}>"));
        }
        InboundWebhookPayload {
            from: "Customer <customer@example.com>".to_string(),
            to: vec![to.to_string()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.to_string(),
            text: "body".to_string(),
            html: String::new(),
            reply_to: None,
            headers,
            attachments: Vec::new(),
        }
    }

    fn message_count(conn: &mut PgConnection, tenant_id: Uuid) -> i64 {
        let row: CountRow =
            diesel::sql_query("SELECT COUNT(*) AS count FROM email_messages WHERE tenant_id = $1")
                .bind::<diesel::sql_types::Uuid, _>(tenant_id)
                .get_result(conn)
                .unwrap();
        row.count
    }

    fn thread_aggregates(conn: &mut PgConnection, thread_id: Uuid) -> (i32, DateTime<Utc>) {
        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = diesel::sql_types::Integer)]
            message_count: i32,
            #[diesel(sql_type = diesel::sql_types::Timestamptz)]
            last_message_at: DateTime<Utc>,
        }
        let row: Row = diesel::sql_query(
            "SELECT message_count, last_message_at FROM email_threads WHERE id = $1",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .get_result(conn)
        .unwrap();
        (row.message_count, row.last_message_at)
    }

    #[test]
    fn routing_miss_persists_nothing() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().unwrap();
        let tenant = Uuid::new_v4();

        let outcome = ingest_payload(
            &mut conn,
            &payload("nobody@unknown.test", "Hi", Some("miss-1@x"), None),
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(outcome, IngestOutcome::NoRoute));
        assert_eq!(message_count(&mut conn, tenant), 0);
    }

    #[test]
    fn redelivery_is_idempotent() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().unwrap();
        let tenant = Uuid::new_v4();
        let domain = format!("{}.test", Uuid::new_v4().simple());
        seed_alias(&mut conn, tenant, "info", &domain);

        let incoming = payload(&format!("info@{domain}"), "Hello", Some("dup-1@example.com"), None);
        let first = ingest_payload(&mut conn, &incoming, Utc::now()).unwrap();
        let IngestOutcome::Persisted { message_id, thread_id } = first else {
            panic!("first delivery should persist");
        };

        let second = ingest_payload(&mut conn, &incoming, Utc::now()).unwrap();
        match second {
            IngestOutcome::Duplicate {
                message_id: dup_id,
                thread_id: dup_thread,
            } => {
                assert_eq!(dup_id, message_id);
                assert_eq!(dup_thread, thread_id);
            }
            other => panic!("redelivery should be a no-op, got {other:?}"),
        }
        assert_eq!(message_count(&mut conn, tenant), 1);
        assert_eq!(thread_aggregates(&mut conn, thread_id).0, 1);
    }

    #[test]
    fn in_reply_to_beats_subject_text() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().unwrap();
        let tenant = Uuid::new_v4();
        let domain = format!("{}.test", Uuid::new_v4().simple());
        seed_alias(&mut conn, tenant, "info", &domain);
        let to = format!("info@{domain}");

        let first = ingest_payload(
            &mut conn,
            &payload(&to, "Original subject", Some("root-1@example.com"), None),
            Utc::now(),
        )
        .unwrap();
        let IngestOutcome::Persisted { thread_id, .. } = first else {
            panic!("expected persist");
        };

        let reply = ingest_payload(
            &mut conn,
            &payload(&to, "Completely different subject", Some("reply-1@example.com"), Some("root-1@example.com")),
            Utc::now(),
        )
        .unwrap();
        let IngestOutcome::Persisted { thread_id: reply_thread, .. } = reply else {
            panic!("expected persist");
        };
        assert_eq!(reply_thread, thread_id);
    }

    #[test]
    fn subject_window_joins_within_seven_days_only() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().unwrap();
        let tenant = Uuid::new_v4();
        let domain = format!("{}.test", Uuid::new_v4().simple());
        seed_alias(&mut conn, tenant, "info", &domain);
        let to = format!("info@{domain}");
        let start = Utc::now();

        let first = ingest_payload(
            &mut conn,
            &payload(&to, "Quote request", Some("w1@example.com"), None),
            start,
        )
        .unwrap();
        let IngestOutcome::Persisted { thread_id, .. } = first else {
            panic!("expected persist");
        };

        let two_hours = ingest_payload(
            &mut conn,
            &payload(&to, "Re: Quote request", Some("w2@example.com"), None),
            start + Duration::hours(2),
        )
        .unwrap();
        let IngestOutcome::Persisted { thread_id: joined, .. } = two_hours else {
            panic!("expected persist");
        };
        assert_eq!(joined, thread_id);

        let (count, last_at) = thread_aggregates(&mut conn, thread_id);
        assert_eq!(count, 2);
        assert_eq!(last_at, start + Duration::hours(2));

        let nine_days = ingest_payload(
            &mut conn,
            &payload(&to, "Re: Quote request", Some("w3@example.com"), None),
            start + Duration::days(9),
        )
        .unwrap();
        let IngestOutcome::Persisted { thread_id: fresh, .. } = nine_days else {
            panic!("expected persist");
        };
        assert_ne!(fresh, thread_id);
    }

    #[test]
    fn attachments_persist_with_their_message() {
        let Some(pool) = test_pool() else { return };
        let mut conn = pool.get().unwrap();
        let tenant = Uuid::new_v4();
        let domain = format!("{}.test", Uuid::new_v4().simple());
        seed_alias(&mut conn, tenant, "files", &domain);

        let mut incoming = payload(&format!("files@{domain}"), "Scans", Some("att-1@example.com"), None);
        incoming.attachments = vec![
            crate::mail::types::InboundAttachment {
                filename: "scan.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                size: 20480,
            },
            crate::mail::types::InboundAttachment {
                filename: "photo.jpg".to_string(),
                content_type: "image/jpeg".to_string(),
                size: 1024,
            },
        ];

        let outcome = ingest_payload(&mut conn, &incoming, Utc::now()).unwrap();
        let IngestOutcome::Persisted { message_id, .. } = outcome else {
            panic!("expected persist");
        };

        let row: CountRow = diesel::sql_query(
            "SELECT COUNT(*) AS count FROM email_attachments WHERE message_id = $1",
        )
        .bind::<diesel::sql_types::Uuid, _>(message_id)
        .get_result(&mut conn)
        .unwrap();
        assert_eq!(row.count, 2);
    }
}
