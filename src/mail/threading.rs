use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::debug;
use uuid::Uuid;

use super::types::{MessageThreadRow, ThreadIdRow};

/// Subject-window fallback horizon for grouping header-less replies.
pub const SUBJECT_WINDOW_DAYS: i64 = 7;

const REPLY_PREFIXES: [&str; 3] = ["re:", "fwd:", "fw:"];

#[derive(Debug, Clone, Copy)]
pub struct ThreadResolution {
    pub thread_id: Uuid,
    pub created: bool,
}

/// Strips repeated leading reply/forward tokens and lower-cases the rest,
/// producing the key used for subject-window matching.
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    'outer: loop {
        for prefix in REPLY_PREFIXES {
            let matched = rest
                .get(..prefix.len())
                .map(|head| head.eq_ignore_ascii_case(prefix))
                .unwrap_or(false);
            if matched {
                rest = rest[prefix.len()..].trim_start();
                continue 'outer;
            }
        }
        break;
    }
    rest.trim().to_lowercase()
}

/// Ordered, de-duplicated ancestry chain for a reply: the target's own
/// References followed by its Message-ID.
pub fn build_references(prior_refs: &[String], prior_message_id: &str) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(prior_refs.len() + 1);
    for entry in prior_refs.iter().map(String::as_str).chain([prior_message_id]) {
        if entry.is_empty() || chain.iter().any(|seen| seen == entry) {
            continue;
        }
        chain.push(entry.to_string());
    }
    chain
}

/// Serializes concurrent resolution for one conversation key. Two first
/// messages with the same normalized subject take the same lock and the
/// second one finds the thread the first committed.
fn lock_conversation_key(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    alias_id: Uuid,
    normalized_subject: &str,
) -> Result<(), diesel::result::Error> {
    let key = format!("{}:{}:{}", tenant_id, alias_id, normalized_subject);
    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind::<diesel::sql_types::Text, _>(&key)
        .execute(conn)?;
    Ok(())
}

/// Places a message into its conversation. Must run inside the transaction
/// that also persists the message so the created thread and its aggregates
/// commit together.
///
/// Priority order: exact In-Reply-To match on a stored Message-ID, then a
/// same-alias subject match within the last seven days, then a new thread.
pub fn resolve_thread(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    alias_id: Uuid,
    in_reply_to: Option<&str>,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<ThreadResolution, diesel::result::Error> {
    // Protocol headers are authoritative; subject text never overrides them.
    if let Some(parent_id) = in_reply_to.filter(|v| !v.is_empty()) {
        let parent: Option<MessageThreadRow> = diesel::sql_query(
            "SELECT id, thread_id FROM email_messages
             WHERE tenant_id = $1 AND message_id = $2 LIMIT 1",
        )
        .bind::<diesel::sql_types::Uuid, _>(tenant_id)
        .bind::<diesel::sql_types::Text, _>(parent_id)
        .get_result(conn)
        .optional()?;

        if let Some(parent) = parent {
            debug!("thread match via In-Reply-To {parent_id} -> {}", parent.thread_id);
            return Ok(ThreadResolution {
                thread_id: parent.thread_id,
                created: false,
            });
        }
    }

    let normalized = normalize_subject(subject);
    lock_conversation_key(conn, tenant_id, alias_id, &normalized)?;

    let window_start = now - Duration::days(SUBJECT_WINDOW_DAYS);
    // Latest activity wins; thread id breaks exact-timestamp ties.
    let recent: Option<ThreadIdRow> = diesel::sql_query(
        "SELECT id FROM email_threads
         WHERE tenant_id = $1 AND alias_id = $2 AND normalized_subject = $3
           AND last_message_at >= $4 AND is_trashed = false
         ORDER BY last_message_at DESC, id DESC LIMIT 1",
    )
    .bind::<diesel::sql_types::Uuid, _>(tenant_id)
    .bind::<diesel::sql_types::Uuid, _>(alias_id)
    .bind::<diesel::sql_types::Text, _>(&normalized)
    .bind::<diesel::sql_types::Timestamptz, _>(window_start)
    .get_result(conn)
    .optional()?;

    if let Some(row) = recent {
        debug!("thread match via subject window -> {}", row.id);
        return Ok(ThreadResolution {
            thread_id: row.id,
            created: false,
        });
    }

    let thread_id = create_thread(conn, tenant_id, alias_id, subject, now, false)?;
    Ok(ThreadResolution {
        thread_id,
        created: true,
    })
}

/// New thread carrying the raw subject; message count starts at zero and is
/// advanced by `record_message`. An inbound first message opens the thread
/// unread; an outbound one is already read by its author.
pub fn create_thread(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    alias_id: Uuid,
    subject: &str,
    now: DateTime<Utc>,
    is_read: bool,
) -> Result<Uuid, diesel::result::Error> {
    let thread_id = Uuid::new_v4();
    diesel::sql_query(
        "INSERT INTO email_threads
         (id, tenant_id, alias_id, subject, normalized_subject, message_count, last_message_at, is_read)
         VALUES ($1, $2, $3, $4, $5, 0, $6, $7)",
    )
    .bind::<diesel::sql_types::Uuid, _>(thread_id)
    .bind::<diesel::sql_types::Uuid, _>(tenant_id)
    .bind::<diesel::sql_types::Uuid, _>(alias_id)
    .bind::<diesel::sql_types::Text, _>(subject)
    .bind::<diesel::sql_types::Text, _>(normalize_subject(subject))
    .bind::<diesel::sql_types::Timestamptz, _>(now)
    .bind::<diesel::sql_types::Bool, _>(is_read)
    .execute(conn)?;
    Ok(thread_id)
}

/// Advances the derived aggregates after a message insert. Runs in the same
/// transaction as the insert; `mark_unread` is set for inbound messages only.
pub fn record_message(
    conn: &mut PgConnection,
    thread_id: Uuid,
    at: DateTime<Utc>,
    mark_unread: bool,
) -> Result<(), diesel::result::Error> {
    if mark_unread {
        diesel::sql_query(
            "UPDATE email_threads
             SET message_count = message_count + 1,
                 last_message_at = GREATEST(last_message_at, $2),
                 is_read = false,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Timestamptz, _>(at)
        .execute(conn)?;
    } else {
        diesel::sql_query(
            "UPDATE email_threads
             SET message_count = message_count + 1,
                 last_message_at = GREATEST(last_message_at, $2),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind::<diesel::sql_types::Uuid, _>(thread_id)
        .bind::<diesel::sql_types::Timestamptz, _>(at)
        .execute(conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_single_reply_prefix() {
        assert_eq!(normalize_subject("Re: Quote request"), "quote request");
    }

    #[test]
    fn normalize_strips_repeated_mixed_prefixes() {
        assert_eq!(normalize_subject("RE: Fwd: FW: Website question"), "website question");
        assert_eq!(normalize_subject("re:re: hello"), "hello");
    }

    #[test]
    fn normalize_keeps_non_prefix_tokens() {
        assert_eq!(normalize_subject("Regarding your order"), "regarding your order");
        assert_eq!(normalize_subject("Reply: soon"), "reply: soon");
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_subject("  Quote Request  "), "quote request");
        assert_eq!(normalize_subject(""), "");
    }

    #[test]
    fn normalize_handles_multibyte_subjects() {
        assert_eq!(normalize_subject("Re: Précis"), "précis");
        assert_eq!(normalize_subject("Ré: hello"), "ré: hello");
    }

    #[test]
    fn references_appends_parent_message_id() {
        let refs = vec!["z@x".to_string()];
        assert_eq!(build_references(&refs, "abc@x"), vec!["z@x", "abc@x"]);
    }

    #[test]
    fn references_deduplicates_preserving_order() {
        let refs = vec!["a@x".to_string(), "b@x".to_string(), "a@x".to_string()];
        assert_eq!(build_references(&refs, "b@x"), vec!["a@x", "b@x"]);
    }

    #[test]
    fn references_skips_empty_entries() {
        let refs = vec![String::new(), "a@x".to_string()];
        assert_eq!(build_references(&refs, "c@x"), vec!["a@x", "c@x"]);
    }

    #[test]
    fn references_from_scratch() {
        assert_eq!(build_references(&[], "root@x"), vec!["root@x"]);
    }
}
