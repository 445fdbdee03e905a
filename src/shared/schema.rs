diesel::table! {
    email_aliases (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        local_part -> Varchar,
        domain -> Varchar,
        display_name -> Nullable<Varchar>,
        is_default -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    email_threads (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        alias_id -> Nullable<Uuid>,
        subject -> Text,
        normalized_subject -> Text,
        message_count -> Int4,
        last_message_at -> Timestamptz,
        is_read -> Bool,
        is_starred -> Bool,
        is_archived -> Bool,
        is_trashed -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    email_messages (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        thread_id -> Uuid,
        alias_id -> Nullable<Uuid>,
        from_address -> Text,
        to_addresses -> Text,
        cc_addresses -> Nullable<Text>,
        bcc_addresses -> Nullable<Text>,
        subject -> Text,
        body_text -> Text,
        body_html -> Text,
        message_id -> Varchar,
        in_reply_to -> Nullable<Varchar>,
        references_list -> Nullable<Text>,
        direction -> Varchar,
        status -> Varchar,
        provider_message_id -> Nullable<Varchar>,
        is_read -> Bool,
        is_starred -> Bool,
        sent_at -> Nullable<Timestamptz>,
        received_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    email_attachments (id) {
        id -> Uuid,
        message_id -> Uuid,
        filename -> Text,
        content_type -> Text,
        size_bytes -> Int8,
        storage_path -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    thread_read_states (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        user_id -> Uuid,
        thread_id -> Uuid,
        last_read_at -> Timestamptz,
    }
}

diesel::joinable!(email_messages -> email_threads (thread_id));
diesel::joinable!(email_attachments -> email_messages (message_id));

diesel::allow_tables_to_appear_in_same_query!(
    email_aliases,
    email_threads,
    email_messages,
    email_attachments,
    thread_read_states,
);
