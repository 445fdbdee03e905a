use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::PgConnection;
use log::info;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::schema::email_aliases;
use crate::shared::state::AppState;

use super::types::{Alias, ApiResponse, CreateAliasRequest, MailError, TenantQuery, UpdateAliasRequest};

/// Pulls `local@domain` out of a recipient value, accepting both bare
/// addresses and `Display Name <local@domain>` forms. Lower-cased on the way
/// out so lookups are exact.
pub fn parse_address(raw: &str) -> Option<(String, String)> {
    let inner = match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    let addr = inner.trim().to_lowercase();
    let (local, domain) = addr.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some((local.to_string(), domain.to_string()))
}

/// Scans candidate recipients in header order and returns the first alias
/// match. When a message is addressed to aliases of two different tenants the
/// earlier recipient wins; that is deliberate routing policy, not an accident.
/// `None` is a routing miss: the caller acknowledges without persisting.
pub fn resolve_alias(
    conn: &mut PgConnection,
    candidates: &[String],
) -> Result<Option<Alias>, diesel::result::Error> {
    use email_aliases::dsl;

    for candidate in candidates {
        let Some((local, dom)) = parse_address(candidate) else {
            continue;
        };
        let found = dsl::email_aliases
            .filter(dsl::local_part.eq(&local).and(dsl::domain.eq(&dom)))
            .first::<Alias>(conn)
            .optional()?;
        if let Some(alias) = found {
            return Ok(Some(alias));
        }
    }
    Ok(None)
}

enum CreateOutcome {
    Created(Alias),
    AddressTaken,
}

pub async fn create_alias(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateAliasRequest>,
) -> Result<Json<ApiResponse<Alias>>, MailError> {
    let local = request.local_part.trim().to_lowercase();
    let dom = request
        .domain
        .as_deref()
        .unwrap_or(&state.config.mail.default_domain)
        .trim()
        .to_lowercase();
    if local.is_empty() || dom.is_empty() || local.contains('@') || dom.contains('@') {
        return Ok(Json(ApiResponse {
            success: false,
            data: None,
            message: Some("Invalid alias address".to_string()),
        }));
    }

    let conn = state.conn.clone();
    let insert_local = local.clone();
    let insert_dom = dom.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        use email_aliases::dsl;
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        let result = db_conn.transaction::<Alias, diesel::result::Error, _>(|db_conn| {
            if request.is_default {
                diesel::update(
                    dsl::email_aliases.filter(
                        dsl::tenant_id
                            .eq(request.tenant_id)
                            .and(dsl::is_default.eq(true)),
                    ),
                )
                .set(dsl::is_default.eq(false))
                .execute(db_conn)?;
            }

            let alias_id = Uuid::new_v4();
            diesel::insert_into(dsl::email_aliases)
                .values((
                    dsl::id.eq(alias_id),
                    dsl::tenant_id.eq(request.tenant_id),
                    dsl::local_part.eq(&insert_local),
                    dsl::domain.eq(&insert_dom),
                    dsl::display_name.eq(request.display_name.as_ref()),
                    dsl::is_default.eq(request.is_default),
                ))
                .execute(db_conn)?;

            dsl::email_aliases.find(alias_id).first::<Alias>(db_conn)
        });

        match result {
            Ok(alias) => Ok::<_, String>(CreateOutcome::Created(alias)),
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Ok(CreateOutcome::AddressTaken)
            }
            Err(e) => Err(format!("Failed to create alias: {e}")),
        }
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    match outcome {
        CreateOutcome::Created(alias) => {
            info!("alias {} created for tenant {}", alias.address(), alias.tenant_id);
            Ok(Json(ApiResponse {
                success: true,
                data: Some(alias),
                message: None,
            }))
        }
        CreateOutcome::AddressTaken => Ok(Json(ApiResponse {
            success: false,
            data: None,
            message: Some(format!("Address {local}@{dom} is already in use")),
        })),
    }
}

pub async fn list_aliases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<ApiResponse<Vec<Alias>>>, MailError> {
    let conn = state.conn.clone();
    let aliases = tokio::task::spawn_blocking(move || {
        use email_aliases::dsl;
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        dsl::email_aliases
            .filter(dsl::tenant_id.eq(query.tenant_id))
            .order((dsl::is_default.desc(), dsl::local_part.asc()))
            .load::<Alias>(&mut db_conn)
            .map_err(|e| format!("Failed to list aliases: {e}"))
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    Ok(Json(ApiResponse {
        success: true,
        data: Some(aliases),
        message: None,
    }))
}

#[derive(AsChangeset)]
#[diesel(table_name = email_aliases)]
struct AliasChanges {
    display_name: Option<String>,
    is_default: Option<bool>,
    updated_at: DateTime<Utc>,
}

pub async fn update_alias(
    State(state): State<Arc<AppState>>,
    Path(alias_id): Path<Uuid>,
    Json(request): Json<UpdateAliasRequest>,
) -> Result<Json<ApiResponse<Alias>>, MailError> {
    let conn = state.conn.clone();
    let updated = tokio::task::spawn_blocking(move || {
        use email_aliases::dsl;
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        db_conn
            .transaction::<Alias, diesel::result::Error, _>(|db_conn| {
                let current = dsl::email_aliases.find(alias_id).first::<Alias>(db_conn)?;

                if request.is_default == Some(true) {
                    diesel::update(
                        dsl::email_aliases.filter(
                            dsl::tenant_id
                                .eq(current.tenant_id)
                                .and(dsl::is_default.eq(true)),
                        ),
                    )
                    .set(dsl::is_default.eq(false))
                    .execute(db_conn)?;
                }

                diesel::update(dsl::email_aliases.find(alias_id))
                    .set(AliasChanges {
                        display_name: request.display_name.clone(),
                        is_default: request.is_default,
                        updated_at: Utc::now(),
                    })
                    .execute(db_conn)?;

                dsl::email_aliases.find(alias_id).first::<Alias>(db_conn)
            })
            .map_err(|e| format!("Failed to update alias: {e}"))
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    Ok(Json(ApiResponse {
        success: true,
        data: Some(updated),
        message: None,
    }))
}

/// Deleting an alias orphans its messages' alias reference (FK set-null) but
/// never touches the messages or threads themselves.
pub async fn delete_alias(
    State(state): State<Arc<AppState>>,
    Path(alias_id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, MailError> {
    let conn = state.conn.clone();
    tokio::task::spawn_blocking(move || {
        use email_aliases::dsl;
        let mut db_conn = conn.get().map_err(|e| format!("DB connection error: {e}"))?;

        diesel::delete(dsl::email_aliases.find(alias_id))
            .execute(&mut db_conn)
            .map_err(|e| format!("Failed to delete alias: {e}"))
    })
    .await
    .map_err(|e| MailError(format!("Task join error: {e}")))?
    .map_err(MailError)?;

    info!("alias {alias_id} deleted");

    Ok(Json(ApiResponse {
        success: true,
        data: Some(()),
        message: Some("Alias deleted".to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_address() {
        assert_eq!(
            parse_address("info@acme.com"),
            Some(("info".to_string(), "acme.com".to_string()))
        );
    }

    #[test]
    fn parse_display_name_form() {
        assert_eq!(
            parse_address("Acme Support <Support@Acme.Com>"),
            Some(("support".to_string(), "acme.com".to_string()))
        );
    }

    #[test]
    fn parse_lowercases_both_parts() {
        assert_eq!(
            parse_address("SALES@Example.ORG"),
            Some(("sales".to_string(), "example.org".to_string()))
        );
    }

    #[test]
    fn parse_rejects_invalid_values() {
        assert_eq!(parse_address("not-an-address"), None);
        assert_eq!(parse_address("@missing-local.com"), None);
        assert_eq!(parse_address("missing-domain@"), None);
        assert_eq!(parse_address(""), None);
    }

    #[test]
    fn parse_trims_whitespace() {
        assert_eq!(
            parse_address("  hello@world.io  "),
            Some(("hello".to_string(), "world.io".to_string()))
        );
    }

    #[test]
    fn create_request_domain_is_optional() {
        let raw = r#"{"tenant_id":"00000000-0000-0000-0000-000000000000","local_part":"info"}"#;
        let request: CreateAliasRequest = serde_json::from_str(raw).unwrap();
        assert!(request.domain.is_none());
        assert!(!request.is_default);

        let raw = r#"{"tenant_id":"00000000-0000-0000-0000-000000000000","local_part":"info","domain":"acme.com"}"#;
        let request: CreateAliasRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.domain.as_deref(), Some("acme.com"));
    }
}
