use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::MailConfig;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Wraps a threading identifier in angle brackets for the wire.
pub fn angle_wrap(message_id: &str) -> String {
    format!("<{message_id}>")
}

/// Space-joined, angle-bracket-wrapped References header value.
pub fn join_references(references: &[String]) -> String {
    references
        .iter()
        .map(|r| angle_wrap(r))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub headers: OutboundHeaders,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundHeaders {
    #[serde(rename = "Message-ID")]
    pub message_id: String,
    #[serde(rename = "In-Reply-To", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(rename = "References", skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

impl OutboundHeaders {
    /// Builds wire headers from bare identifiers; References is omitted when
    /// the chain is empty (a fresh conversation).
    pub fn new(message_id: &str, in_reply_to: Option<&str>, references: &[String]) -> Self {
        OutboundHeaders {
            message_id: angle_wrap(message_id),
            in_reply_to: in_reply_to.map(angle_wrap),
            references: if references.is_empty() {
                None
            } else {
                Some(join_references(references))
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

/// Outbound send rejection, categorized so the dashboard can show a useful
/// message instead of a raw provider payload.
#[derive(Debug)]
pub enum ProviderError {
    DomainNotVerified(String),
    RateLimited,
    InvalidRecipient(String),
    Api { status: u16, message: String },
    Transport(reqwest::Error),
}

impl ProviderError {
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::DomainNotVerified(_) => {
                "Your sending domain is not verified yet. Verify it before sending email.".to_string()
            }
            ProviderError::RateLimited => {
                "Sending limit reached. Wait a moment and try again.".to_string()
            }
            ProviderError::InvalidRecipient(_) => {
                "One of the recipient addresses was rejected.".to_string()
            }
            ProviderError::Api { .. } | ProviderError::Transport(_) => {
                "The email could not be sent. Please try again.".to_string()
            }
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::DomainNotVerified(msg) => write!(f, "sending domain not verified: {msg}"),
            ProviderError::RateLimited => write!(f, "provider rate limit hit"),
            ProviderError::InvalidRecipient(msg) => write!(f, "invalid recipient: {msg}"),
            ProviderError::Api { status, message } => {
                write!(f, "provider rejected send ({status}): {message}")
            }
            ProviderError::Transport(e) => write!(f, "provider request failed: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

fn categorize(status: StatusCode, name: &str, message: &str) -> ProviderError {
    let text = format!("{name} {message}").to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited;
    }
    // A bare 403 can also be an API-key permission failure; only a domain
    // hint in the body makes it a verification problem.
    if text.contains("domain") && (text.contains("verif") || status == StatusCode::FORBIDDEN) {
        return ProviderError::DomainNotVerified(message.to_string());
    }
    if (status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY)
        && (text.contains("recipient") || text.contains("to address") || text.contains("invalid email"))
    {
        return ProviderError::InvalidRecipient(message.to_string());
    }
    ProviderError::Api {
        status: status.as_u16(),
        message: message.to_string(),
    }
}

/// HTTP client for the transactional email provider. One synchronous call per
/// send, no internal retry; failures surface to the caller.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("Failed to build provider HTTP client")?;

        Ok(ProviderClient {
            http,
            base_url: config.provider_url.trim_end_matches('/').to_string(),
            api_key: config.provider_api_key.clone(),
        })
    }

    /// Submits one email. Returns the provider's delivery id for audit.
    pub async fn send(&self, email: &OutboundEmail) -> Result<String, ProviderError> {
        let url = format!("{}/emails", self.base_url);
        debug!("provider send to {:?} via {url}", email.to);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(email)
            .send()
            .await
            .map_err(ProviderError::Transport)?;

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response
                .json()
                .await
                .map_err(ProviderError::Transport)?;
            return Ok(body.id);
        }

        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        let err = categorize(status, &body.name, &body.message);
        warn!("provider send failed: {err}");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_category() {
        let err = categorize(StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded", "slow down");
        assert!(matches!(err, ProviderError::RateLimited));
    }

    #[test]
    fn unverified_domain_category() {
        let err = categorize(StatusCode::FORBIDDEN, "validation_error", "domain is not verified");
        assert!(matches!(err, ProviderError::DomainNotVerified(_)));

        let err = categorize(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "The domain must be verified first",
        );
        assert!(matches!(err, ProviderError::DomainNotVerified(_)));
    }

    #[test]
    fn forbidden_without_domain_hint_stays_generic() {
        let err = categorize(
            StatusCode::FORBIDDEN,
            "restricted_api_key",
            "this key is not allowed to send",
        );
        match err {
            ProviderError::Api { status, .. } => assert_eq!(status, 403),
            other => panic!("unexpected category: {other}"),
        }
    }

    #[test]
    fn invalid_recipient_category() {
        let err = categorize(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "invalid email recipient",
        );
        assert!(matches!(err, ProviderError::InvalidRecipient(_)));
    }

    #[test]
    fn unknown_errors_keep_status_and_message() {
        let err = categorize(StatusCode::INTERNAL_SERVER_ERROR, "", "boom");
        match err {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected category: {other}"),
        }
    }

    #[test]
    fn user_messages_are_presentable() {
        let errors = [
            categorize(StatusCode::TOO_MANY_REQUESTS, "", ""),
            categorize(StatusCode::FORBIDDEN, "", "domain not verified"),
            categorize(StatusCode::BAD_REQUEST, "", "invalid email recipient"),
            categorize(StatusCode::BAD_GATEWAY, "", "upstream"),
        ];
        for err in errors {
            let msg = err.user_message();
            assert!(!msg.is_empty());
            assert!(!msg.to_lowercase().contains("error:"));
        }
    }

    #[test]
    fn headers_wrap_identifiers() {
        let headers = OutboundHeaders::new(
            "abc@acme.com",
            Some("parent@acme.com"),
            &["z@x".to_string(), "parent@acme.com".to_string()],
        );
        assert_eq!(headers.message_id, "<abc@acme.com>");
        assert_eq!(headers.in_reply_to.as_deref(), Some("<parent@acme.com>"));
        assert_eq!(headers.references.as_deref(), Some("<z@x> <parent@acme.com>"));
    }

    #[test]
    fn headers_omit_empty_reference_chain() {
        let headers = OutboundHeaders::new("abc@acme.com", None, &[]);
        assert!(headers.in_reply_to.is_none());
        assert!(headers.references.is_none());

        let value = serde_json::to_value(&headers).unwrap();
        assert_eq!(value["Message-ID"], "<abc@acme.com>");
        assert!(value.get("In-Reply-To").is_none());
        assert!(value.get("References").is_none());
    }

    #[test]
    fn outbound_email_serializes_wire_shape() {
        let email = OutboundEmail {
            from: "Acme Support <support@acme.com>".to_string(),
            to: vec!["customer@example.com".to_string()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "Re: Quote request".to_string(),
            text: "Hi".to_string(),
            html: "<p>Hi</p>".to_string(),
            headers: OutboundHeaders::new("abc@acme.com", None, &[]),
        };
        let value = serde_json::to_value(&email).unwrap();
        assert_eq!(value["from"], "Acme Support <support@acme.com>");
        assert_eq!(value["to"][0], "customer@example.com");
        assert!(value.get("cc").is_none());
        assert_eq!(value["headers"]["Message-ID"], "<abc@acme.com>");
    }
}
