#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub mail: MailConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings for the transactional email provider and the tenant mail domain.
#[derive(Clone)]
pub struct MailConfig {
    pub provider_url: String,
    pub provider_api_key: String,
    pub default_domain: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://hubuser:@localhost:5432/hubserver".to_string());

        Ok(AppConfig {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            database_url,
            mail: MailConfig {
                provider_url: std::env::var("MAIL_PROVIDER_URL")
                    .unwrap_or_else(|_| "https://api.resend.com".to_string()),
                provider_api_key: std::env::var("MAIL_PROVIDER_API_KEY").unwrap_or_default(),
                default_domain: std::env::var("MAIL_DEFAULT_DOMAIN")
                    .unwrap_or_else(|_| "mail.localhost".to_string()),
            },
        })
    }
}
