use diesel_migrations::MigrationHarness;
use log::info;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use hubserver::config::AppConfig;
use hubserver::mail::provider::ProviderClient;
use hubserver::shared::state::AppState;
use hubserver::shared::utils::create_conn;
use hubserver::MIGRATIONS;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env()?;
    let pool = create_conn(&config.database_url)?;

    {
        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Migration failed: {e}"))?;
    }

    let provider = ProviderClient::new(&config.mail)?;
    let state = Arc::new(AppState {
        conn: pool,
        config: config.clone(),
        provider,
    });

    let app = axum::Router::new()
        .merge(hubserver::mail::configure())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
