use crate::config::AppConfig;
use crate::mail::provider::ProviderClient;
use crate::shared::utils::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub provider: ProviderClient,
}
