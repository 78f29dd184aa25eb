use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, StoreBackend};
use crate::db;
use crate::timeclock::{memory::MemoryTimeclockRepo, repo::PgTimeclockRepo, repo::TimeclockRepo};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Arc<dyn TimeclockRepo>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let repo = match config.store {
            StoreBackend::Postgres => {
                let pool = db::connect(&config).await?;
                db::run_migrations(&pool).await?;
                Arc::new(PgTimeclockRepo::new(pool)) as Arc<dyn TimeclockRepo>
            }
            StoreBackend::Memory => {
                tracing::warn!("using the in-memory store; data is lost on restart");
                Arc::new(MemoryTimeclockRepo::new()) as Arc<dyn TimeclockRepo>
            }
        };

        Ok(Self::from_parts(config, repo, Arc::new(SystemClock)))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        repo: Arc<dyn TimeclockRepo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            repo,
            clock,
        }
    }
}

#[cfg(test)]
impl AppState {
    pub fn test_config() -> AppConfig {
        AppConfig {
            store: StoreBackend::Memory,
            database_url: None,
            db_max_connections: 1,
            jwt: crate::config::JwtConfig {
                secret: "test".into(),
                issuer: "test".into(),
                audience: "test".into(),
                ttl_minutes: 5,
            },
            geofence_policy: Default::default(),
        }
    }

    /// In-memory store, system clock, advisory geofence policy.
    pub fn fake() -> Self {
        Self::from_parts(
            Arc::new(Self::test_config()),
            Arc::new(MemoryTimeclockRepo::new()),
            Arc::new(SystemClock),
        )
    }
}
