use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;

use crate::timeclock::geofence::GeofencePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

/// Which `TimeclockRepo` implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub jwt: JwtConfig,
    pub geofence_policy: GeofencePolicy,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let store = match std::env::var("TIMECLOCK_STORE") {
            Ok(v) => v.parse().context("TIMECLOCK_STORE")?,
            Err(_) => StoreBackend::Postgres,
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if store == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when TIMECLOCK_STORE=postgres");
        }

        let db_max_connections = parse_env("DB_MAX_CONNECTIONS", 10)?;

        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "jobclock".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "jobclock-users".into()),
            ttl_minutes: parse_env("JWT_TTL_MINUTES", 60)?,
        };

        let geofence_policy = match std::env::var("GEOFENCE_POLICY") {
            Ok(v) => v.parse().context("GEOFENCE_POLICY")?,
            Err(_) => GeofencePolicy::default(),
        };

        Ok(Self {
            store,
            database_url,
            db_max_connections,
            jwt,
            geofence_policy,
        })
    }
}

fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{v}'")),
        Err(_) => Ok(default),
    }
}
