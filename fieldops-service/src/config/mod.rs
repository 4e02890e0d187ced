use secrecy::Secret;
use serde::Deserialize;
use service_core::config::Config as CommonConfig;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;

const WEBHOOK_SECRET_PREFIX: &str = "WEBHOOK_SECRET_";

#[derive(Deserialize, Clone, Debug)]
pub struct FieldOpsConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: Option<DatabaseConfig>,
    pub payment_terms_days: i64,
    pub notify_timeout_ms: u64,
    pub webhook_stale_after_secs: i64,
    /// Signing secrets keyed by lowercase webhook source.
    #[serde(skip)]
    pub webhook_secrets: HashMap<String, Secret<String>>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

impl FieldOpsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = CommonConfig::load()?;

        let database = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Some(DatabaseConfig {
                url,
                max_connections: var_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: var_or("DATABASE_MIN_CONNECTIONS", 1)?,
            }),
            _ => None,
        };
        if database.is_none() && common.is_production() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL must be set in production"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "fieldops-service".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
            database,
            payment_terms_days: var_or("PAYMENT_TERMS_DAYS", 30)?,
            notify_timeout_ms: var_or("NOTIFY_TIMEOUT_MS", 2000)?,
            webhook_stale_after_secs: var_or("WEBHOOK_STALE_AFTER_SECS", 300)?,
            webhook_secrets: webhook_secrets(env::vars()),
        })
    }

    /// Configuration for tests and local runs: in-memory store, no secrets.
    pub fn local(port: u16) -> Self {
        Self {
            common: CommonConfig {
                port,
                environment: "test".to_string(),
            },
            service_name: "fieldops-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: None,
            payment_terms_days: 30,
            notify_timeout_ms: 2000,
            webhook_stale_after_secs: 300,
            webhook_secrets: HashMap::new(),
        }
    }

    pub fn webhook_secret(&self, source: &str) -> Option<&Secret<String>> {
        self.webhook_secrets.get(&source.to_lowercase())
    }
}

fn webhook_secrets(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, Secret<String>> {
    vars.filter_map(|(key, value)| {
        let source = key.strip_prefix(WEBHOOK_SECRET_PREFIX)?;
        if source.is_empty() || value.is_empty() {
            return None;
        }
        Some((source.to_lowercase(), Secret::new(value)))
    })
    .collect()
}
