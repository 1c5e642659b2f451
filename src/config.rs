//! Runtime configuration read from the process environment (and `.env`).

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set in environment")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    /// Push delivery is disabled when unset.
    pub fcm: Option<FcmConfig>,
    pub security: SecurityConfig,
    pub limits: LimitsConfig,
    pub environment: Environment,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub service_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct FcmConfig {
    pub project_id: String,
    /// Inline service-account JSON or a path to it.
    pub credentials: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub admin_secret_key: Option<String>,
    pub account_type_signing_secret: Option<String>,
    pub allowed_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub external_call_timeout: Duration,
    pub max_document_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            external_call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let fcm = match (get("FCM_PROJECT_ID"), get("FCM_CREDENTIALS")) {
            (Some(project_id), Some(credentials)) => Some(FcmConfig {
                project_id,
                credentials,
                max_retries: parse_or(get("FCM_MAX_RETRIES"), "FCM_MAX_RETRIES", 2)?,
            }),
            _ => None,
        };

        let environment = match get("APP_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            _ => Environment::Development,
        };

        Ok(Self {
            server: ServerConfig {
                host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_or(get("PORT"), "PORT", 8082)?,
            },
            database: DatabaseConfig {
                url: require("DATABASE_URL")?,
                max_connections: parse_or(
                    get("DATABASE_MAX_CONNECTIONS"),
                    "DATABASE_MAX_CONNECTIONS",
                    10,
                )?,
            },
            storage: StorageConfig {
                url: require("STORAGE_URL")?,
                service_key: require("STORAGE_SERVICE_KEY")?,
            },
            fcm,
            security: SecurityConfig {
                admin_secret_key: get("ADMIN_SECRET_KEY"),
                account_type_signing_secret: get("ACCOUNT_TYPE_SIGNING_SECRET"),
                allowed_origins: get("ALLOWED_ORIGINS")
                    .map(|origins| {
                        origins
                            .split(',')
                            .map(|origin| origin.trim().to_string())
                            .filter(|origin| !origin.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                rate_limit_per_minute: parse_or(
                    get("RATE_LIMIT_PER_MINUTE"),
                    "RATE_LIMIT_PER_MINUTE",
                    60,
                )?,
            },
            limits: LimitsConfig {
                external_call_timeout: Duration::from_millis(parse_or(
                    get("EXTERNAL_CALL_TIMEOUT_MS"),
                    "EXTERNAL_CALL_TIMEOUT_MS",
                    DEFAULT_CALL_TIMEOUT_MS,
                )?),
                max_document_bytes: parse_or(
                    get("MAX_DOCUMENT_BYTES"),
                    "MAX_DOCUMENT_BYTES",
                    DEFAULT_MAX_DOCUMENT_BYTES,
                )?,
            },
            environment,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
