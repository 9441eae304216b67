/// Configuration management for the docflow server
///
/// Every value can be overridden through a `DOCFLOW_*` environment variable
/// so the same binary runs unchanged in containers.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding definitions and instances
    pub path: String,
}

/// Engine and background job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Six-field cron expression for the timeout sweeper
    pub sweep_schedule: String,
    /// How many times a write that lost a version race is recomputed
    pub max_conflict_retries: u32,
    /// Install the bundled templates when their names are not taken
    pub seed_defaults: bool,
    /// Where notification events are POSTed; log-only when unset
    pub notify_webhook_url: Option<String>,
    /// JSON role/department membership table for assignee resolution
    pub directory_file: Option<String>,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("DOCFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("DOCFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                path: std::env::var("DOCFLOW_DATABASE_PATH")
                    .unwrap_or_else(|_| "data/docflow.db".to_string()),
            },
            engine: EngineConfig {
                sweep_schedule: std::env::var("DOCFLOW_SWEEP_SCHEDULE")
                    .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
                max_conflict_retries: env_parse("DOCFLOW_MAX_CONFLICT_RETRIES", 3),
                seed_defaults: env_parse("DOCFLOW_SEED_DEFAULTS", true),
                notify_webhook_url: env_opt("DOCFLOW_NOTIFY_WEBHOOK_URL"),
                directory_file: env_opt("DOCFLOW_DIRECTORY_FILE"),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
