use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target instance and login used by `initialize`.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Instance connection name, `project:region:instance`
    pub instance_connection_name: String,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("instance_connection_name", &self.instance_connection_name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Channels kept open while idle
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Extra channels allowed under load, discarded on release
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,
    /// How long a borrow may wait for a free channel (unbounded when unset)
    #[serde(default)]
    pub acquire_timeout_seconds: Option<u64>,
    /// Deadline for creating the connector during initialize
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Deadline for the `SELECT 1` probe
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_seconds: u64,
    /// How long dispose waits for checked-out channels to come back
    #[serde(default = "default_dispose_grace")]
    pub dispose_grace_seconds: u64,
}

fn default_pool_size() -> usize {
    5
}

fn default_max_overflow() -> usize {
    2
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    10
}

fn default_dispose_grace() -> u64 {
    5
}

impl PoolConfig {
    pub fn max_size(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_seconds.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_secs(self.dispose_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Default endpoint host (an auth proxy listening locally)
    #[serde(default = "default_connector_host")]
    pub host: String,
    #[serde(default = "default_connector_port")]
    pub port: u16,
    /// libpq-style sslmode: disable, allow, prefer, require, verify-ca, verify-full
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default)]
    pub ssl_root_cert: Option<String>,
    /// Per-instance endpoints (`instance connection name` -> `host:port`)
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

fn default_connector_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connector_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("pool.pool_size", 5)?
            .set_default("pool.max_overflow", 2)?
            .set_default("connector.host", "127.0.0.1")?
            .set_default("connector.port", 5432)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // CLOUDSQL_DATABASE__USER, CLOUDSQL_POOL__POOL_SIZE, ...
            .add_source(
                Environment::with_prefix("CLOUDSQL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            acquire_timeout_seconds: None,
            connect_timeout_seconds: default_connect_timeout(),
            health_check_timeout_seconds: default_health_check_timeout(),
            dispose_grace_seconds: default_dispose_grace(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            host: default_connector_host(),
            port: default_connector_port(),
            ssl_mode: default_ssl_mode(),
            ssl_root_cert: None,
            endpoints: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let pool = PoolConfig::default();
        assert_eq!(pool.pool_size, 5);
        assert_eq!(pool.max_overflow, 2);
        assert_eq!(pool.max_size(), 7);
        assert!(pool.acquire_timeout().is_none());
        assert_eq!(pool.health_check_timeout(), Duration::from_secs(10));

        let connector = ConnectorConfig::default();
        assert_eq!(connector.host, "127.0.0.1");
        assert_eq!(connector.port, 5432);
        assert_eq!(connector.ssl_mode, "prefer");
    }

    #[test]
    fn test_database_config_debug_masks_password() {
        let config = DatabaseConfig {
            instance_connection_name: "proj:region:inst".to_string(),
            user: "app".to_string(),
            password: "secret123".to_string(),
            name: "orders".to_string(),
        };
        let debug = format!("{:?}", config);
        assert!(debug.contains("proj:region:inst"));
        assert!(!debug.contains("secret123"));
    }

    #[test]
    fn test_settings_from_env() {
        temp_env::with_vars(
            [
                ("CLOUDSQL_DATABASE__INSTANCE_CONNECTION_NAME", Some("proj:us-central1:main")),
                ("CLOUDSQL_DATABASE__USER", Some("app")),
                ("CLOUDSQL_DATABASE__PASSWORD", Some("pw")),
                ("CLOUDSQL_DATABASE__NAME", Some("orders")),
                ("CLOUDSQL_POOL__POOL_SIZE", Some("3")),
                ("CLOUDSQL_CONNECTOR__PORT", Some("6543")),
            ],
            || {
                let settings = Settings::new().unwrap();
                assert_eq!(settings.database.instance_connection_name, "proj:us-central1:main");
                assert_eq!(settings.database.name, "orders");
                assert_eq!(settings.pool.pool_size, 3);
                assert_eq!(settings.pool.max_overflow, 2);
                assert_eq!(settings.connector.port, 6543);
                assert_eq!(settings.logging.format, LogFormat::Pretty);
            },
        );
    }

    #[test]
    fn test_settings_missing_database_fails() {
        temp_env::with_vars_unset(
            [
                "CLOUDSQL_DATABASE__INSTANCE_CONNECTION_NAME",
                "CLOUDSQL_DATABASE__USER",
                "CLOUDSQL_DATABASE__PASSWORD",
                "CLOUDSQL_DATABASE__NAME",
            ],
            || {
                assert!(Settings::new().is_err());
            },
        );
    }
}
