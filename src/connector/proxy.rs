//! sqlx-backed connector that reaches managed instances through an auth
//! proxy endpoint.
//!
//! Each instance connection name resolves to a `host:port` endpoint. When the
//! endpoint table is empty every instance resolves to the default host and
//! port; once the table is populated, unknown instances are rejected.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

use super::{Channel, ConnectorFactory, Credentials, InstanceTarget, SecureConnector};

const APPLICATION_NAME: &str = "cloudsql-pool";

/// Connector opening `PgConnection`s to proxy endpoints.
pub struct ProxyConnector {
    config: ConnectorConfig,
    ssl_mode: PgSslMode,
    closed: AtomicBool,
}

impl ProxyConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        let ssl_mode = config.ssl_mode.parse::<PgSslMode>().map_err(|e| {
            ConnectorError::Configuration(format!("invalid ssl_mode '{}': {}", config.ssl_mode, e))
        })?;

        Ok(Self {
            config,
            ssl_mode,
            closed: AtomicBool::new(false),
        })
    }

    /// Resolve the endpoint serving `target`.
    pub fn resolve(&self, target: &InstanceTarget) -> Result<(String, u16), ConnectorError> {
        if self.config.endpoints.is_empty() {
            return Ok((self.config.host.clone(), self.config.port));
        }

        let endpoint = self
            .config
            .endpoints
            .get(target.as_str())
            .ok_or_else(|| ConnectorError::UnknownInstance(target.to_string()))?;

        let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
            ConnectorError::Configuration(format!("endpoint '{}' is not host:port", endpoint))
        })?;
        let port = port.parse::<u16>().map_err(|e| {
            ConnectorError::Configuration(format!("endpoint '{}' has invalid port: {}", endpoint, e))
        })?;

        Ok((host.to_string(), port))
    }

    /// Build the sqlx options used to open a channel to `target`.
    pub fn connect_options(
        &self,
        target: &InstanceTarget,
        credentials: &Credentials,
        database: &str,
    ) -> Result<PgConnectOptions, ConnectorError> {
        let (host, port) = self.resolve(target)?;

        let mut options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(credentials.user())
            .password(credentials.password())
            .database(database)
            .ssl_mode(self.ssl_mode)
            .application_name(APPLICATION_NAME);

        if let Some(ref root_cert) = self.config.ssl_root_cert {
            options = options.ssl_root_cert(root_cert);
        }

        Ok(options)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SecureConnector for ProxyConnector {
    type Channel = PgConnection;

    async fn connect(
        &self,
        target: &InstanceTarget,
        credentials: &Credentials,
        database: &str,
    ) -> Result<PgConnection, ConnectorError> {
        if self.is_closed() {
            return Err(ConnectorError::Closed);
        }

        let options = self.connect_options(target, credentials, database)?;
        let connection = PgConnection::connect_with(&options).await?;

        tracing::debug!(
            instance = %target,
            database = %database,
            "Opened PostgreSQL channel"
        );

        Ok(connection)
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.closed.store(true, Ordering::Release);
        tracing::debug!("Proxy connector closed");
        Ok(())
    }
}

#[async_trait]
impl Channel for PgConnection {
    async fn execute(&mut self, statement: &str) -> Result<u64, ConnectorError> {
        let result = sqlx::query(statement).execute(&mut *self).await?;
        Ok(result.rows_affected())
    }

    async fn ping(&mut self) -> Result<(), ConnectorError> {
        Connection::ping(self).await?;
        Ok(())
    }
}

/// Creates a [`ProxyConnector`] from configuration on `initialize`.
#[derive(Debug, Clone)]
pub struct ProxyConnectorFactory {
    config: ConnectorConfig,
}

impl ProxyConnectorFactory {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectorFactory for ProxyConnectorFactory {
    type Connector = ProxyConnector;

    async fn create(&self) -> Result<ProxyConnector, ConnectorError> {
        let connector = ProxyConnector::new(self.config.clone())?;
        tracing::debug!(
            host = %self.config.host,
            port = self.config.port,
            endpoints = self.config.endpoints.len(),
            "Proxy connector created"
        );
        Ok(connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_endpoints(endpoints: &[(&str, &str)]) -> ConnectorConfig {
        ConnectorConfig {
            endpoints: endpoints
                .iter()
                .map(|(name, endpoint)| (name.to_string(), endpoint.to_string()))
                .collect(),
            ..ConnectorConfig::default()
        }
    }

    #[test]
    fn test_resolve_default_endpoint() {
        let connector = ProxyConnector::new(ConnectorConfig::default()).unwrap();
        let (host, port) = connector
            .resolve(&InstanceTarget::new("proj:region:inst"))
            .unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 5432);
    }

    #[test]
    fn test_resolve_endpoint_table() {
        let connector = ProxyConnector::new(config_with_endpoints(&[
            ("proj:us-central1:orders", "10.0.0.4:5433"),
            ("proj:us-central1:broken", "10.0.0.5"),
        ]))
        .unwrap();

        let (host, port) = connector
            .resolve(&InstanceTarget::new("proj:us-central1:orders"))
            .unwrap();
        assert_eq!(host, "10.0.0.4");
        assert_eq!(port, 5433);

        let err = connector
            .resolve(&InstanceTarget::new("proj:us-central1:missing"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnknownInstance(_)));

        let err = connector
            .resolve(&InstanceTarget::new("proj:us-central1:broken"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let config = ConnectorConfig {
            ssl_mode: "sometimes".to_string(),
            ..ConnectorConfig::default()
        };
        assert!(matches!(
            ProxyConnector::new(config),
            Err(ConnectorError::Configuration(_))
        ));
    }

    #[test]
    fn test_connect_options() {
        let connector = ProxyConnector::new(ConnectorConfig {
            ssl_mode: "require".to_string(),
            ..config_with_endpoints(&[("proj:eu-west1:main", "db.internal:6432")])
        })
        .unwrap();

        let options = connector
            .connect_options(
                &InstanceTarget::new("proj:eu-west1:main"),
                &Credentials::new("app", "pw"),
                "orders",
            )
            .unwrap();

        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("orders"));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Require));
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let connector = ProxyConnectorFactory::new(ConnectorConfig::default())
            .create()
            .await
            .unwrap();
        connector.close().await.unwrap();
        assert!(connector.is_closed());

        let err = connector
            .connect(
                &InstanceTarget::new("proj:region:inst"),
                &Credentials::new("app", "pw"),
                "db",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Closed));
    }

    #[tokio::test]
    #[ignore] // Requires a reachable PostgreSQL endpoint
    async fn test_connect_and_ping() {
        let connector = ProxyConnector::new(ConnectorConfig::default()).unwrap();
        let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_else(|_| "postgres".to_string());

        let mut channel = connector
            .connect(
                &InstanceTarget::new("local"),
                &Credentials::new(user, password),
                "postgres",
            )
            .await
            .unwrap();
        Channel::ping(&mut channel).await.unwrap();
        assert_eq!(Channel::execute(&mut channel, "SELECT 1").await.unwrap(), 1);
    }
}
