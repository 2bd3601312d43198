//! Connection-pool lifecycle manager.
//!
//! `ConnectionPoolManager` owns one connector and the pooled engine built on
//! it, and walks them through `Uninitialized → Ready → Disposed`. A disposed
//! manager never comes back; construct a new one instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DatabaseConfig, PoolConfig, Settings};
use crate::connector::{
    ConnectorFactory, Credentials, InstanceTarget, ProxyConnectorFactory, SecureConnector,
};
use crate::engine::{EngineStatus, PooledEngine, Session};
use crate::error::{DisposalError, InitializationError, PoolManagerError, Result};

const HEALTH_CHECK_QUERY: &str = "SELECT 1";

/// Lifecycle state of a [`ConnectionPoolManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Ready,
    Disposed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Ready => "ready",
            PoolState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

enum Lifecycle<C: SecureConnector> {
    Uninitialized,
    Ready {
        connector: Arc<C>,
        engine: PooledEngine<C>,
        target: InstanceTarget,
    },
    Disposed,
}

/// Owns the lifecycle of a pooled, authenticated connection to one managed
/// database instance.
///
/// Construct it explicitly and pass it to whatever needs database access.
/// `initialize` and `dispose` take `&mut self`, so they cannot race each
/// other or in-flight health checks; sessions and health checks only need
/// `&self` and may run concurrently.
pub struct ConnectionPoolManager<F: ConnectorFactory> {
    factory: F,
    config: PoolConfig,
    lifecycle: Lifecycle<F::Connector>,
}

impl ConnectionPoolManager<ProxyConnectorFactory> {
    /// Manager using the proxy connector and pool settings from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_config(
            ProxyConnectorFactory::new(settings.connector.clone()),
            settings.pool.clone(),
        )
    }
}

impl<F: ConnectorFactory> ConnectionPoolManager<F> {
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, PoolConfig::default())
    }

    pub fn with_config(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    pub fn state(&self) -> PoolState {
        match self.lifecycle {
            Lifecycle::Uninitialized => PoolState::Uninitialized,
            Lifecycle::Ready { .. } => PoolState::Ready,
            Lifecycle::Disposed => PoolState::Disposed,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The live engine, while `Ready`.
    pub fn engine(&self) -> Option<&PooledEngine<F::Connector>> {
        match &self.lifecycle {
            Lifecycle::Ready { engine, .. } => Some(engine),
            _ => None,
        }
    }

    /// The instance this manager is bound to, while `Ready`.
    pub fn target(&self) -> Option<&InstanceTarget> {
        match &self.lifecycle {
            Lifecycle::Ready { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn status(&self) -> Result<EngineStatus> {
        self.ready_engine().map(PooledEngine::status)
    }

    /// Create the connector and build the pooled engine on it.
    ///
    /// No physical connection is opened here. Fails with `AlreadyInitialized`
    /// when `Ready` (the existing pair is left untouched) and with `Disposed`
    /// after `dispose`.
    #[tracing::instrument(
        name = "pool_initialize",
        skip_all,
        fields(instance = %target, database = %database)
    )]
    pub async fn initialize(
        &mut self,
        target: InstanceTarget,
        credentials: Credentials,
        database: &str,
    ) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Ready { .. } => {
                tracing::error!("Connection pool manager initialized twice");
                return Err(PoolManagerError::AlreadyInitialized);
            }
            Lifecycle::Disposed => {
                tracing::error!("Connection pool manager initialized after dispose");
                return Err(PoolManagerError::Disposed);
            }
        }

        if self.config.max_size() == 0 {
            let reason = "pool_size + max_overflow must be at least 1".to_string();
            tracing::error!(reason = %reason, "Refusing to build a pool with no capacity");
            return Err(InitializationError::InvalidPoolConfig(reason).into());
        }

        let connect_timeout = self.config.connect_timeout();
        let connector = match tokio::time::timeout(connect_timeout, self.factory.create()).await {
            Ok(Ok(connector)) => Arc::new(connector),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to create connector");
                return Err(InitializationError::Connector(e).into());
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "Timed out creating connector"
                );
                return Err(PoolManagerError::Timeout {
                    operation: "initialize",
                    timeout: connect_timeout,
                });
            }
        };

        let engine = match PooledEngine::create(
            connector.clone(),
            target.clone(),
            credentials,
            database,
            &self.config,
        ) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build pooled engine");
                if let Err(close_err) = connector.close().await {
                    tracing::warn!(error = %close_err, "Failed to close connector after engine build failure");
                }
                return Err(InitializationError::Engine(e).into());
            }
        };

        tracing::info!(
            pool_size = self.config.pool_size,
            max_overflow = self.config.max_overflow,
            "Cloud SQL async engine initialized"
        );

        self.lifecycle = Lifecycle::Ready {
            connector,
            engine,
            target,
        };
        Ok(())
    }

    /// Convenience wrapper around [`initialize`](Self::initialize) taking the
    /// `database` section of the settings.
    pub async fn initialize_from(&mut self, database: &DatabaseConfig) -> Result<()> {
        self.initialize(
            InstanceTarget::new(database.instance_connection_name.as_str()),
            Credentials::new(database.user.as_str(), database.password.as_str()),
            &database.name,
        )
        .await
    }

    /// Hand out a new session. No channel is borrowed until its first
    /// statement.
    pub fn acquire_session(&self) -> Result<Session<F::Connector>> {
        self.ready_engine().map(PooledEngine::session)
    }

    /// Probe the pool with `SELECT 1` under the configured deadline.
    pub async fn health_check(&self) -> Result<()> {
        self.health_check_within(self.config.health_check_timeout())
            .await
    }

    /// Probe the pool with `SELECT 1`, giving up after `deadline`.
    ///
    /// The probe session is released on every exit path. Failures are logged
    /// and returned as-is; the state stays `Ready` so the caller may retry.
    #[tracing::instrument(name = "pool_health_check", skip(self))]
    pub async fn health_check_within(&self, deadline: Duration) -> Result<()> {
        let mut session = self.acquire_session()?;

        let probe = tokio::time::timeout(deadline, async {
            session.execute(HEALTH_CHECK_QUERY).await?;
            session.close().await
        })
        .await;
        drop(session);

        match probe {
            Ok(Ok(())) => {
                tracing::info!("Cloud SQL connection OK");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Cloud SQL connection test failed");
                Err(PoolManagerError::Connectivity(e))
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = deadline.as_millis() as u64,
                    "Cloud SQL connection test timed out"
                );
                Err(PoolManagerError::Timeout {
                    operation: "health_check",
                    timeout: deadline,
                })
            }
        }
    }

    /// Dispose of the engine, then close the connector.
    ///
    /// Both steps are always attempted; their failures are aggregated into
    /// one `Disposal` error and the manager ends up `Disposed` either way.
    /// A no-op when nothing was initialized or when already disposed.
    #[tracing::instrument(name = "pool_dispose", skip(self))]
    pub async fn dispose(&mut self) -> Result<()> {
        let (connector, engine) =
            match std::mem::replace(&mut self.lifecycle, Lifecycle::Disposed) {
                Lifecycle::Ready {
                    connector, engine, ..
                } => (connector, engine),
                other => {
                    self.lifecycle = other;
                    tracing::debug!(
                        state = %self.state(),
                        "Nothing to dispose; connector and engine already released"
                    );
                    return Ok(());
                }
            };

        let mut failure = DisposalError::default();

        // The engine logs its own disposal failure
        if let Err(e) = engine.dispose(self.config.dispose_grace()).await {
            failure.engine = Some(e);
        }
        drop(engine);

        if let Err(e) = connector.close().await {
            tracing::error!(error = %e, "Failed to close connector");
            failure.connector = Some(e);
        }

        tracing::info!("Cloud SQL connector and engine disposed");

        if failure.is_empty() {
            Ok(())
        } else {
            Err(failure.into())
        }
    }

    fn ready_engine(&self) -> Result<&PooledEngine<F::Connector>> {
        match &self.lifecycle {
            Lifecycle::Ready { engine, .. } => Ok(engine),
            _ => {
                let state = self.state();
                tracing::error!(state = %state, "Connection pool manager is not ready");
                Err(PoolManagerError::NotInitialized { state })
            }
        }
    }
}

impl<F: ConnectorFactory> Drop for ConnectionPoolManager<F> {
    fn drop(&mut self) {
        if let Lifecycle::Ready { ref target, .. } = self.lifecycle {
            tracing::warn!(
                instance = %target,
                "Connection pool manager dropped without dispose; connector left open"
            );
        }
    }
}
