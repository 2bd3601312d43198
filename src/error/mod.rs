//! Error types for the connector, the pooled engine and the lifecycle manager.

use std::fmt;
use std::time::Duration;

use deadpool::managed::{BuildError, PoolError};
use thiserror::Error;

use crate::manager::PoolState;

/// Errors raised by a secure connector or by one of its channels.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Connector is closed")]
    Closed,

    #[error("No endpoint configured for instance '{0}'")]
    UnknownInstance(String),

    #[error("Connector configuration error: {0}")]
    Configuration(String),

    #[error("Connection unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while a session borrows or uses a pooled channel.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to borrow connection: {0}")]
    Borrow(#[from] PoolError<ConnectorError>),

    #[error("Statement failed: {0}")]
    Statement(#[source] ConnectorError),

    #[error("Session is closed")]
    Closed,
}

/// Failures while bringing the manager to `Ready`.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to create connector: {0}")]
    Connector(#[source] ConnectorError),

    #[error("Failed to build pooled engine: {0}")]
    Engine(#[from] BuildError),

    #[error("Invalid pool configuration: {0}")]
    InvalidPoolConfig(String),
}

/// Failures while disposing of the pooled engine.
#[derive(Debug, Error)]
pub enum EngineDisposalError {
    #[error("{checked_out} connection(s) still checked out after {grace:?}")]
    ConnectionsCheckedOut { checked_out: usize, grace: Duration },
}

/// Aggregated teardown failure. Engine and connector are disposed
/// independently, so either or both may be set.
#[derive(Debug, Default)]
pub struct DisposalError {
    pub engine: Option<EngineDisposalError>,
    pub connector: Option<ConnectorError>,
}

impl DisposalError {
    pub fn is_empty(&self) -> bool {
        self.engine.is_none() && self.connector.is_none()
    }
}

impl fmt::Display for DisposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.engine, &self.connector) {
            (Some(engine), Some(connector)) => {
                write!(f, "engine: {}; connector: {}", engine, connector)
            }
            (Some(engine), None) => write!(f, "engine: {}", engine),
            (None, Some(connector)) => write!(f, "connector: {}", connector),
            (None, None) => write!(f, "no failures"),
        }
    }
}

impl std::error::Error for DisposalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match (&self.engine, &self.connector) {
            (Some(engine), _) => Some(engine),
            (None, Some(connector)) => Some(connector),
            (None, None) => None,
        }
    }
}

/// Errors surfaced by [`ConnectionPoolManager`](crate::manager::ConnectionPoolManager).
#[derive(Debug, Error)]
pub enum PoolManagerError {
    #[error("Connection pool manager is not initialized (state: {state})")]
    NotInitialized { state: PoolState },

    #[error("Connection pool manager is already initialized")]
    AlreadyInitialized,

    #[error("Connection pool manager has been disposed")]
    Disposed,

    #[error("Initialization failed: {0}")]
    Initialization(#[from] InitializationError),

    #[error("Connectivity check failed: {0}")]
    Connectivity(#[from] SessionError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Disposal failed: {0}")]
    Disposal(#[from] DisposalError),
}

pub type Result<T> = std::result::Result<T, PoolManagerError>;
