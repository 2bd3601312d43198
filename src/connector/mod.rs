//! Secure connector capability.
//!
//! A connector authenticates against a managed instance and opens encrypted
//! channels to it. The pooled engine only ever sees the two operations of
//! [`SecureConnector`], so any backend can be plugged in:
//!
//! - `ProxyConnector`: sqlx-backed, connects through an auth proxy endpoint
//! - `MemoryConnector`: in-process channels with fault injection

mod memory;
mod proxy;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;

use crate::error::ConnectorError;

pub use memory::{MemoryChannel, MemoryConnector};
pub use proxy::{ProxyConnector, ProxyConnectorFactory};

/// Opaque instance connection name (`project:region:instance`).
///
/// Not validated here; a malformed name surfaces as a connector failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceTarget(String);

impl InstanceTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceTarget {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for InstanceTarget {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Database principal and its secret.
#[derive(Clone)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// A raw channel to the database, as handed out by a connector.
#[async_trait]
pub trait Channel: Send + 'static {
    /// Execute a statement, returning the number of rows affected.
    async fn execute(&mut self, statement: &str) -> Result<u64, ConnectorError>;

    /// Check that the channel is still usable.
    async fn ping(&mut self) -> Result<(), ConnectorError>;
}

/// Channel-establishment facility for a managed instance.
#[async_trait]
pub trait SecureConnector: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a new authenticated channel to `database` on `target`.
    async fn connect(
        &self,
        target: &InstanceTarget,
        credentials: &Credentials,
        database: &str,
    ) -> Result<Self::Channel, ConnectorError>;

    /// Release the connector's own resources. Channels opened afterwards fail.
    async fn close(&self) -> Result<(), ConnectorError>;
}

/// Creates connectors during `initialize`.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<C, ConnectorError>>`.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    type Connector: SecureConnector;

    async fn create(&self) -> Result<Self::Connector, ConnectorError>;
}

#[async_trait]
impl<F, Fut, C> ConnectorFactory for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<C, ConnectorError>> + Send,
    C: SecureConnector,
{
    type Connector = C;

    async fn create(&self) -> Result<C, ConnectorError> {
        (self)().await
    }
}
