//! Pooled engine: a bounded deadpool of connector channels.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{
    BuildError, Manager, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult,
};
use deadpool::Runtime;

use crate::config::PoolConfig;
use crate::connector::{Channel, Credentials, InstanceTarget, SecureConnector};
use crate::error::{ConnectorError, EngineDisposalError};

use super::Session;

const ROLLBACK: &str = "ROLLBACK";

/// How often `dispose` re-checks for outstanding checkouts.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A connector channel as held by the pool.
///
/// Tracks whether a session left a transaction open so the channel can be
/// rolled back before anyone else borrows it.
pub struct PooledChannel<T> {
    inner: T,
    in_transaction: bool,
}

impl<T: Channel> PooledChannel<T> {
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub(crate) async fn execute(&mut self, statement: &str) -> Result<u64, ConnectorError> {
        self.inner.execute(statement).await
    }
}

/// deadpool manager opening channels through a shared connector.
pub struct ChannelManager<C: SecureConnector> {
    connector: Arc<C>,
    target: InstanceTarget,
    credentials: Credentials,
    database: String,
}

impl<C: SecureConnector> Manager for ChannelManager<C> {
    type Type = PooledChannel<C::Channel>;
    type Error = ConnectorError;

    async fn create(&self) -> Result<Self::Type, ConnectorError> {
        let inner = self
            .connector
            .connect(&self.target, &self.credentials, &self.database)
            .await?;

        Ok(PooledChannel {
            inner,
            in_transaction: false,
        })
    }

    async fn recycle(&self, channel: &mut Self::Type, _: &Metrics) -> RecycleResult<ConnectorError> {
        if channel.in_transaction {
            channel
                .inner
                .execute(ROLLBACK)
                .await
                .map_err(RecycleError::Backend)?;
            channel.in_transaction = false;
        }

        channel.inner.ping().await.map_err(RecycleError::Backend)
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// Channels kept while idle
    pub pool_size: usize,
    /// Extra channels allowed under load
    pub max_overflow: usize,
    /// Channels currently open (idle + checked out)
    pub open: usize,
    /// Open channels waiting in the pool
    pub idle: usize,
    /// Channels held by sessions
    pub checked_out: usize,
    /// Borrowers suspended waiting for a channel
    pub waiting: usize,
}

/// Bounded pool of channels opened lazily through a connector.
///
/// At most `pool_size + max_overflow` channels are open at once; borrowers
/// beyond that suspend until a channel is released (or the acquire timeout,
/// if configured, expires). Idle channels beyond `pool_size` are discarded
/// on release.
pub struct PooledEngine<C: SecureConnector> {
    pool: Pool<ChannelManager<C>>,
    pool_size: usize,
    max_overflow: usize,
    checked_out: Arc<AtomicUsize>,
}

impl<C: SecureConnector> PooledEngine<C> {
    /// Build the engine. No channel is opened until the first borrow.
    pub fn create(
        connector: Arc<C>,
        target: InstanceTarget,
        credentials: Credentials,
        database: impl Into<String>,
        config: &PoolConfig,
    ) -> Result<Self, BuildError> {
        let manager = ChannelManager {
            connector,
            target,
            credentials,
            database: database.into(),
        };

        let pool = Pool::builder(manager)
            .max_size(config.max_size())
            .wait_timeout(config.acquire_timeout())
            .runtime(Runtime::Tokio1)
            .build()?;

        Ok(Self {
            pool,
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            checked_out: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create a session bound to this engine.
    pub fn session(&self) -> Session<C> {
        Session::new(self.clone())
    }

    pub fn status(&self) -> EngineStatus {
        let status = self.pool.status();
        EngineStatus {
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            open: status.size,
            idle: status.available,
            checked_out: self.checked_out.load(Ordering::Acquire),
            waiting: status.waiting,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Borrow a channel, suspending while the pool is exhausted.
    pub(crate) async fn checkout(&self) -> Result<Checkout<C>, PoolError<ConnectorError>> {
        let object = self.pool.get().await?;
        self.checked_out.fetch_add(1, Ordering::AcqRel);

        Ok(Checkout {
            object: Some(object),
            engine: self.clone(),
        })
    }

    /// Discard idle channels beyond `pool_size`.
    fn trim_overflow(&self) {
        let idle = self.pool.status().available;
        if idle <= self.pool_size {
            return;
        }

        let excess = AtomicUsize::new(idle - self.pool_size);
        let _ = self.pool.retain(|_, _| {
            excess
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_err()
        });

        tracing::trace!(
            discarded = idle - self.pool_size,
            "Discarded idle overflow channels"
        );
    }

    /// Close the pool and wait up to `grace` for checked-out channels to be
    /// released. Idle channels are dropped immediately; pending borrows fail.
    pub async fn dispose(&self, grace: Duration) -> Result<(), EngineDisposalError> {
        self.pool.close();

        let drained = tokio::time::timeout(grace, async {
            while self.checked_out.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                tracing::debug!("Pooled engine disposed");
                Ok(())
            }
            Err(_) => {
                let checked_out = self.checked_out.load(Ordering::Acquire);
                tracing::warn!(
                    checked_out,
                    grace_ms = grace.as_millis() as u64,
                    "Channels still checked out after dispose grace period"
                );
                Err(EngineDisposalError::ConnectionsCheckedOut { checked_out, grace })
            }
        }
    }
}

impl<C: SecureConnector> Clone for PooledEngine<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            checked_out: self.checked_out.clone(),
        }
    }
}

/// A channel borrowed from the engine. Returned to the pool on drop.
pub(crate) struct Checkout<C: SecureConnector> {
    object: Option<Object<ChannelManager<C>>>,
    engine: PooledEngine<C>,
}

impl<C: SecureConnector> Deref for Checkout<C> {
    type Target = PooledChannel<C::Channel>;

    fn deref(&self) -> &Self::Target {
        // `object` is only taken in `drop`
        self.object.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<C: SecureConnector> DerefMut for Checkout<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C: SecureConnector> Drop for Checkout<C> {
    fn drop(&mut self) {
        // Return the channel before trimming so it counts as idle
        drop(self.object.take());
        self.engine.checked_out.fetch_sub(1, Ordering::AcqRel);
        self.engine.trim_overflow();
    }
}
