//! In-memory connector.
//!
//! Channels live in-process and record the statements they execute. Faults
//! (connect, statement, close failures) and latency can be injected at
//! runtime, which makes this backend the stand-in for a real instance in
//! tests and local development.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectorError;

use super::{Channel, Credentials, InstanceTarget, SecureConnector};

#[derive(Debug, Default)]
struct MemoryState {
    /// Set once `close` succeeds
    closed: AtomicBool,
    /// Channels ever opened
    opened: AtomicUsize,
    /// Channels currently alive (opened and not yet dropped)
    live: AtomicUsize,
    /// Number of `close` calls
    close_calls: AtomicUsize,
    fail_connect: AtomicBool,
    fail_statements: AtomicBool,
    fail_close: AtomicBool,
    connect_delay_ms: AtomicU64,
    statement_delay_ms: AtomicU64,
    statements: Mutex<Vec<String>>,
}

/// Connector whose channels never leave the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connects fail.
    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::Release);
    }

    /// Make subsequent statements (and pings) fail.
    pub fn fail_statements(&self, fail: bool) {
        self.state.fail_statements.store(fail, Ordering::Release);
    }

    /// Make `close` fail.
    pub fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::Release);
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Delay every statement by `delay`.
    pub fn set_statement_delay(&self, delay: Duration) {
        self.state
            .statement_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::Acquire)
    }

    pub fn opened_channels(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    pub fn live_channels(&self) -> usize {
        self.state.live.load(Ordering::Acquire)
    }

    /// Statements executed so far, across all channels, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .map(|statements| statements.clone())
            .unwrap_or_default()
    }
}

async fn delay(millis: u64) {
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl SecureConnector for MemoryConnector {
    type Channel = MemoryChannel;

    async fn connect(
        &self,
        target: &InstanceTarget,
        credentials: &Credentials,
        database: &str,
    ) -> Result<MemoryChannel, ConnectorError> {
        delay(self.state.connect_delay_ms.load(Ordering::Acquire)).await;

        if self.is_closed() {
            return Err(ConnectorError::Closed);
        }
        if self.state.fail_connect.load(Ordering::Acquire) {
            return Err(ConnectorError::Unavailable(format!(
                "cannot reach instance '{}'",
                target
            )));
        }

        let id = self.state.opened.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.live.fetch_add(1, Ordering::AcqRel);

        tracing::trace!(
            channel_id = id,
            instance = %target,
            user = %credentials.user(),
            database = %database,
            "Memory channel opened"
        );

        Ok(MemoryChannel {
            id,
            state: self.state.clone(),
        })
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.state.close_calls.fetch_add(1, Ordering::AcqRel);
        if self.state.fail_close.load(Ordering::Acquire) {
            return Err(ConnectorError::Unavailable(
                "connector refused to close".to_string(),
            ));
        }
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Channel opened by a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: usize,
    state: Arc<MemoryState>,
}

impl MemoryChannel {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn execute(&mut self, statement: &str) -> Result<u64, ConnectorError> {
        delay(self.state.statement_delay_ms.load(Ordering::Acquire)).await;

        if self.state.fail_statements.load(Ordering::Acquire) {
            return Err(ConnectorError::Unavailable(format!(
                "channel {} lost its connection",
                self.id
            )));
        }

        if let Ok(mut statements) = self.state.statements.lock() {
            statements.push(statement.to_string());
        }

        let rows = if statement.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            1
        } else {
            0
        };
        Ok(rows)
    }

    async fn ping(&mut self) -> Result<(), ConnectorError> {
        if self.state.fail_statements.load(Ordering::Acquire) {
            return Err(ConnectorError::Unavailable(format!(
                "channel {} did not answer ping",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> InstanceTarget {
        InstanceTarget::new("proj:region:inst")
    }

    #[tokio::test]
    async fn test_connect_and_execute() {
        let connector = MemoryConnector::new();
        let credentials = Credentials::new("app", "pw");

        let mut channel = connector.connect(&target(), &credentials, "db").await.unwrap();
        assert_eq!(channel.id(), 1);
        assert_eq!(connector.live_channels(), 1);

        assert_eq!(channel.execute("SELECT 1").await.unwrap(), 1);
        assert_eq!(channel.execute("BEGIN").await.unwrap(), 0);
        assert_eq!(connector.statements(), vec!["SELECT 1", "BEGIN"]);

        drop(channel);
        assert_eq!(connector.live_channels(), 0);
        assert_eq!(connector.opened_channels(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let connector = MemoryConnector::new();
        let credentials = Credentials::new("app", "pw");

        connector.fail_connects(true);
        let err = connector.connect(&target(), &credentials, "db").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable(_)));
        connector.fail_connects(false);

        let mut channel = connector.connect(&target(), &credentials, "db").await.unwrap();
        connector.fail_statements(true);
        assert!(channel.execute("SELECT 1").await.is_err());
        assert!(channel.ping().await.is_err());

        connector.fail_close(true);
        assert!(connector.close().await.is_err());
        assert!(!connector.is_closed());
        assert_eq!(connector.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let connector = MemoryConnector::new();
        connector.close().await.unwrap();

        let err = connector
            .connect(&target(), &Credentials::new("app", "pw"), "db")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Closed));
    }
}
