//! Unit-of-work handle over one borrowed channel.

use crate::connector::SecureConnector;
use crate::error::SessionError;

use super::pool::{Checkout, PooledEngine};

const BEGIN: &str = "BEGIN";
const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

/// A single-owner session bound to a [`PooledEngine`].
///
/// The channel is borrowed on the first statement, and the first statement
/// of each unit of work opens a transaction. `commit` and `rollback` end the
/// transaction and hand the channel back to the pool; the next statement
/// borrows again. `close` ends the session for good.
///
/// Dropping a session always returns its channel to the pool. A transaction
/// left open by a dropped session is rolled back before the channel is
/// reused.
pub struct Session<C: SecureConnector> {
    engine: PooledEngine<C>,
    checkout: Option<Checkout<C>>,
    closed: bool,
}

impl<C: SecureConnector> Session<C> {
    pub(crate) fn new(engine: PooledEngine<C>) -> Self {
        Self {
            engine,
            checkout: None,
            closed: false,
        }
    }

    /// Whether the session currently holds a channel.
    pub fn is_borrowed(&self) -> bool {
        self.checkout.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.checkout
            .as_ref()
            .map(|checkout| checkout.in_transaction())
            .unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&mut self, statement: &str) -> Result<u64, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        if self.checkout.is_none() {
            self.checkout = Some(self.engine.checkout().await?);
        }
        let Some(checkout) = self.checkout.as_mut() else {
            return Err(SessionError::Closed);
        };

        if !checkout.in_transaction() {
            // Flag first: a BEGIN cut short may still have reached the server
            checkout.set_in_transaction(true);
            checkout
                .execute(BEGIN)
                .await
                .map_err(SessionError::Statement)?;
        }

        checkout
            .execute(statement)
            .await
            .map_err(SessionError::Statement)
    }

    /// Commit the current transaction and release the channel.
    pub async fn commit(&mut self) -> Result<(), SessionError> {
        self.finish(COMMIT).await
    }

    /// Roll back the current transaction and release the channel.
    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        self.finish(ROLLBACK).await
    }

    /// Roll back anything pending, release the channel and close the session.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.end_transaction(ROLLBACK).await
    }

    async fn finish(&mut self, statement: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.end_transaction(statement).await
    }

    async fn end_transaction(&mut self, statement: &str) -> Result<(), SessionError> {
        // Dropping the checkout on every path hands the channel back
        let Some(mut checkout) = self.checkout.take() else {
            return Ok(());
        };

        if !checkout.in_transaction() {
            return Ok(());
        }

        checkout
            .execute(statement)
            .await
            .map_err(SessionError::Statement)?;
        checkout.set_in_transaction(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PoolConfig;
    use crate::connector::{Credentials, InstanceTarget, MemoryConnector};

    fn engine(connector: &MemoryConnector) -> PooledEngine<MemoryConnector> {
        PooledEngine::create(
            Arc::new(connector.clone()),
            InstanceTarget::new("proj:region:inst"),
            Credentials::new("app", "pw"),
            "db",
            &PoolConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_borrow_is_lazy() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);

        let mut session = engine.session();
        assert!(!session.is_borrowed());
        assert_eq!(connector.opened_channels(), 0);

        session.execute("SELECT 1").await.unwrap();
        assert!(session.is_borrowed());
        assert!(session.in_transaction());
        assert_eq!(connector.opened_channels(), 1);
    }

    #[tokio::test]
    async fn test_commit_releases_channel() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);

        let mut session = engine.session();
        session.execute("INSERT INTO t VALUES (1)").await.unwrap();
        session.commit().await.unwrap();

        assert!(!session.is_borrowed());
        assert_eq!(engine.status().checked_out, 0);

        session.execute("SELECT 1").await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(
            connector.statements(),
            vec![
                "BEGIN",
                "INSERT INTO t VALUES (1)",
                "COMMIT",
                "BEGIN",
                "SELECT 1",
                "ROLLBACK"
            ]
        );
        assert_eq!(connector.opened_channels(), 1);
    }

    #[tokio::test]
    async fn test_close_rolls_back_and_rejects_further_use() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);

        let mut session = engine.session();
        session.execute("SELECT 1").await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.is_closed());
        assert_eq!(engine.status().checked_out, 0);
        assert_eq!(connector.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert!(matches!(
            session.execute("SELECT 1").await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(session.commit().await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_statement_failure_keeps_channel_until_released() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);

        let mut session = engine.session();
        session.execute("SELECT 1").await.unwrap();

        connector.fail_statements(true);
        assert!(matches!(
            session.execute("SELECT 1").await,
            Err(SessionError::Statement(_))
        ));
        assert_eq!(engine.status().checked_out, 1);

        // Rollback fails too, but the channel still goes back
        assert!(session.rollback().await.is_err());
        assert_eq!(engine.status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_drop_returns_channel() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);

        {
            let mut session = engine.session();
            session.execute("SELECT 1").await.unwrap();
            assert_eq!(engine.status().checked_out, 1);
        }

        assert_eq!(engine.status().checked_out, 0);
        assert_eq!(engine.status().idle, 1);
    }

    #[tokio::test]
    async fn test_interrupted_begin_is_rolled_back_before_reuse() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);

        connector.set_statement_delay(std::time::Duration::from_millis(200));
        {
            let mut session = engine.session();
            let cut_short = tokio::time::timeout(
                std::time::Duration::from_millis(20),
                session.execute("SELECT 1"),
            )
            .await;
            assert!(cut_short.is_err());
            assert!(session.in_transaction());
        }
        connector.set_statement_delay(std::time::Duration::ZERO);

        let mut session = engine.session();
        session.execute("SELECT 1").await.unwrap();

        assert_eq!(connector.statements(), vec!["ROLLBACK", "BEGIN", "SELECT 1"]);
        assert_eq!(connector.opened_channels(), 1);
    }

    #[tokio::test]
    async fn test_borrow_fails_after_dispose() {
        let connector = MemoryConnector::new();
        let engine = engine(&connector);
        engine.dispose(std::time::Duration::from_millis(10)).await.unwrap();

        let mut session = engine.session();
        assert!(matches!(
            session.execute("SELECT 1").await,
            Err(SessionError::Borrow(_))
        ));
    }
}
