//! Pooled engine and sessions.
//!
//! The engine owns a bounded deadpool of channels opened through a
//! [`SecureConnector`](crate::connector::SecureConnector); sessions borrow
//! one channel at a time from it.

mod pool;
mod session;

pub use pool::{EngineStatus, PooledEngine};
pub use session::Session;
