//! Async connection pool lifecycle manager for managed PostgreSQL instances.
//!
//! ```ignore
//! use cloudsql_pool::config::Settings;
//! use cloudsql_pool::ConnectionPoolManager;
//!
//! let settings = Settings::new()?;
//! let mut manager = ConnectionPoolManager::from_settings(&settings);
//! manager.initialize_from(&settings.database).await?;
//! manager.health_check().await?;
//!
//! let mut session = manager.acquire_session()?;
//! session.execute("UPDATE jobs SET state = 'done' WHERE id = 7").await?;
//! session.commit().await?;
//!
//! manager.dispose().await?;
//! ```

pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod manager;
pub mod telemetry;

pub use connector::{Credentials, InstanceTarget};
pub use engine::{EngineStatus, PooledEngine, Session};
pub use error::{PoolManagerError, Result};
pub use manager::{ConnectionPoolManager, PoolState};
