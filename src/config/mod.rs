mod settings;

pub use settings::{
    ConnectorConfig, DatabaseConfig, LogFormat, LoggingConfig, PoolConfig, Settings,
};
