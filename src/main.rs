use anyhow::Result;
use tokio::signal;

use cloudsql_pool::config::Settings;
use cloudsql_pool::telemetry::init_tracing;
use cloudsql_pool::ConnectionPoolManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;
    init_tracing(&settings.logging)?;
    tracing::info!(
        instance = %settings.database.instance_connection_name,
        database = %settings.database.name,
        "Configuration loaded"
    );

    let mut manager = ConnectionPoolManager::from_settings(&settings);

    let probe = async {
        manager.initialize_from(&settings.database).await?;
        manager.health_check().await
    };

    let outcome = tokio::select! {
        outcome = probe => outcome.map_err(anyhow::Error::from),
        _ = signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, aborting probe");
            Err(anyhow::anyhow!("probe interrupted"))
        }
    };

    // Dispose even when the probe failed; an uninitialized manager is a no-op
    if let Err(e) = manager.dispose().await {
        tracing::error!(error = %e, "Dispose failed");
    }

    outcome?;
    tracing::info!("Probe complete");
    Ok(())
}
