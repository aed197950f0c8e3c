use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use slotd::config::Config;
use slotd::dispatch::LogNotifier;
use slotd::tenant::TenantManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    slotd::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let tenants = TenantManager::new(
        config.data_dir.clone(),
        config.engine,
        config.schedule,
        config.compact_threshold,
        Arc::new(LogNotifier),
        config.retry,
        config.notification_retention,
    );
    for name in &config.tenants {
        tenants.get_or_create(name)?;
    }

    info!("slotd running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants: {}", config.tenants.join(", "));
    info!("  timezone: {}", config.engine.timezone);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Housekeeping runs in background tasks until SIGTERM/ctrl-c.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!(tenants = tenants.tenant_count(), "slotd stopped");
    Ok(())
}
