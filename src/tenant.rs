use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::dispatch::{Dispatcher, Notifier, RetryPolicy};
use crate::engine::{Engine, EngineSettings};
use crate::housekeeping::{self, SweepSchedule};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Per-tenant engines. Each tenant gets its own engine, WAL, dispatcher and
/// housekeeping loops; all tenants share one notifier.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: EngineSettings,
    schedule: SweepSchedule,
    compact_threshold: u64,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    retention: Duration,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        settings: EngineSettings,
        schedule: SweepSchedule,
        compact_threshold: u64,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        retention: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            schedule,
            compact_threshold,
            notifier,
            retry,
            retention,
        }
    }

    /// Get or lazily create the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Keep the WAL inside data_dir.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let dispatcher = Arc::new(Dispatcher::with_retention(
            self.notifier.clone(),
            self.retry,
            self.retention,
        ));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            dispatcher,
            self.settings,
        )?);

        tokio::spawn(housekeeping::run_housekeeping(engine.clone(), self.schedule));
        tokio::spawn(housekeeping::run_compactor(engine.clone(), self.compact_threshold));

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, providers = engine.store.provider_count(), "tenant loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}
