mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod slots;
mod store;

pub use conflict::Conflicts;
pub use error::{EngineError, ValidationError};
pub use lifecycle::{LifecyclePolicy, can_transition};
pub use mutations::ProviderUpdate;
pub use slots::{SlotTiling, free_windows, generate_slots, merge_overlapping, subtract_intervals};
pub use store::InMemoryStore;

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::dispatch::Dispatcher;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, write the
/// batch with a single fsync, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compacting or reporting counts.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Per-tenant knobs the engine needs at runtime.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Zone in which weekly availability and calendar dates are interpreted.
    pub timezone: Tz,
    pub lifecycle: LifecyclePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            lifecycle: LifecyclePolicy::default(),
        }
    }
}

pub struct Engine {
    pub store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub dispatcher: Arc<Dispatcher>,
    pub settings: EngineSettings,
}

impl Engine {
    /// Replay the WAL at `wal_path` into memory and start its writer task.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        dispatcher: Arc<Dispatcher>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            notify,
            dispatcher,
            settings,
        };

        // Nobody else holds these locks yet, so try_write never fails here.
        // Blocking acquisition is off-limits: this may run inside the runtime.
        for event in &events {
            if let Some(provider) = store::provider_from_event(event) {
                engine
                    .store
                    .insert_provider(provider.id, Arc::new(RwLock::new(ProviderState::new(provider))));
                continue;
            }
            let Some(shared) = engine.store.get_provider(&event.provider_id()) else {
                tracing::warn!(provider_id = %event.provider_id(), "replay: event for unknown provider");
                continue;
            };
            if let Ok(mut guard) = shared.try_write() {
                engine.store.apply_event(&mut guard, event);
            }
        }
        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            providers = engine.store.provider_count(),
            "engine replayed"
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply, publish to the change feed. State changes only once durable.
    pub(super) async fn persist_and_apply(
        &self,
        provider_id: Ulid,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(ps, event);
        self.notify.send(provider_id, event);
        Ok(())
    }

    pub(super) async fn provider_write(
        &self,
        provider_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let shared = self
            .store
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        Ok(shared.write_owned().await)
    }

    /// Lookup entity → provider, acquire that provider's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        let provider_id = self
            .store
            .get_provider_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.provider_write(provider_id).await?;
        Ok((provider_id, guard))
    }
}
