mod conflict;
mod error;
mod mutations;
mod queries;
mod refunds;
mod settlements;
mod store;
#[cfg(test)]
mod tests;

pub use conflict::Slot;
pub use error::EngineError;
pub use mutations::{BookingReceipt, BookingRequest, CancelOutcome, PaymentReceipt};
pub use store::{RecordHandle, ResourceBook, ResourceHandle, Store};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::gateway::PaymentGateway;
use crate::model::Event;
use crate::pricing::PricingSource;
use crate::settings::ConfigAccessor;
use crate::wal::Wal;

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// All events of one operation; synced in the same flush.
    Append {
        events: Vec<Event>,
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

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even on append error, so buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Collaborators and tuning the engine is built with.
pub struct EngineDeps {
    pub settings: Arc<ConfigAccessor>,
    pub pricing: Arc<dyn PricingSource>,
    /// `None` leaves refunds PENDING until a gateway-equipped engine dispatches them.
    pub gateway: Option<Arc<dyn PaymentGateway>>,
    /// Bounded wait for resource and record locks.
    pub lock_wait: Duration,
}

pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every commit, exclusive for compaction, so no commit
    /// can land between the snapshot and the swap.
    pub(super) commit_gate: RwLock<()>,
    pub(super) settings: Arc<ConfigAccessor>,
    pub(super) pricing: Arc<dyn PricingSource>,
    pub(super) gateway: Option<Arc<dyn PaymentGateway>>,
    pub(super) lock_wait: Duration,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task.
    pub fn new(wal_path: PathBuf, deps: EngineDeps) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(path = %wal_path.display(), "discarded torn WAL tail during replay");
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for event in &replay.events {
            store
                .replay_event(event)
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        info!(
            events = replay.events.len(),
            reservations = store.reservation_count(),
            "engine state replayed"
        );

        Ok(Self {
            store,
            wal_tx,
            commit_gate: RwLock::new(()),
            settings: deps.settings,
            pricing: deps.pricing,
            gateway: deps.gateway,
            lock_wait: deps.lock_wait,
        })
    }

    pub fn settings(&self) -> &ConfigAccessor {
        &self.settings
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, in one call. `book` is required when the
    /// events include a new reservation.
    pub(super) async fn persist(
        &self,
        events: Vec<Event>,
        mut book: Option<&mut ResourceBook>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(events.clone()).await?;
        for event in &events {
            self.store.apply_event(event, book.as_deref_mut());
        }
        Ok(())
    }

    /// Run a critical section on its own task so that dropping the caller's
    /// future cannot stop it between the WAL write and the in-memory apply.
    pub(super) async fn detached<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.clone()))
            .await
            .map_err(|e| EngineError::Internal(format!("critical section aborted: {e}")))?
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
