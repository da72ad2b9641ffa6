mod allocator;
mod availability;
mod conflict;
mod error;
mod queries;
mod spaces;
mod store;
#[cfg(test)]
mod tests;

pub use availability::space_available;
pub use error::EngineError;
pub use store::{SharedSpaceState, SpaceStore};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SpaceWriteGuard = OwnedRwLockWriteGuard<SpaceState>;
pub type SpaceReadGuard = OwnedRwLockReadGuard<SpaceState>;

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

/// Background task owning the WAL. Appends that arrive while a batch is
/// being collected share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush what we have before compaction or counters see the WAL.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't bleed into
    // the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit of {} events failed: {e}", batch.len());
    }

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The availability & allocation engine for one car park.
pub struct Engine {
    pub(super) store: SpaceStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared while they commit; compaction holds it
    /// exclusively so no event lands between its snapshot and the WAL swap.
    pub(super) commit_gate: RwLock<()>,
    /// Upper bound on every lock wait. `None` waits indefinitely.
    op_timeout: Option<Duration>,
    /// Runs with the chosen space id after an allocation decision and before
    /// its commit lock is taken.
    #[cfg(test)]
    pub(super) before_commit_lock: std::sync::Mutex<Option<CommitLockHook>>,
}

#[cfg(test)]
pub(super) type CommitLockHook = Box<dyn Fn(&SpaceStore, Ulid) + Send + Sync>;

impl Engine {
    pub fn new(wal_path: PathBuf, op_timeout: Option<Duration>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: SpaceStore::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            op_timeout,
            #[cfg(test)]
            before_commit_lock: std::sync::Mutex::new(None),
        };

        // We're the sole owner of every space during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            engine.store.replay_event(event);
        }
        tracing::debug!(
            "replayed {} events into {} spaces from {}",
            events.len(),
            engine.store.space_count(),
            wal_path.display()
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append then apply to a single space. Caller holds the write lock.
    pub(super) async fn persist_and_apply(
        &self,
        space: &mut SpaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(space, event);
        Ok(())
    }

    /// WAL-append then apply a relocation. Caller holds both write locks.
    pub(super) async fn persist_and_apply_move(
        &self,
        source: &mut SpaceState,
        target: &mut SpaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_move(source, target, event);
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn run_before_commit_lock(&self, space_id: Ulid) {
        if let Some(hook) = self.before_commit_lock.lock().unwrap().as_ref() {
            hook(&self.store, space_id);
        }
    }

    // ── Locking ──────────────────────────────────────────

    pub(super) async fn lock_write(&self, space: SharedSpaceState) -> Result<SpaceWriteGuard, EngineError> {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, space.write_owned())
                .await
                .map_err(|_| EngineError::Timeout),
            None => Ok(space.write_owned().await),
        }
    }

    pub(super) async fn lock_read(&self, space: SharedSpaceState) -> Result<SpaceReadGuard, EngineError> {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, space.read_owned())
                .await
                .map_err(|_| EngineError::Timeout),
            None => Ok(space.read_owned().await),
        }
    }

    pub(super) async fn enter_commit(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>, EngineError> {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, self.commit_gate.read())
                .await
                .map_err(|_| EngineError::Timeout),
            None => Ok(self.commit_gate.read().await),
        }
    }

    /// Write-lock two distinct spaces in ascending id order and return the
    /// guards in argument order.
    pub(super) async fn lock_pair(
        &self,
        (a_id, a): (Ulid, SharedSpaceState),
        (b_id, b): (Ulid, SharedSpaceState),
    ) -> Result<(SpaceWriteGuard, SpaceWriteGuard), EngineError> {
        debug_assert_ne!(a_id, b_id);
        if a_id < b_id {
            let ga = self.lock_write(a).await?;
            let gb = self.lock_write(b).await?;
            Ok((ga, gb))
        } else {
            let gb = self.lock_write(b).await?;
            let ga = self.lock_write(a).await?;
            Ok((ga, gb))
        }
    }

    /// Lookup reservation → space, then write-lock that space. A concurrent
    /// relocation can move the reservation between the lookup and the lock,
    /// so the binding is re-checked under the lock.
    pub(super) async fn lock_reservation_space(
        &self,
        id: Ulid,
    ) -> Result<(Ulid, SpaceWriteGuard), EngineError> {
        const RESOLVE_ATTEMPTS: usize = 3;
        for _ in 0..RESOLVE_ATTEMPTS {
            let space_id = self
                .store
                .space_for_reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            let Some(shared) = self.store.get_space(&space_id) else {
                continue;
            };
            let guard = self.lock_write(shared).await?;
            if guard.contains_reservation(id) {
                return Ok((space_id, guard));
            }
        }
        Err(EngineError::Conflict(id))
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        for (_, shared) in self.store.pool() {
            let space = shared.read().await;
            events.push(Event::SpaceCreated {
                id: space.id,
                terminal: space.terminal.clone(),
                active: space.active,
            });
            for r in &space.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    space_id: r.space_id,
                    interval: r.interval,
                    created: r.created,
                });
            }
        }

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

/// Shared handle used by the store and tests.
pub(super) fn shared(space: SpaceState) -> SharedSpaceState {
    Arc::new(RwLock::new(space))
}
