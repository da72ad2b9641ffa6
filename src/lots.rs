use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One engine per car park, each with its own WAL and compactor. A car park
/// is named by the Postgres database of the connection.
pub struct LotManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    op_timeout: Option<Duration>,
}

/// Keep only characters safe in a file name.
fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl LotManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, op_timeout: Option<Duration>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            op_timeout,
        }
    }

    /// Get the engine for `lot`, replaying its WAL on first use.
    pub fn get_or_create(&self, lot: &str) -> std::io::Result<Arc<Engine>> {
        if lot.len() > MAX_LOT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "car park name too long",
            ));
        }
        let name = sanitize(lot);
        if name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty car park name",
            ));
        }
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_LOTS {
            return Err(std::io::Error::other("too many car parks"));
        }

        // The entry guard is held across replay so two connections never open
        // the same WAL twice.
        let engine = match self.engines.entry(name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.op_timeout)?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                engine
            }
        };

        info!(
            "car park {name} loaded ({} spaces, {} reservations)",
            engine.space_count(),
            engine.reservation_count()
        );
        metrics::gauge!(crate::observability::LOTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn lot_count(&self) -> usize {
        self.engines.len()
    }
}
