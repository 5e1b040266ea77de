//! Durable position snapshot store.
//!
//! An LMDB environment (via `heed`) maps the decimal string form of a
//! position id to a versioned JSON snapshot. Writes go through a single
//! writer task fed by an unbounded channel: callers never block on disk, and
//! per-key ordering is preserved because one consumer applies mutations in
//! send order. Persistence is failed-soft: errors are logged and the
//! in-memory state stays authoritative for the rest of the process lifetime.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::position::Position;

/// Map size reserved for the LMDB environment (1 GiB). LMDB does not claim
/// physical disk space until pages are used.
const MAP_SIZE_BYTES: usize = 1024 * 1024 * 1024;
const POSITIONS_DB: &str = "positions";

/// Errors raised while opening or accessing the store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to prepare store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Heed(#[from] heed::Error),
}

enum StoreCommand {
    Save(u64, Position),
    Delete(u64),
    /// Test/shutdown barrier: acked once every prior command is durable.
    Flush(oneshot::Sender<()>),
}

/// LMDB-backed key-value store of position snapshots.
pub struct PositionStore {
    env: Env,
    db: Database<Str, SerdeJson<Position>>,
}

impl PositionStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe { EnvOpenOptions::new().map_size(MAP_SIZE_BYTES).max_dbs(2).open(path)? };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some(POSITIONS_DB))?;
        wtxn.commit()?;

        info!(path = %path.display(), "position store ready");
        Ok(Self { env, db })
    }

    fn put(&self, id: u64, position: &Position) -> Result<(), PersistError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &id.to_string(), position)?;
        wtxn.commit()?;
        Ok(())
    }

    fn get(&self, id: u64) -> Result<Option<Position>, PersistError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, &id.to_string())?)
    }

    fn remove(&self, id: u64) -> Result<(), PersistError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, &id.to_string())?;
        wtxn.commit()?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<Position>, PersistError> {
        let rtxn = self.env.read_txn()?;
        let mut positions = Vec::new();
        for entry in self.db.iter(&rtxn)? {
            let (_, position) = entry?;
            positions.push(position);
        }
        Ok(positions)
    }
}

/// Cloneable handle combining non-blocking writes with direct reads.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<PositionStore>,
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    /// Queue a snapshot write. Never blocks; a later save for the same id can
    /// never be overtaken by an earlier one.
    pub fn save(&self, id: u64, position: Position) {
        if self.tx.send(StoreCommand::Save(id, position)).is_err() {
            error!(id, "store writer gone, dropping snapshot save");
        }
    }

    /// Queue a snapshot removal.
    pub fn delete(&self, id: u64) {
        if self.tx.send(StoreCommand::Delete(id)).is_err() {
            error!(id, "store writer gone, dropping snapshot delete");
        }
    }

    /// Last durable snapshot for `id`, or None. Errors are logged and
    /// reported as not-found.
    pub fn find(&self, id: u64) -> Option<Position> {
        match self.store.get(id) {
            Ok(found) => found,
            Err(error) => {
                error!(id, %error, "snapshot lookup failed");
                None
            }
        }
    }

    /// All positions whose closing time (or creation time while still open)
    /// is at or after `cutoff`. Full scan; used by the reporting seam only.
    pub fn find_all_since(&self, cutoff: DateTime<Utc>) -> Vec<Position> {
        self.load_all()
            .into_iter()
            .filter(|position| position.closed_at.unwrap_or(position.created_at) >= cutoff)
            .collect()
    }

    /// Every stored snapshot; used for startup cache warm-up.
    pub fn load_all(&self) -> Vec<Position> {
        match self.store.scan() {
            Ok(positions) => positions,
            Err(error) => {
                error!(%error, "snapshot scan failed");
                Vec::new()
            }
        }
    }

    /// Wait until every previously queued write has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(StoreCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Spawn the single writer task and hand back the store handle.
pub fn spawn_writer(store: Arc<PositionStore>) -> (StoreHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let writer_store = store.clone();
    let handle = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                StoreCommand::Save(id, position) => {
                    if let Err(error) = writer_store.put(id, &position) {
                        error!(id, %error, "snapshot save failed");
                    } else {
                        debug!(id, status = %position.status, "snapshot saved");
                    }
                }
                StoreCommand::Delete(id) => {
                    if let Err(error) = writer_store.remove(id) {
                        error!(id, %error, "snapshot delete failed");
                    }
                }
                StoreCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
    (StoreHandle { store, tx }, handle)
}
