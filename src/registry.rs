//! Caller-owned map from database name to its [`Pool`].
//!
//! A registry is an ordinary value: open it, share it, drop it. Every pool it
//! opens reports activations to the registry's availability listener and,
//! when configured, row changes to its update listener.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{PoolError, Result};
use crate::events::{AvailabilityListener, UpdateListener};
use crate::options::PoolOptions;
use crate::paths::resolve_db_path;
use crate::pool::Pool;
use crate::types::{LockId, LockKind};

/// Outcome of [`Registry::remove`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The database file was deleted.
    Removed(PathBuf),
    /// No file existed at the resolved path.
    NotFound(PathBuf),
}

/// Tracks open pools by name.
pub struct Registry {
    pools: Mutex<FxHashMap<String, Arc<Pool>>>,
    listener: Arc<dyn AvailabilityListener>,
    updates: Option<Arc<dyn UpdateListener>>,
}

impl Registry {
    /// Creates an empty registry whose pools notify `listener`.
    pub fn new(listener: Arc<dyn AvailabilityListener>) -> Self {
        Self {
            pools: Mutex::new(FxHashMap::default()),
            listener,
            updates: None,
        }
    }

    /// Routes row-level changes from every pool's write handle to `listener`.
    pub fn with_update_listener(mut self, listener: Arc<dyn UpdateListener>) -> Self {
        self.updates = Some(listener);
        self
    }

    /// Opens `name` under `location` with `max_reads` read handles and
    /// default tuning.
    pub fn open(&self, name: &str, location: impl AsRef<Path>, max_reads: u32) -> Result<()> {
        let options = PoolOptions::default().with_max_reads(max_reads);
        self.open_with_options(name, location, &options)
    }

    /// Opens `name` under `location` with explicit options.
    ///
    /// Connections are opened without holding the registry lock; if another
    /// caller registers the same name meanwhile, the freshly opened pool is
    /// closed again and [`PoolError::AlreadyOpen`] is returned.
    pub fn open_with_options(
        &self,
        name: &str,
        location: impl AsRef<Path>,
        options: &PoolOptions,
    ) -> Result<()> {
        if self.is_open(name) {
            return Err(already_open(name));
        }
        let mut builder = Pool::builder(name, location.as_ref())
            .options(options.clone())
            .listener(Arc::clone(&self.listener));
        if let Some(updates) = &self.updates {
            builder = builder.update_listener(Arc::clone(updates));
        }
        let pool = builder.open()?;

        let mut pools = self.pools.lock();
        if pools.contains_key(name) {
            drop(pools);
            pool.close_all();
            debug!(db = name, "registry.open.lost_race");
            return Err(already_open(name));
        }
        pools.insert(name.to_string(), Arc::new(pool));
        info!(db = name, open = pools.len(), "registry.open");
        Ok(())
    }

    /// Whether a pool named `name` is tracked.
    pub fn is_open(&self, name: &str) -> bool {
        self.pools.lock().contains_key(name)
    }

    /// Names of every tracked pool, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shared handle to the pool named `name`.
    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.lock().get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<Pool>> {
        self.pool(name).ok_or_else(|| PoolError::not_open(name))
    }

    /// Asks the pool `name` for a lock on behalf of `lock`.
    pub fn request_lock(&self, name: &str, lock: LockId, kind: LockKind) -> Result<()> {
        self.require(name)?.request_lock(lock, kind)
    }

    /// Queues `work` on the handle owned by `lock`.
    pub fn dispatch<F>(&self, name: &str, lock: LockId, work: F) -> Result<()>
    where
        F: FnOnce(&mut Connection) + Send + 'static,
    {
        self.require(name)?.dispatch(lock, work)
    }

    /// Runs literal SQL on the handle owned by `lock`.
    pub fn execute_literal(
        &self,
        name: &str,
        lock: LockId,
        sql: impl Into<String>,
    ) -> Result<oneshot::Receiver<rusqlite::Result<()>>> {
        self.require(name)?.execute_literal(lock, sql)
    }

    /// Releases `lock`. Unknown names and ids are ignored.
    pub fn release(&self, name: &str, lock: LockId) {
        match self.pool(name) {
            Some(pool) => pool.release(lock),
            None => debug!(db = name, lock = %lock, "registry.release.not_open"),
        }
    }

    /// Attaches `target_file` from `location` as `alias` on every handle of `name`.
    pub fn attach(
        &self,
        name: &str,
        target_file: &str,
        location: impl AsRef<Path>,
        alias: &str,
    ) -> Result<()> {
        self.require(name)?.attach(target_file, location, alias)
    }

    /// Detaches `alias` from every handle of `name`.
    pub fn detach(&self, name: &str, alias: &str) -> Result<()> {
        self.require(name)?.detach(alias)
    }

    /// Closes the pool `name` and stops tracking it.
    pub fn close(&self, name: &str) -> Result<()> {
        let pool = self
            .pools
            .lock()
            .remove(name)
            .ok_or_else(|| PoolError::not_open(name))?;
        pool.close_all();
        info!(db = name, "registry.close");
        Ok(())
    }

    /// Closes every tracked pool.
    pub fn close_all(&self) {
        let drained: Vec<(String, Arc<Pool>)> = self.pools.lock().drain().collect();
        for (name, pool) in drained {
            pool.close_all();
            debug!(db = %name, "registry.close");
        }
    }

    /// Closes `name` if it is open, then deletes its database file.
    pub fn remove(&self, name: &str, location: impl AsRef<Path>) -> Result<RemoveOutcome> {
        let tracked = self.pools.lock().remove(name);
        if let Some(pool) = tracked {
            pool.close_all();
            info!(db = name, "registry.close");
        }
        let path = resolve_db_path(location, name);
        if !path.exists() {
            debug!(db = name, path = %path.display(), "registry.remove.missing");
            return Ok(RemoveOutcome::NotFound(path));
        }
        fs::remove_file(&path)?;
        info!(db = name, path = %path.display(), "registry.remove");
        Ok(RemoveOutcome::Removed(path))
    }
}

fn already_open(name: &str) -> PoolError {
    PoolError::AlreadyOpen {
        name: name.to_string(),
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close_all();
    }
}
