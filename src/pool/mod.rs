//! Lock scheduler over one write handle and a fixed set of read handles.
//!
//! Callers name their claims with a [`LockId`] and ask for a read or write
//! lock. A free slot is activated immediately; otherwise the id waits in a
//! FIFO queue (one for writes, one for reads) until a release hands the slot
//! over. Activation is only ever observed through the pool's
//! [`AvailabilityListener`]. Once notified, the caller dispatches work that
//! runs on the owning handle's worker, and finally releases the lock.
//!
//! Attach and detach change what every connection can see, so they run only
//! when every slot is idle. While they execute, new requests queue instead of
//! activating; queued waiters are promoted when the operation completes.

mod handle;
mod slot;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::{PoolError, Result};
use crate::events::{AvailabilityListener, LockAvailable, NoopListener, UpdateListener};
use crate::options::PoolOptions;
use crate::paths::{attach_statement, detach_statement, resolve_db_path};
use crate::types::{HandleMode, LockId, LockKind, SlotIndex};

use handle::Handle;
pub use handle::Work;
use slot::Slot;

/// Configures and opens a [`Pool`].
pub struct PoolBuilder {
    name: String,
    location: PathBuf,
    options: PoolOptions,
    listener: Arc<dyn AvailabilityListener>,
    updates: Option<Arc<dyn UpdateListener>>,
}

impl PoolBuilder {
    /// Replaces all options.
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the number of read handles.
    pub fn max_reads(mut self, max_reads: u32) -> Self {
        self.options.max_reads = max_reads;
        self
    }

    /// Sets the listener notified on every slot activation.
    pub fn listener(mut self, listener: Arc<dyn AvailabilityListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Sets the listener notified of row-level changes on the write handle.
    pub fn update_listener(mut self, listener: Arc<dyn UpdateListener>) -> Self {
        self.updates = Some(listener);
        self
    }

    /// Opens the write handle, then every read handle, and queues tuning
    /// pragmas ahead of any caller work.
    pub fn open(self) -> Result<Pool> {
        let PoolBuilder {
            name,
            location,
            options,
            listener,
            updates,
        } = self;
        let name: Arc<str> = Arc::from(name);
        let path = resolve_db_path(&location, &name);

        let write = Handle::open(
            Arc::clone(&name),
            &path,
            SlotIndex::Write,
            HandleMode::ReadWrite,
            options.busy_timeout_ms,
        )?;
        let reads = (0..options.max_reads as usize)
            .map(|idx| {
                Handle::open(
                    Arc::clone(&name),
                    &path,
                    SlotIndex::Read(idx),
                    HandleMode::ReadOnly,
                    options.busy_timeout_ms,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        if options.concurrency_enabled() {
            for handle in std::iter::once(&write).chain(reads.iter()) {
                queue_tuning(handle, &options);
            }
        }
        let updates_installed = match updates {
            Some(updates) => write.install_update_hook(updates),
            None => false,
        };

        info!(
            db = %name,
            path = %path.display(),
            max_reads = options.max_reads,
            "pool.open"
        );
        Ok(Pool {
            name,
            concurrency_enabled: options.concurrency_enabled(),
            state: Mutex::new(PoolState {
                write: Slot::new(write),
                reads: reads.into_iter().map(Slot::new).collect(),
                write_queue: VecDeque::new(),
                read_queue: VecDeque::new(),
                coordinating: false,
                updates_installed,
                closed: false,
            }),
            listener,
            outbox: Mutex::new(Outbox::default()),
        })
    }
}

fn queue_tuning(handle: &Handle, options: &PoolOptions) {
    let index = handle.index();
    let sql = match handle.mode() {
        HandleMode::ReadWrite => options.write_tuning(),
        HandleMode::ReadOnly => options.read_tuning(),
    };
    handle.enqueue(Box::new(move |conn: &mut Connection| {
        if let Err(err) = conn.execute_batch(&sql) {
            warn!(slot = %index, error = %err, "pool.tuning.failed");
        }
    }));
}

/// Point-in-time copy of a pool's bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct PoolSnapshot {
    /// Owner of the write slot.
    pub write_owner: Option<LockId>,
    /// Owner of each read slot, in slot order.
    pub read_owners: Vec<Option<LockId>>,
    /// Ids waiting for the write slot, head first.
    pub write_queue: Vec<LockId>,
    /// Ids waiting for a read slot, head first.
    pub read_queue: Vec<LockId>,
    /// Work items queued per handle, write handle first.
    pub pending_work: Vec<usize>,
    /// Whether an attach or detach is running.
    pub coordinating: bool,
    /// Whether the pool has been torn down.
    pub closed: bool,
}

impl PoolSnapshot {
    /// Slot currently owned by `lock`, write slot checked first.
    pub fn owner_of(&self, lock: LockId) -> Option<SlotIndex> {
        if self.write_owner == Some(lock) {
            return Some(SlotIndex::Write);
        }
        self.read_owners
            .iter()
            .position(|owner| *owner == Some(lock))
            .map(SlotIndex::Read)
    }

    /// True when no slot is owned.
    pub fn is_idle(&self) -> bool {
        self.write_owner.is_none() && self.read_owners.iter().all(Option::is_none)
    }
}

struct PoolState {
    write: Slot,
    reads: Vec<Slot>,
    write_queue: VecDeque<LockId>,
    read_queue: VecDeque<LockId>,
    coordinating: bool,
    updates_installed: bool,
    closed: bool,
}

/// Activations waiting to be handed to the listener. Only one thread
/// delivers at a time; a listener that re-enters the pool appends here and
/// returns instead of recursing. An activation raised while another thread
/// is delivering reaches the listener from that thread.
#[derive(Default)]
struct Outbox {
    pending: VecDeque<LockAvailable>,
    delivering: bool,
}

/// Frees the outbox for the next deliverer if a listener panics mid-drain.
struct DeliveryReset<'a>(&'a Mutex<Outbox>);

impl Drop for DeliveryReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

enum Released {
    HandedOff { slot: SlotIndex, next: LockId },
    Cleared { slot: SlotIndex },
    Unknown,
}

impl PoolState {
    fn slot(&self, index: SlotIndex) -> &Slot {
        match index {
            SlotIndex::Write => &self.write,
            SlotIndex::Read(idx) => &self.reads[idx],
        }
    }

    fn slot_mut(&mut self, index: SlotIndex) -> &mut Slot {
        match index {
            SlotIndex::Write => &mut self.write,
            SlotIndex::Read(idx) => &mut self.reads[idx],
        }
    }

    /// Linear scan: write slot first, then read slots in index order.
    fn locate(&self, lock: LockId) -> Option<SlotIndex> {
        if self.write.matches(lock) {
            return Some(SlotIndex::Write);
        }
        self.reads
            .iter()
            .position(|slot| slot.matches(lock))
            .map(SlotIndex::Read)
    }

    fn is_tracked(&self, lock: LockId) -> bool {
        self.locate(lock).is_some()
            || self.write_queue.contains(&lock)
            || self.read_queue.contains(&lock)
    }

    fn all_idle(&self) -> bool {
        self.write.is_empty() && self.reads.iter().all(Slot::is_empty)
    }

    fn acquire_write(&mut self, lock: LockId) -> Option<SlotIndex> {
        if !self.coordinating && self.write.is_empty() {
            self.write.activate(lock);
            return Some(SlotIndex::Write);
        }
        self.write_queue.push_back(lock);
        None
    }

    fn acquire_read(&mut self, lock: LockId) -> Option<SlotIndex> {
        // Never overtake ids that are already waiting.
        if self.coordinating || !self.read_queue.is_empty() {
            self.read_queue.push_back(lock);
            return None;
        }
        match self.reads.iter().position(Slot::is_empty) {
            Some(idx) => {
                self.reads[idx].activate(lock);
                Some(SlotIndex::Read(idx))
            }
            None => {
                self.read_queue.push_back(lock);
                None
            }
        }
    }

    fn release(&mut self, lock: LockId) -> Released {
        let Some(slot) = self.locate(lock) else {
            return Released::Unknown;
        };
        let next = match slot {
            SlotIndex::Write => self.write_queue.pop_front(),
            SlotIndex::Read(_) => self.read_queue.pop_front(),
        };
        let target = self.slot_mut(slot);
        match next {
            Some(next) => {
                target.hand_off(next);
                Released::HandedOff { slot, next }
            }
            None => {
                target.clear();
                Released::Cleared { slot }
            }
        }
    }

    fn promote_waiters(&mut self) -> Vec<(SlotIndex, LockId)> {
        let mut promoted = Vec::new();
        if self.write.is_empty() {
            if let Some(next) = self.write_queue.pop_front() {
                self.write.activate(next);
                promoted.push((SlotIndex::Write, next));
            }
        }
        for (idx, slot) in self.reads.iter_mut().enumerate() {
            if !slot.is_empty() {
                continue;
            }
            let Some(next) = self.read_queue.pop_front() else {
                break;
            };
            slot.activate(next);
            promoted.push((SlotIndex::Read(idx), next));
        }
        promoted
    }

    fn handles(&self) -> Vec<Arc<Handle>> {
        std::iter::once(&self.write)
            .chain(self.reads.iter())
            .map(|slot| Arc::clone(slot.handle()))
            .collect()
    }

    fn clear_all(&mut self) -> usize {
        let abandoned = self.write_queue.len() + self.read_queue.len();
        self.write_queue.clear();
        self.read_queue.clear();
        self.write.clear();
        for slot in &mut self.reads {
            slot.clear();
        }
        abandoned
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            write_owner: self.write.owner(),
            read_owners: self.reads.iter().map(Slot::owner).collect(),
            write_queue: self.write_queue.iter().copied().collect(),
            read_queue: self.read_queue.iter().copied().collect(),
            pending_work: std::iter::once(&self.write)
                .chain(self.reads.iter())
                .map(|slot| slot.handle().pending())
                .collect(),
            coordinating: self.coordinating,
            closed: self.closed,
        }
    }
}

/// Scheduler owning one write handle, `max_reads` read handles and their
/// wait queues.
pub struct Pool {
    name: Arc<str>,
    concurrency_enabled: bool,
    state: Mutex<PoolState>,
    listener: Arc<dyn AvailabilityListener>,
    outbox: Mutex<Outbox>,
}

impl Pool {
    /// Starts configuring a pool for the database `name` inside `location`.
    pub fn builder(name: impl Into<String>, location: impl Into<PathBuf>) -> PoolBuilder {
        PoolBuilder {
            name: name.into(),
            location: location.into(),
            options: PoolOptions::default(),
            listener: Arc::new(NoopListener),
            updates: None,
        }
    }

    /// Opens a pool with `options`, reporting activations to `listener`.
    pub fn open(
        name: impl Into<String>,
        location: impl Into<PathBuf>,
        options: &PoolOptions,
        listener: Arc<dyn AvailabilityListener>,
    ) -> Result<Self> {
        Self::builder(name, location)
            .options(options.clone())
            .listener(listener)
            .open()
    }

    /// Database name this pool serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of read slots.
    pub fn max_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    /// False when the pool has no read slots and reads share the write slot.
    pub fn is_concurrency_enabled(&self) -> bool {
        self.concurrency_enabled
    }

    /// Whether [`Pool::close_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Routes row-level changes made through the write handle to `listener`.
    /// Takes effect after work already queued on the write handle.
    ///
    /// A pool carries at most one update listener; a second install, here or
    /// through [`PoolBuilder::update_listener`], fails with
    /// [`PoolError::UpdateListenerAlreadySet`].
    pub fn set_update_listener(&self, listener: Arc<dyn UpdateListener>) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if state.updates_installed {
            return Err(PoolError::UpdateListenerAlreadySet {
                name: self.name.to_string(),
            });
        }
        if !state.write.handle().install_update_hook(listener) {
            return Err(PoolError::closed(&*self.name));
        }
        state.updates_installed = true;
        Ok(())
    }

    /// Requests a lock of the given kind.
    pub fn request_lock(&self, lock: LockId, kind: LockKind) -> Result<()> {
        match kind {
            LockKind::Read => self.request_read_lock(lock),
            LockKind::Write => self.request_write_lock(lock),
        }
    }

    /// Requests a read slot, or queues behind earlier read requests.
    ///
    /// Without read handles this is exactly [`Pool::request_write_lock`].
    pub fn request_read_lock(&self, lock: LockId) -> Result<()> {
        if !self.concurrency_enabled {
            return self.request_write_lock(lock);
        }
        let activated = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            if state.is_tracked(lock) {
                warn!(db = %self.name, lock = %lock, "pool.lock.duplicate");
                return Ok(());
            }
            state.acquire_read(lock)
        };
        self.finish_request(lock, LockKind::Read, activated);
        Ok(())
    }

    /// Requests the write slot, or queues behind earlier write requests.
    pub fn request_write_lock(&self, lock: LockId) -> Result<()> {
        let activated = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            if state.is_tracked(lock) {
                warn!(db = %self.name, lock = %lock, "pool.lock.duplicate");
                return Ok(());
            }
            state.acquire_write(lock)
        };
        self.finish_request(lock, LockKind::Write, activated);
        Ok(())
    }

    fn finish_request(&self, lock: LockId, kind: LockKind, activated: Option<SlotIndex>) {
        match activated {
            Some(slot) => {
                debug!(db = %self.name, lock = %lock, slot = %slot, "pool.lock.activated");
                self.notify(lock);
            }
            None => debug!(db = %self.name, lock = %lock, %kind, "pool.lock.queued"),
        }
    }

    /// Queues `work` on the handle owned by `lock`.
    ///
    /// Returns once the work is queued; its outcome travels through whatever
    /// channel the closure itself uses.
    pub fn dispatch<F>(&self, lock: LockId, work: F) -> Result<()>
    where
        F: FnOnce(&mut Connection) + Send + 'static,
    {
        self.dispatch_boxed(lock, Box::new(work))
    }

    /// [`Pool::dispatch`] for an already boxed work item.
    pub fn dispatch_boxed(&self, lock: LockId, work: Work) -> Result<()> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        let Some(slot) = state.locate(lock) else {
            debug!(db = %self.name, lock = %lock, "pool.dispatch.unavailable");
            return Err(PoolError::ContextUnavailable { lock });
        };
        if state.slot(slot).handle().enqueue(work) {
            trace!(db = %self.name, lock = %lock, slot = %slot, "pool.dispatch.queued");
            Ok(())
        } else {
            Err(PoolError::closed(&*self.name))
        }
    }

    /// Runs literal SQL on the handle owned by `lock`; the outcome arrives on
    /// the returned receiver.
    pub fn execute_literal(
        &self,
        lock: LockId,
        sql: impl Into<String>,
    ) -> Result<oneshot::Receiver<rusqlite::Result<()>>> {
        let sql = sql.into();
        let (tx, rx) = oneshot::channel();
        self.dispatch(lock, move |conn| {
            let _ = tx.send(conn.execute_batch(&sql));
        })?;
        Ok(rx)
    }

    /// Releases the slot owned by `lock`, handing it straight to the head of
    /// the matching queue. Unknown ids are ignored.
    pub fn release(&self, lock: LockId) {
        let released = {
            let mut state = self.state.lock();
            if state.closed {
                trace!(db = %self.name, lock = %lock, "pool.release.closed");
                return;
            }
            state.release(lock)
        };
        match released {
            Released::HandedOff { slot, next } => {
                debug!(
                    db = %self.name,
                    lock = %lock,
                    next = %next,
                    slot = %slot,
                    "pool.lock.promoted"
                );
                self.notify(next);
            }
            Released::Cleared { slot } => {
                debug!(db = %self.name, lock = %lock, slot = %slot, "pool.lock.released");
            }
            Released::Unknown => {
                trace!(db = %self.name, lock = %lock, "pool.release.unknown");
            }
        }
    }

    /// Attaches `target_file` from `location` as `alias` on every handle.
    ///
    /// Fails with [`PoolError::SomeConnectionsLocked`] unless every slot is
    /// idle. If any handle rejects the statement, the handles that already
    /// attached are detached again and the first failure is returned.
    pub fn attach(
        &self,
        target_file: &str,
        location: impl AsRef<Path>,
        alias: &str,
    ) -> Result<()> {
        let coordination = self.begin_coordination()?;
        let path = resolve_db_path(location, target_file);
        let statement = attach_statement(&path, alias);
        match execute_on_each(&coordination.handles, &statement) {
            Ok(()) => {
                info!(db = %self.name, alias, path = %path.display(), "pool.attach");
                Ok(())
            }
            Err((failed_at, reason)) => {
                warn!(
                    db = %self.name,
                    alias,
                    slot = %coordination.handles[failed_at].index(),
                    %reason,
                    "pool.attach.failed"
                );
                self.roll_back_attach(&coordination.handles[..failed_at], alias);
                Err(PoolError::AttachFailed {
                    name: self.name.to_string(),
                    reason,
                })
            }
        }
    }

    fn roll_back_attach(&self, attached: &[Arc<Handle>], alias: &str) {
        let statement = detach_statement(alias);
        for handle in attached {
            let sql = statement.clone();
            let outcome = handle
                .run(move |conn| conn.execute_batch(&sql))
                .map_err(|err| err.to_string())
                .and_then(|res| res.map_err(|err| err.to_string()));
            if let Err(reason) = outcome {
                warn!(
                    db = %self.name,
                    alias,
                    slot = %handle.index(),
                    %reason,
                    "pool.attach.rollback_failed"
                );
            }
        }
    }

    /// Detaches `alias` from every handle, stopping at the first failure.
    pub fn detach(&self, alias: &str) -> Result<()> {
        let coordination = self.begin_coordination()?;
        let statement = detach_statement(alias);
        match execute_on_each(&coordination.handles, &statement) {
            Ok(()) => {
                info!(db = %self.name, alias, "pool.detach");
                Ok(())
            }
            Err((failed_at, reason)) => {
                warn!(
                    db = %self.name,
                    alias,
                    slot = %coordination.handles[failed_at].index(),
                    %reason,
                    "pool.detach.failed"
                );
                Err(PoolError::DetachFailed {
                    name: self.name.to_string(),
                    reason,
                })
            }
        }
    }

    fn begin_coordination(&self) -> Result<Coordination<'_>> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        let handles = state.handles();
        if handles.iter().any(|handle| handle.is_current_worker()) {
            warn!(db = %self.name, "pool.coordination.from_worker");
            return Err(PoolError::CalledFromWorker {
                name: self.name.to_string(),
            });
        }
        if state.coordinating || !state.all_idle() {
            debug!(db = %self.name, "pool.coordination.busy");
            return Err(PoolError::SomeConnectionsLocked {
                name: self.name.to_string(),
            });
        }
        state.coordinating = true;
        Ok(Coordination {
            pool: self,
            handles,
        })
    }

    /// Closes every handle regardless of ownership. Queued ids are dropped
    /// without notification.
    pub fn close_all(&self) {
        let handles = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let abandoned = state.clear_all();
            info!(db = %self.name, abandoned, "pool.close");
            state.handles()
        };
        for handle in handles {
            handle.close();
        }
    }

    /// Copies the current bookkeeping.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.state.lock().snapshot()
    }

    fn ensure_open(&self, state: &PoolState) -> Result<()> {
        if state.closed {
            return Err(PoolError::closed(&*self.name));
        }
        Ok(())
    }

    /// Hands `lock`'s activation to the listener. Whichever thread finds the
    /// outbox idle drains it, so nested releases from inside the listener
    /// are delivered in a loop rather than on a growing stack.
    fn notify(&self, lock: LockId) {
        let mut outbox = self.outbox.lock();
        outbox.pending.push_back(LockAvailable {
            db: Arc::clone(&self.name),
            lock,
        });
        if outbox.delivering {
            return;
        }
        outbox.delivering = true;
        let _reset = DeliveryReset(&self.outbox);
        loop {
            let Some(event) = outbox.pending.pop_front() else {
                outbox.delivering = false;
                return;
            };
            drop(outbox);
            self.listener.lock_available(event);
            outbox = self.outbox.lock();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Marks a pool as running attach/detach; on drop, clears the mark and
/// promotes anything that queued meanwhile.
struct Coordination<'a> {
    pool: &'a Pool,
    handles: Vec<Arc<Handle>>,
}

impl Drop for Coordination<'_> {
    fn drop(&mut self) {
        let promoted = {
            let mut state = self.pool.state.lock();
            state.coordinating = false;
            if state.closed {
                Vec::new()
            } else {
                state.promote_waiters()
            }
        };
        for (slot, lock) in promoted {
            debug!(db = %self.pool.name, lock = %lock, slot = %slot, "pool.lock.activated");
            self.pool.notify(lock);
        }
    }
}

/// Runs `statement` on each handle in order. On failure returns the position
/// of the failing handle and SQLite's message.
fn execute_on_each(
    handles: &[Arc<Handle>],
    statement: &str,
) -> std::result::Result<(), (usize, String)> {
    for (position, handle) in handles.iter().enumerate() {
        let sql = statement.to_string();
        match handle.run(move |conn| conn.execute_batch(&sql)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err((position, err.to_string())),
            Err(err) => return Err((position, err.to_string())),
        }
    }
    Ok(())
}
