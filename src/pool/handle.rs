use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{PoolError, Result};
use crate::events::{TableUpdate, UpdateListener, UpdateOperation};
use crate::types::{HandleMode, SlotIndex};

/// Deferred unit of work run against a handle's connection.
pub type Work = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

#[derive(Default)]
struct WorkState {
    pending: VecDeque<Work>,
    closing: bool,
}

struct Shared {
    state: Mutex<WorkState>,
    wakeup: Condvar,
}

/// One open connection plus the worker thread that drains its work queue.
///
/// Work items run exactly once, in submission order. Closing lets the worker
/// finish everything already queued before the connection is closed.
pub(crate) struct Handle {
    db: Arc<str>,
    index: SlotIndex,
    mode: HandleMode,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Handle {
    pub(crate) fn open(
        db: Arc<str>,
        path: &Path,
        index: SlotIndex,
        mode: HandleMode,
        busy_timeout_ms: u64,
    ) -> Result<Self> {
        let flags = match mode {
            HandleMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI
            }
            HandleMode::ReadOnly => {
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI
            }
        };
        let open_err = |source| PoolError::Open {
            name: db.to_string(),
            source,
        };
        let conn = Connection::open_with_flags(path, flags).map_err(open_err)?;
        if busy_timeout_ms > 0 {
            conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
                .map_err(open_err)?;
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(WorkState::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker_db = Arc::clone(&db);
        let worker = thread::Builder::new()
            .name(format!("lockpool-{db}-{index}"))
            .spawn(move || worker_loop(worker_db, index, conn, worker_shared))?;
        let worker_id = worker.thread().id();
        debug!(db = %db, slot = %index, ?mode, "handle.open");
        Ok(Self {
            db,
            index,
            mode,
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    pub(crate) fn index(&self) -> SlotIndex {
        self.index
    }

    pub(crate) fn mode(&self) -> HandleMode {
        self.mode
    }

    /// Queues work. Returns `false` once the handle is closing.
    pub(crate) fn enqueue(&self, work: Work) -> bool {
        let mut state = self.shared.state.lock();
        if state.closing {
            return false;
        }
        state.pending.push_back(work);
        self.shared.wakeup.notify_one();
        true
    }

    /// Whether the calling thread is this handle's worker.
    pub(crate) fn is_current_worker(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Queues `f` behind existing work and blocks until it has run.
    ///
    /// Refused on the worker thread itself, since the queued item could only
    /// run after the caller returns.
    pub(crate) fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> T + Send + 'static,
    {
        if self.is_current_worker() {
            return Err(PoolError::CalledFromWorker {
                name: self.db.to_string(),
            });
        }
        let (tx, rx) = mpsc::sync_channel(1);
        let queued = self.enqueue(Box::new(move |conn: &mut Connection| {
            let _ = tx.send(f(conn));
        }));
        if !queued {
            return Err(PoolError::closed(&*self.db));
        }
        rx.recv().map_err(|_| PoolError::closed(&*self.db))
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Routes row-level changes on this connection to `listener`.
    pub(crate) fn install_update_hook(&self, listener: Arc<dyn UpdateListener>) -> bool {
        let db = Arc::clone(&self.db);
        self.enqueue(Box::new(move |conn: &mut Connection| {
            conn.update_hook(Some(
                move |action, database: &str, table: &str, row_id: i64| {
                    if let Some(operation) = UpdateOperation::from_action(action) {
                        listener.table_updated(TableUpdate {
                            db: Arc::clone(&db),
                            operation,
                            database: database.to_string(),
                            table: table.to_string(),
                            row_id,
                        });
                    }
                },
            ));
        }))
    }

    /// Drains queued work, stops the worker, and closes the connection.
    /// Safe to call more than once.
    pub(crate) fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closing = true;
            self.shared.wakeup.notify_all();
        }
        if self.is_current_worker() {
            // Closed from one of our own work items; the loop exits after it returns.
            return;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(db = %self.db, slot = %self.index, "handle.worker.join_failed");
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(db: Arc<str>, index: SlotIndex, mut conn: Connection, shared: Arc<Shared>) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            loop {
                if let Some(work) = state.pending.pop_front() {
                    break Some(work);
                }
                if state.closing {
                    break None;
                }
                shared.wakeup.wait(&mut state);
            }
        };
        let Some(work) = work else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| work(&mut conn))).is_err() {
            warn!(db = %db, slot = %index, "handle.work.panicked");
        }
    }
    debug!(db = %db, slot = %index, "handle.worker.exit");
    if let Err((_, err)) = conn.close() {
        warn!(db = %db, slot = %index, error = %err, "handle.close.failed");
    }
}
