//! Fair lock scheduling over a fixed pool of SQLite connections.
//!
//! Each [`Pool`] owns one read-write connection and `max_reads` read-only
//! connections. Callers claim one of them with a caller-chosen [`LockId`],
//! are queued FIFO when none is free, learn of activation through an
//! [`AvailabilityListener`], dispatch work against the claimed connection and
//! release it, at which point the next waiter is promoted.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lockpool::{events, LockId, LockKind, Registry};
//!
//! # fn main() -> lockpool::Result<()> {
//! let (tx, mut rx) = events::availability_channel();
//! let registry = Registry::new(Arc::new(tx));
//! registry.open("app.db", "/tmp", 2)?;
//! registry.request_lock("app.db", LockId(1), LockKind::Write)?;
//! let ready = rx.try_recv().expect("write slot was free");
//! assert_eq!(ready.lock, LockId(1));
//! registry.dispatch("app.db", LockId(1), |conn| {
//!     conn.execute_batch("CREATE TABLE IF NOT EXISTS kv(k, v)").ok();
//! })?;
//! registry.release("app.db", LockId(1));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;
pub mod events;
pub mod options;
pub mod paths;
pub mod pool;
pub mod registry;
pub mod types;

pub use error::{PoolError, Result};
pub use events::{AvailabilityListener, LockAvailable, TableUpdate, UpdateListener};
pub use options::{ConfigError, PoolOptions, SynchronousMode};
pub use pool::{Pool, PoolBuilder, PoolSnapshot, Work};
pub use registry::{Registry, RemoveOutcome};
pub use types::{HandleMode, LockId, LockKind, SlotIndex};
