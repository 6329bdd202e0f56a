//! Typed notifications emitted by a pool.
//!
//! Two streams exist: [`LockAvailable`] fires every time a slot is activated
//! for a lock id, and [`TableUpdate`] fires for every row-level change made
//! through the write handle. Both are delivered through listener traits so a
//! pool is not tied to one delivery mechanism; the unbounded tokio channel
//! implementation works from synchronous and asynchronous callers alike.

use std::fmt;
use std::sync::Arc;

use rusqlite::hooks::Action;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::types::LockId;

/// A slot became owned by `lock` in the pool named `db`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockAvailable {
    /// Name of the pool.
    pub db: Arc<str>,
    /// The lock id that now owns a slot.
    pub lock: LockId,
}

/// Receives availability notifications.
pub trait AvailabilityListener: Send + Sync {
    /// Called once per activation, after the pool's bookkeeping is updated.
    fn lock_available(&self, event: LockAvailable);
}

impl AvailabilityListener for UnboundedSender<LockAvailable> {
    fn lock_available(&self, event: LockAvailable) {
        if self.send(event).is_err() {
            trace!("events.lock_available.receiver_dropped");
        }
    }
}

/// Adapts a closure into a listener.
pub struct FnListener<F>(pub F);

impl<F> AvailabilityListener for FnListener<F>
where
    F: Fn(LockAvailable) + Send + Sync,
{
    fn lock_available(&self, event: LockAvailable) {
        (self.0)(event)
    }
}

impl<F> UpdateListener for FnListener<F>
where
    F: Fn(TableUpdate) + Send + Sync,
{
    fn table_updated(&self, event: TableUpdate) {
        (self.0)(event)
    }
}

/// Listener that drops every event.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopListener;

impl AvailabilityListener for NoopListener {
    fn lock_available(&self, _event: LockAvailable) {}
}

impl UpdateListener for NoopListener {
    fn table_updated(&self, _event: TableUpdate) {}
}

/// Creates an unbounded availability channel.
pub fn availability_channel() -> (
    UnboundedSender<LockAvailable>,
    UnboundedReceiver<LockAvailable>,
) {
    mpsc::unbounded_channel()
}

/// Kind of row-level change reported by the write handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UpdateOperation {
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
}

impl UpdateOperation {
    pub(crate) fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::SQLITE_INSERT => Some(UpdateOperation::Insert),
            Action::SQLITE_UPDATE => Some(UpdateOperation::Update),
            Action::SQLITE_DELETE => Some(UpdateOperation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateOperation::Insert => "insert",
            UpdateOperation::Update => "update",
            UpdateOperation::Delete => "delete",
        })
    }
}

/// A row changed in a table reachable from the write handle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableUpdate {
    /// Name of the pool whose write handle made the change.
    pub db: Arc<str>,
    /// Kind of change.
    pub operation: UpdateOperation,
    /// Schema the table lives in (`main`, or an attached alias).
    pub database: String,
    /// Table name.
    pub table: String,
    /// Rowid of the changed row.
    pub row_id: i64,
}

/// Receives row-level change notifications from the write handle.
pub trait UpdateListener: Send + Sync {
    /// Called synchronously from the write handle's worker for every change.
    fn table_updated(&self, event: TableUpdate);
}

impl UpdateListener for UnboundedSender<TableUpdate> {
    fn table_updated(&self, event: TableUpdate) {
        if self.send(event).is_err() {
            trace!("events.table_updated.receiver_dropped");
        }
    }
}

/// Creates an unbounded table-update channel.
pub fn update_channel() -> (UnboundedSender<TableUpdate>, UnboundedReceiver<TableUpdate>) {
    mpsc::unbounded_channel()
}
