use std::sync::Arc;

use crate::pool::handle::Handle;
use crate::types::LockId;

/// A handle together with the lock id currently owning it, if any.
pub(crate) struct Slot {
    handle: Arc<Handle>,
    owner: Option<LockId>,
}

impl Slot {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle: Arc::new(handle),
            owner: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.owner.is_none()
    }

    pub(crate) fn matches(&self, lock: LockId) -> bool {
        self.owner == Some(lock)
    }

    pub(crate) fn owner(&self) -> Option<LockId> {
        self.owner
    }

    pub(crate) fn activate(&mut self, lock: LockId) {
        debug_assert!(self.owner.is_none(), "slot activated while owned");
        self.owner = Some(lock);
    }

    /// Hands the slot straight to `next` without passing through empty.
    pub(crate) fn hand_off(&mut self, next: LockId) {
        debug_assert!(self.owner.is_some(), "hand-off from an empty slot");
        self.owner = Some(next);
    }

    pub(crate) fn clear(&mut self) {
        self.owner = None;
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }
}
