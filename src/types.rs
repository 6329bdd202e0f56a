//! Identifier and mode types shared by the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen token identifying one pending or active lock claim.
///
/// The pool never generates these; callers must not reuse an id while it is
/// still queued or owning a slot.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LockId {
    fn from(value: u64) -> Self {
        LockId(value)
    }
}

impl From<LockId> for u64 {
    fn from(value: LockId) -> Self {
        value.0
    }
}

/// Kind of lock a caller asks for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// One of the read-only handles.
    Read,
    /// The single read-write handle.
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        })
    }
}

/// Open mode of a handle, fixed at creation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum HandleMode {
    /// Read-write, creating the database file if missing.
    ReadWrite,
    /// Read-only.
    ReadOnly,
}

/// Position of a slot inside a pool: the write slot, or a read slot by index.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SlotIndex {
    /// The write slot.
    Write,
    /// The read slot at the given index.
    Read(usize),
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotIndex::Write => f.write_str("write"),
            SlotIndex::Read(idx) => write!(f, "read[{idx}]"),
        }
    }
}
