//! Domain identifiers (strongly-typed IDs).
//!
//! Every id is a ULID wrapped in a generic `Id<T>`, where `T` is a zero-sized
//! marker type. ULIDs sort by creation time and can be generated without
//! coordination; the marker keeps a `SessionId` from being passed where a
//! `BatchId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for id kinds. Provides the prefix used by `Display`.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` only exists at compile time (`PhantomData`), so every id is exactly
/// 16 bytes.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the system clock. Prefer an `IdGenerator` where a clock is
    /// already wired in.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for workflow sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn prefix() -> &'static str {
        "session-"
    }
}

/// Marker for orchestrated batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Batch {}

impl IdMarker for Batch {
    fn prefix() -> &'static str {
        "batch-"
    }
}

/// Identifier of a sequential workflow session.
pub type SessionId = Id<Session>;

/// Identifier of one parallel orchestrator run (used to tag cache writes).
pub type BatchId = Id<Batch>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let session = SessionId::from_ulid(Ulid::new());
        let batch = BatchId::from_ulid(Ulid::new());

        assert!(session.to_string().starts_with("session-"));
        assert!(batch.to_string().starts_with("batch-"));

        // let _: SessionId = batch; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = SessionId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = SessionId::generate();

        assert!(id1 < id2);
    }

    #[test]
    fn ids_survive_json() {
        let id = BatchId::generate();
        let s = serde_json::to_string(&id).unwrap();
        let back: BatchId = serde_json::from_str(&s).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn phantom_marker_is_free() {
        assert_eq!(std::mem::size_of::<SessionId>(), std::mem::size_of::<Ulid>());
        assert_eq!(std::mem::size_of::<BatchId>(), 16);
    }
}
