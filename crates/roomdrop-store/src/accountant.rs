use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::db::MetaDb;
use crate::error::{PolicyViolation, StoreError};
use crate::locks::RoomGuard;

/// Per-room capacity check.
///
/// Usage is recomputed from metadata on every call, never cached, so
/// deletions and expiries are reflected immediately.
pub struct Accountant {
    db: Arc<MetaDb>,
    max_room_size: u64,
    retention: TimeDelta,
}

impl Accountant {
    pub fn new(db: Arc<MetaDb>, max_room_size: u64, retention: TimeDelta) -> Self {
        Self { db, max_room_size, retention }
    }

    /// Bytes used by live files in the guarded room.
    pub fn used(&self, guard: &RoomGuard, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.db.live_usage(guard.room(), now - self.retention)?)
    }

    /// Admit `incoming` bytes if the room stays within its cap.
    ///
    /// Requires the room guard: the check and the write it admits must not
    /// interleave with another upload to the same room.
    pub fn admit(&self, guard: &RoomGuard, incoming: u64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let used = self.used(guard, now)?;
        let fits = used
            .checked_add(incoming)
            .is_some_and(|total| total <= self.max_room_size);
        debug!(
            "Admit check room {}: used {} + incoming {} vs max {} -> {}",
            guard.room(),
            used,
            incoming,
            self.max_room_size,
            fits
        );
        if fits {
            Ok(())
        } else {
            Err(PolicyViolation::RoomFull.into())
        }
    }
}
