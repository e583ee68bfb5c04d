use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use roomdrop_types::RoomId;

/// One async mutex per room. The room code space is 10,000 entries, so the
/// map is never pruned.
#[derive(Default)]
pub struct RoomLocks {
    locks: DashMap<RoomId, Arc<Mutex<()>>>,
}

/// Proof that the holder has exclusive access to one room's
/// admit-then-write sequence and its reaper sweep.
pub struct RoomGuard {
    room: RoomId,
    _guard: OwnedMutexGuard<()>,
}

impl RoomGuard {
    pub fn room(&self) -> &RoomId {
        &self.room
    }
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, room: &RoomId) -> RoomGuard {
        let mutex = self.locks.entry(room.clone()).or_default().clone();
        RoomGuard {
            room: room.clone(),
            _guard: mutex.lock_owned().await,
        }
    }
}
