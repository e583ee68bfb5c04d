use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, TimeDelta};
use tracing::{info, warn};

use roomdrop_types::RoomId;

use crate::clock::Clock;
use crate::db::MetaDb;
use crate::locks::{RoomGuard, RoomLocks};
use crate::storage::{BlobEntry, BlobStore};

/// Deletes records past the retention window, and their blobs.
///
/// Every failure is logged and skipped; whatever is left behind is picked
/// up by the next sweep.
pub struct Reaper {
    db: Arc<MetaDb>,
    blobs: Arc<BlobStore>,
    locks: Arc<RoomLocks>,
    clock: Arc<dyn Clock>,
    retention: TimeDelta,
}

impl Reaper {
    pub fn new(
        db: Arc<MetaDb>,
        blobs: Arc<BlobStore>,
        locks: Arc<RoomLocks>,
        clock: Arc<dyn Clock>,
        retention: TimeDelta,
    ) -> Self {
        Self { db, blobs, locks, clock, retention }
    }

    /// Sweep one room. Returns the number of expired records removed.
    pub async fn reap(&self, room: &RoomId) -> usize {
        let guard = self.locks.lock(room).await;
        let cutoff = self.clock.now().trunc_subsecs(3) - self.retention;
        let mut removed = 0;

        match self.db.expired_file_ids(room, cutoff) {
            Ok(ids) => {
                for id in ids {
                    // Blob first: if it cannot be removed the row stays and
                    // the pair is retried together next sweep.
                    if let Err(e) = self.blobs.delete_blob(room, &id).await {
                        warn!("Reaper: failed to delete blob {} in room {}: {}", id, room, e);
                        continue;
                    }
                    match self.db.delete_file(room, &id) {
                        Ok(true) => removed += 1,
                        // Deleted by a concurrent `delete` after it was listed.
                        Ok(false) => {}
                        Err(e) => warn!("Reaper: failed to delete file row {} in room {}: {}", id, room, e),
                    }
                }
            }
            Err(e) => warn!("Reaper: failed to list expired files in room {}: {}", room, e),
        }

        match self.db.delete_expired_messages(room, cutoff) {
            Ok(n) => removed += n,
            Err(e) => warn!("Reaper: failed to delete expired messages in room {}: {}", room, e),
        }

        self.purge_orphans(&guard).await;

        if removed > 0 {
            info!("Reaper: removed {} expired records in room {}", removed, room);
        }
        removed
    }

    /// Sweep every room known to the metadata store or present on disk.
    pub async fn reap_all(&self) -> usize {
        let mut rooms: HashSet<String> = HashSet::new();
        match self.db.rooms() {
            Ok(r) => rooms.extend(r),
            Err(e) => warn!("Reaper: failed to list rooms from metadata: {}", e),
        }
        match self.blobs.rooms().await {
            Ok(r) => rooms.extend(r),
            Err(e) => warn!("Reaper: failed to list room directories: {}", e),
        }

        let mut total = 0;
        for code in rooms {
            match RoomId::parse(&code) {
                Ok(room) => total += self.reap(&room).await,
                Err(_) => warn!("Reaper: skipping unexpected room entry {:?}", code),
            }
        }
        total
    }

    /// Remove half-written pairs: stale `.part` files, blobs without a row,
    /// and rows whose blob is gone. Needs the room guard so no upload is in
    /// flight between its rename and its insert.
    async fn purge_orphans(&self, guard: &RoomGuard) {
        let room = guard.room();

        let blobs = match self.blobs.list_blobs(room).await {
            Ok(b) => b,
            Err(e) => {
                warn!("Reaper: failed to list blobs in room {}: {}", room, e);
                return;
            }
        };
        // Listed after the blobs: a concurrent delete drops its row before its
        // blob, so a row seen here always had its blob visible above.
        let rows = match self.db.file_ids(room) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Reaper: failed to list file rows in room {}: {}", room, e);
                return;
            }
        };

        let mut on_disk = HashSet::new();
        for blob in blobs {
            match blob {
                BlobEntry::Partial(id) => {
                    warn!("Reaper: purging stale partial blob {} in room {}", id, room);
                    if let Err(e) = self.blobs.delete_partial(room, &id).await {
                        warn!("Reaper: failed to purge partial blob {}: {}", id, e);
                    }
                }
                BlobEntry::Complete(id) if !rows.contains(&id) => {
                    warn!("Reaper: purging blob {} without metadata in room {}", id, room);
                    if let Err(e) = self.blobs.delete_blob(room, &id).await {
                        warn!("Reaper: failed to purge orphan blob {}: {}", id, e);
                    }
                }
                BlobEntry::Complete(id) => {
                    on_disk.insert(id);
                }
            }
        }

        for id in rows.difference(&on_disk) {
            warn!("Reaper: purging metadata {} without blob in room {}", id, room);
            if let Err(e) = self.db.delete_file(room, id) {
                warn!("Reaper: failed to purge file row {}: {}", id, e);
            }
        }
    }
}

/// Background task that sweeps all rooms on an interval.
pub async fn run_reaper_loop(reaper: Arc<Reaper>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let count = reaper.reap_all().await;
        if count > 0 {
            info!("Cleanup: reaped {} expired records", count);
        }
    }
}
