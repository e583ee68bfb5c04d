use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use uuid::Uuid;

use roomdrop_crypto::{MasterSecret, decrypt_stream};
use roomdrop_types::{FileRecord, MessageRecord, RoomId, RoomView};

use crate::accountant::Accountant;
use crate::clock::Clock;
use crate::db::MetaDb;
use crate::error::{PolicyViolation, StoreError};
use crate::locks::RoomLocks;
use crate::policy::{Limits, display_name, escape_markup};
use crate::reaper::Reaper;
use crate::storage::BlobStore;

/// Decrypted file contents plus the name to offer for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub name: String,
    pub data: Vec<u8>,
}

/// Encrypted, quota-bounded, self-expiring room storage.
///
/// Holds no per-room state besides the room locks; every call recomputes
/// what it needs from the metadata store.
pub struct RoomEngine {
    db: Arc<MetaDb>,
    blobs: Arc<BlobStore>,
    secret: MasterSecret,
    limits: Limits,
    clock: Arc<dyn Clock>,
    locks: Arc<RoomLocks>,
    accountant: Accountant,
    reaper: Arc<Reaper>,
}

impl RoomEngine {
    pub fn new(
        db: Arc<MetaDb>,
        blobs: Arc<BlobStore>,
        secret: MasterSecret,
        limits: Limits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(RoomLocks::new());
        let accountant = Accountant::new(db.clone(), limits.max_room_size, limits.retention);
        let reaper = Arc::new(Reaper::new(
            db.clone(),
            blobs.clone(),
            locks.clone(),
            clock.clone(),
            limits.retention,
        ));
        Self { db, blobs, secret, limits, clock, locks, accountant, reaper }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn reaper(&self) -> Arc<Reaper> {
        self.reaper.clone()
    }

    /// Store an in-memory payload.
    pub async fn put(&self, room: &RoomId, filename: &str, data: &[u8]) -> Result<FileRecord, StoreError> {
        let mut reader = data;
        self.put_stream(room, filename, &mut reader, data.len() as u64).await
    }

    /// Store `size` bytes read from `reader`.
    ///
    /// Every policy check runs before any byte is written. If persistence
    /// fails part way, the blob is discarded.
    pub async fn put_stream<R>(
        &self,
        room: &RoomId,
        filename: &str,
        reader: &mut R,
        size: u64,
    ) -> Result<FileRecord, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let name = display_name(filename).trim();
        if name.is_empty() {
            return Err(StoreError::invalid("filename must not be empty"));
        }
        if !self.limits.is_safe_file_type(name) {
            warn!("Rejected upload {:?} to room {}: unsafe type", name, room);
            return Err(PolicyViolation::UnsafeType.into());
        }
        if size > self.limits.max_file_size {
            warn!("Rejected upload {:?} to room {}: {} bytes over per-file cap", name, room, size);
            return Err(PolicyViolation::TooLarge.into());
        }

        let guard = self.locks.lock(room).await;
        let now = self.now();
        if let Err(e) = self.accountant.admit(&guard, size, now) {
            warn!("Rejected upload {:?} to room {}: {}", name, room, e);
            return Err(e);
        }

        let id = new_id();
        let key = self.secret.derive_room_key(room.as_str());
        // One byte past the declared size is enough to detect a lying stream.
        let mut limited = reader.take(size.saturating_add(1));
        let sealed = self.blobs.write_blob(room, &id, &key, &mut limited).await?;
        if sealed.plaintext_len != size {
            self.discard_blob(room, &id).await;
            return Err(StoreError::invalid(format!(
                "payload was {} bytes, declared {}",
                sealed.plaintext_len, size
            )));
        }

        let record = FileRecord {
            id,
            name: name.to_string(),
            size,
            upload_time: now,
        };
        if let Err(e) = self.db.insert_file(room, &record, &sealed.tag) {
            self.discard_blob(room, &record.id).await;
            return Err(e.into());
        }
        drop(guard);

        info!("Stored file {} ({} bytes) in room {}", record.id, record.size, room);
        self.reaper.reap(room).await;
        Ok(record)
    }

    /// Decrypt a live file in full.
    pub async fn get(&self, room: &RoomId, file_id: &str) -> Result<Download, StoreError> {
        validate_file_id(file_id)?;
        let stored = self
            .db
            .get_file(room, file_id)?
            .filter(|f| self.is_live(f.record.upload_time))
            .ok_or(StoreError::NotFound)?;

        let blob = match self.blobs.open_blob(room, file_id).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("File {} in room {} has metadata but no blob", file_id, room);
                return Err(StoreError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let key = self.secret.derive_room_key(room.as_str());
        let mut data = Vec::with_capacity(stored.record.size as usize);
        decrypt_stream(&key, blob, &mut data, stored.record.size, &stored.tag)
            .await
            .map_err(|e| {
                warn!("Failed to decrypt file {} in room {}: {}", file_id, room, e);
                StoreError::from(e)
            })?;

        Ok(Download { name: stored.record.name, data })
    }

    /// Remove a file and its blob. Absent ids are a no-op; returns whether
    /// a record existed.
    pub async fn delete(&self, room: &RoomId, file_id: &str) -> Result<bool, StoreError> {
        validate_file_id(file_id)?;
        let existed = self.db.delete_file(room, file_id)?;
        // Row is gone, so the file is already invisible; a leftover blob is
        // an orphan the reaper will purge.
        if let Err(e) = self.blobs.delete_blob(room, file_id).await {
            warn!("Blob {} in room {} left for reaper: {}", file_id, room, e);
        }
        if existed {
            info!("Deleted file {} in room {}", file_id, room);
        }
        Ok(existed)
    }

    pub async fn post_message(&self, room: &RoomId, text: &str) -> Result<MessageRecord, StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::invalid("message must not be empty"));
        }
        if text.chars().count() > self.limits.max_message_len {
            return Err(StoreError::invalid(format!(
                "message exceeds {} characters",
                self.limits.max_message_len
            )));
        }

        let record = MessageRecord {
            id: new_id(),
            text: escape_markup(text),
            timestamp: self.now(),
        };
        self.db.insert_message(room, &record)?;
        Ok(record)
    }

    /// Live files and messages with current usage.
    pub async fn snapshot(&self, room: &RoomId) -> Result<RoomView, StoreError> {
        let cutoff = self.now() - self.limits.retention;
        let (files, messages) = self.db.room_snapshot(room, cutoff)?;
        let storage_used = files.iter().map(|f| f.size).sum();
        Ok(RoomView {
            files,
            messages,
            storage_used,
            storage_max: self.limits.max_room_size,
        })
    }

    /// Reclaim expired records in one room now.
    pub async fn reap(&self, room: &RoomId) -> usize {
        self.reaper.reap(room).await
    }

    async fn discard_blob(&self, room: &RoomId, id: &str) {
        if let Err(e) = self.blobs.delete_blob(room, id).await {
            warn!("Failed to discard blob {} in room {}; reaper will retry: {}", id, room, e);
        }
    }

    /// Stored timestamps have millisecond precision; records carry the same.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    fn is_live(&self, at: DateTime<Utc>) -> bool {
        self.now() - at <= self.limits.retention
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// File ids are 32 lowercase hex characters. Anything else never reaches
/// the filesystem.
fn validate_file_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::invalid("file id must not be empty"));
    }
    if id.len() != 32 || !id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(StoreError::invalid("malformed file id"));
    }
    Ok(())
}
