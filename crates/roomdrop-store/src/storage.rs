use anyhow::Result;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use roomdrop_crypto::{RoomKey, Sealed, encrypt_stream};
use roomdrop_types::RoomId;

const BLOB_EXT: &str = "dat";
const PART_EXT: &str = "part";

/// A blob file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobEntry {
    /// Committed ciphertext, `{id}.dat`.
    Complete(String),
    /// Never renamed into place, `{id}.part`.
    Partial(String),
}

/// Manages on-disk ciphertext blobs.
///
/// Each file is stored at `{dir}/rooms/{room}/{id}.dat`. Writes go to
/// `{id}.part` first and are renamed into place only once fully synced.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(dir.join("rooms")).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn room_dir(&self, room: &RoomId) -> PathBuf {
        self.dir.join("rooms").join(room.as_str())
    }

    pub fn blob_path(&self, room: &RoomId, id: &str) -> PathBuf {
        self.room_dir(room).join(format!("{}.{}", id, BLOB_EXT))
    }

    fn part_path(&self, room: &RoomId, id: &str) -> PathBuf {
        self.room_dir(room).join(format!("{}.{}", id, PART_EXT))
    }

    /// Encrypt `reader` into a new blob. Returns the plaintext length and the
    /// blob's tag.
    ///
    /// On any failure the partial file is removed and no `.dat` exists.
    pub async fn write_blob<R>(&self, room: &RoomId, id: &str, key: &RoomKey, reader: &mut R) -> Result<Sealed>
    where
        R: AsyncRead + Unpin,
    {
        fs::create_dir_all(self.room_dir(room)).await?;
        let part = self.part_path(room, id);

        let result: Result<Sealed> = async {
            let file = fs::File::create(&part).await?;
            let mut writer = BufWriter::new(file);
            let sealed = encrypt_stream(key, reader, &mut writer).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            fs::rename(&part, self.blob_path(room, id)).await?;
            Ok(sealed)
        }
        .await;

        if let Err(e) = &result {
            warn!("Discarding partial blob {} in room {}: {}", id, room, e);
            if let Err(rm) = fs::remove_file(&part).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial blob {}: {}", part.display(), rm);
                }
            }
        }
        result
    }

    pub async fn open_blob(&self, room: &RoomId, id: &str) -> std::io::Result<fs::File> {
        fs::File::open(self.blob_path(room, id)).await
    }

    /// Delete a blob. Already gone counts as success.
    pub async fn delete_blob(&self, room: &RoomId, id: &str) -> Result<()> {
        remove_if_present(self.blob_path(room, id)).await?;
        debug!("Deleted blob {} in room {}", id, room);
        Ok(())
    }

    pub async fn delete_partial(&self, room: &RoomId, id: &str) -> Result<()> {
        remove_if_present(self.part_path(room, id)).await
    }

    /// List blob files of one room. Unrecognised files are skipped.
    pub async fn list_blobs(&self, room: &RoomId) -> Result<Vec<BlobEntry>> {
        let mut entries = match fs::read_dir(self.room_dir(room)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match name.rsplit_once('.') {
                Some((id, BLOB_EXT)) => blobs.push(BlobEntry::Complete(id.to_string())),
                Some((id, PART_EXT)) => blobs.push(BlobEntry::Partial(id.to_string())),
                _ => {}
            }
        }
        Ok(blobs)
    }

    /// Room codes that have a directory on disk.
    pub async fn rooms(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(self.dir.join("rooms")).await?;
        let mut rooms = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    rooms.push(name.to_string());
                }
            }
        }
        Ok(rooms)
    }
}

async fn remove_if_present(path: PathBuf) -> Result<()> {
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdrop_crypto::derive_key;

    #[tokio::test]
    async fn write_then_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf()).await.unwrap();
        let room = RoomId::parse("1234").unwrap();
        let key = derive_key(b"k", room.as_str());

        let mut payload: &[u8] = b"0123456789";
        let sealed = store.write_blob(&room, "abc", &key, &mut payload).await.unwrap();
        assert_eq!(sealed.plaintext_len, 10);
        assert_eq!(store.list_blobs(&room).await.unwrap(), vec![BlobEntry::Complete("abc".into())]);
        assert_eq!(store.rooms().await.unwrap(), vec!["1234".to_string()]);

        store.delete_blob(&room, "abc").await.unwrap();
        store.delete_blob(&room, "abc").await.unwrap();
        assert!(store.list_blobs(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_room_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf()).await.unwrap();
        let room = RoomId::parse("9999").unwrap();
        assert!(store.list_blobs(&room).await.unwrap().is_empty());
    }
}
