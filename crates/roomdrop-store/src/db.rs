use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use roomdrop_types::{FileRecord, MessageRecord, RoomId};

const READER_POOL_SIZE: usize = 4;

/// A file row together with the tag of its blob.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub record: FileRecord,
    pub tag: Vec<u8>,
}

/// Room metadata database with reader/writer split.
///
/// One row per file and one row per message, each addressable by id, so a
/// single record can be deleted or expired without touching its siblings.
pub struct MetaDb {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
}

impl MetaDb {
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "synchronous", "FULL")?;

        run_migrations(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Metadata DB opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|e| anyhow!("Reader lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.writer
            .lock()
            .map_err(|e| anyhow!("Writer lock poisoned: {}", e))?;
        f(&conn)
    }

    // -- Files --

    pub fn insert_file(&self, room: &RoomId, file: &FileRecord, tag: &[u8]) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO files (id, room_id, name, size, uploaded_at, tag) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    &file.id,
                    room.as_str(),
                    &file.name,
                    file.size as i64,
                    file.upload_time.timestamp_millis(),
                    tag,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, room: &RoomId, id: &str) -> Result<Option<StoredFile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, size, uploaded_at, tag FROM files WHERE room_id = ?1 AND id = ?2",
                [room.as_str(), id],
                stored_file_from_row,
            )
            .optional()?
            .transpose()
        })
    }

    /// Returns whether a row was removed.
    pub fn delete_file(&self, room: &RoomId, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM files WHERE room_id = ?1 AND id = ?2",
                [room.as_str(), id],
            )?;
            Ok(n > 0)
        })
    }

    /// Sum of sizes of files uploaded at or after `cutoff`.
    ///
    /// Reads through the writer connection so the caller sees its own
    /// just-committed inserts.
    pub fn live_usage(&self, room: &RoomId, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn_mut(|conn| {
            let used: i64 = conn.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM files WHERE room_id = ?1 AND uploaded_at >= ?2",
                rusqlite::params![room.as_str(), cutoff.timestamp_millis()],
                |r| r.get(0),
            )?;
            Ok(used as u64)
        })
    }

    /// Ids of files uploaded strictly before `cutoff`.
    pub fn expired_file_ids(&self, room: &RoomId, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM files WHERE room_id = ?1 AND uploaded_at < ?2",
            )?;
            let ids = stmt
                .query_map(
                    rusqlite::params![room.as_str(), cutoff.timestamp_millis()],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn file_ids(&self, room: &RoomId) -> Result<HashSet<String>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM files WHERE room_id = ?1")?;
            let ids = stmt
                .query_map([room.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, room: &RoomId, message: &MessageRecord) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room_id, text, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    &message.id,
                    room.as_str(),
                    &message.text,
                    message.timestamp.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    /// Delete messages created strictly before `cutoff`. Returns rows removed.
    pub fn delete_expired_messages(&self, room: &RoomId, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM messages WHERE room_id = ?1 AND created_at < ?2",
                rusqlite::params![room.as_str(), cutoff.timestamp_millis()],
            )?;
            Ok(n)
        })
    }

    // -- Rooms --

    /// Live files and messages of one room, read in a single transaction.
    ///
    /// Files come back in upload order; messages by timestamp, ties broken by
    /// insertion order.
    pub fn room_snapshot(
        &self,
        room: &RoomId,
        cutoff: DateTime<Utc>,
    ) -> Result<(Vec<FileRecord>, Vec<MessageRecord>)> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let cutoff = cutoff.timestamp_millis();

            let files = {
                let mut stmt = tx.prepare(
                    "SELECT id, name, size, uploaded_at FROM files
                     WHERE room_id = ?1 AND uploaded_at >= ?2
                     ORDER BY uploaded_at, id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![room.as_str(), cutoff], file_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().collect::<Result<Vec<_>>>()?
            };

            let messages = {
                let mut stmt = tx.prepare(
                    "SELECT id, text, created_at FROM messages
                     WHERE room_id = ?1 AND created_at >= ?2
                     ORDER BY created_at, seq",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![room.as_str(), cutoff], message_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().collect::<Result<Vec<_>>>()?
            };

            tx.commit()?;
            Ok((files, messages))
        })
    }

    /// Every room code that has at least one row.
    pub fn rooms(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id FROM files UNION SELECT room_id FROM messages",
            )?;
            let rooms = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rooms)
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("Timestamp out of range: {}", ms))
}

// Row mappers return a nested Result so a corrupt timestamp surfaces as an
// anyhow error instead of being forced into a rusqlite one.
fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FileRecord>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let size: i64 = row.get(2)?;
    let uploaded_at: i64 = row.get(3)?;
    Ok(from_millis(uploaded_at).map(|upload_time| FileRecord {
        id,
        name,
        size: size as u64,
        upload_time,
    }))
}

fn stored_file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StoredFile>> {
    let tag: Vec<u8> = row.get(4)?;
    Ok(file_from_row(row)?.map(|record| StoredFile { record, tag }))
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MessageRecord>> {
    let id: String = row.get(0)?;
    let text: String = row.get(1)?;
    let created_at: i64 = row.get(2)?;
    Ok(from_millis(created_at).map(|timestamp| MessageRecord { id, text, timestamp }))
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Metadata DB: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE files (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL,
                name        TEXT NOT NULL,
                size        INTEGER NOT NULL,
                uploaded_at INTEGER NOT NULL,
                tag         BLOB NOT NULL
            );

            CREATE INDEX idx_files_room ON files(room_id, uploaded_at);

            CREATE TABLE messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                room_id     TEXT NOT NULL,
                text        TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX idx_messages_room ON messages(room_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            "
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn open() -> (tempfile::TempDir, MetaDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = MetaDb::open(&dir.path().join("meta.db")).unwrap();
        (dir, db)
    }

    fn file(id: &str, size: u64, at: DateTime<Utc>) -> FileRecord {
        FileRecord { id: id.into(), name: format!("{id}.txt"), size, upload_time: at }
    }

    #[test]
    fn usage_counts_only_live_files() {
        let (_dir, db) = open();
        let room = RoomId::parse("0001").unwrap();
        let now = Utc::now();
        db.insert_file(&room, &file("a", 10, now), &[1; 32]).unwrap();
        db.insert_file(&room, &file("b", 20, now - TimeDelta::hours(30)), &[2; 32]).unwrap();

        let cutoff = now - TimeDelta::hours(24);
        assert_eq!(db.live_usage(&room, cutoff).unwrap(), 10);
        assert_eq!(db.expired_file_ids(&room, cutoff).unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn rooms_are_disjoint() {
        let (_dir, db) = open();
        let a = RoomId::parse("1000").unwrap();
        let b = RoomId::parse("2000").unwrap();
        let now = Utc::now();
        db.insert_file(&a, &file("x", 5, now), &[3; 32]).unwrap();

        assert!(db.get_file(&b, "x").unwrap().is_none());
        assert!(!db.delete_file(&b, "x").unwrap());
        let stored = db.get_file(&a, "x").unwrap().unwrap();
        assert_eq!(stored.record.size, 5);
        assert_eq!(stored.tag, vec![3u8; 32]);
        assert_eq!(db.live_usage(&b, now - TimeDelta::hours(1)).unwrap(), 0);
    }

    #[test]
    fn snapshot_orders_messages_by_time_then_insertion() {
        let (_dir, db) = open();
        let room = RoomId::parse("0042").unwrap();
        let t = Utc::now();
        for (id, at) in [("late", t + TimeDelta::seconds(1)), ("first", t), ("second", t)] {
            db.insert_message(&room, &MessageRecord { id: id.into(), text: id.into(), timestamp: at })
                .unwrap();
        }

        let (_, messages) = db.room_snapshot(&room, t - TimeDelta::hours(1)).unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["first", "second", "late"]);
        assert_eq!(db.rooms().unwrap(), vec!["0042".to_string()]);
    }
}
