//! Integration tests for the room storage engine: round trips, admission,
//! expiry, deletion, reaping and concurrent uploads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use roomdrop_crypto::MasterSecret;
use roomdrop_store::{BlobStore, Limits, ManualClock, MetaDb, PolicyViolation, RoomEngine, StoreError};
use roomdrop_types::{FileRecord, RoomId};

struct Harness {
    _dir: tempfile::TempDir,
    blob_root: PathBuf,
    db: Arc<MetaDb>,
    clock: Arc<ManualClock>,
    engine: Arc<RoomEngine>,
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap()
}

async fn harness(limits: Limits) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let blob_root = dir.path().join("blobs");
    let db = Arc::new(MetaDb::open(&dir.path().join("meta.db")).unwrap());
    let blobs = Arc::new(BlobStore::new(blob_root.clone()).await.unwrap());
    let clock = Arc::new(ManualClock::new(start()));
    let engine = Arc::new(RoomEngine::new(
        db.clone(),
        blobs,
        MasterSecret::new("test-secret"),
        limits,
        clock.clone(),
    ));
    Harness { _dir: dir, blob_root, db, clock, engine }
}

fn small_limits() -> Limits {
    Limits {
        max_file_size: 800,
        max_room_size: 1000,
        ..Limits::default()
    }
}

fn room(code: &str) -> RoomId {
    RoomId::parse(code).unwrap()
}

fn blob_files(root: &Path, room: &RoomId) -> Vec<String> {
    let dir = root.join("rooms").join(room.as_str());
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn hello_txt_scenario() {
    let h = harness(Limits::default()).await;
    let r = room("4242");

    let record = h.engine.put(&r, "hello.txt", b"0123456789").await.unwrap();
    assert_eq!(record.name, "hello.txt");
    assert_eq!(record.size, 10);

    let view = h.engine.snapshot(&r).await.unwrap();
    assert_eq!(view.files.len(), 1);
    assert_eq!(view.files[0].size, 10);
    assert_eq!(view.storage_used, 10);
    assert_eq!(view.storage_max, 1024 * 1024 * 1024);

    let download = h.engine.get(&r, &record.id).await.unwrap();
    assert_eq!(download.data, b"0123456789");
    assert_eq!(download.name, "hello.txt");

    assert!(h.engine.delete(&r, &record.id).await.unwrap());
    let view = h.engine.snapshot(&r).await.unwrap();
    assert!(view.files.is_empty());
    assert_eq!(view.storage_used, 0);
}

#[tokio::test]
async fn round_trip_various_sizes() {
    let h = harness(Limits::default()).await;
    let r = room("0001");

    for len in [0usize, 1, 16, 8191, 8192, 8193, 8208, 100_000] {
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        let record = h.engine.put(&r, "blob.bin", &data).await.unwrap();
        let download = h.engine.get(&r, &record.id).await.unwrap();
        assert_eq!(download.data, data, "len {len}");
    }
}

#[tokio::test]
async fn stored_blob_is_not_plaintext() {
    let h = harness(Limits::default()).await;
    let r = room("0002");
    let secret = b"attack at dawn, attack at dawn!!";
    let record = h.engine.put(&r, "plan.txt", secret).await.unwrap();

    let path = h.blob_root.join("rooms").join("0002").join(format!("{}.dat", record.id));
    let on_disk = std::fs::read(path).unwrap();
    assert_eq!(on_disk.len(), 16 + 48);
    assert!(!on_disk.windows(secret.len()).any(|w| w == secret));
}

#[tokio::test]
async fn admission_is_exact_at_the_boundary() {
    let h = harness(small_limits()).await;
    let r = room("0100");

    h.engine.put(&r, "a.bin", &[1u8; 600]).await.unwrap();
    h.engine.put(&r, "b.bin", &[2u8; 400]).await.unwrap();

    let err = h.engine.put(&r, "c.bin", &[3u8; 1]).await.unwrap_err();
    assert!(matches!(err, StoreError::Rejected(PolicyViolation::RoomFull)));

    assert_eq!(h.engine.snapshot(&r).await.unwrap().storage_used, 1000);
    let files = blob_files(&h.blob_root, &r);
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.ends_with(".dat")));
}

#[tokio::test]
async fn per_file_cap_checked_before_room_cap() {
    let h = harness(small_limits()).await;
    let r = room("0101");
    h.engine.put(&r, "fill.bin", &[0u8; 800]).await.unwrap();

    let err = h.engine.put(&r, "big.bin", &[0u8; 801]).await.unwrap_err();
    assert!(matches!(err, StoreError::Rejected(PolicyViolation::TooLarge)));

    let err = h.engine.put(&r, "mid.bin", &[0u8; 300]).await.unwrap_err();
    assert!(matches!(err, StoreError::Rejected(PolicyViolation::RoomFull)));
}

#[tokio::test]
async fn unsafe_types_are_rejected_without_writes() {
    let h = harness(Limits::default()).await;
    let r = room("0102");

    for name in ["evil.exe", "install.SH", "page.php", "tool.Jar"] {
        let err = h.engine.put(&r, name, b"#!/bin/sh").await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(PolicyViolation::UnsafeType)), "{name}");
    }
    assert!(blob_files(&h.blob_root, &r).is_empty());

    let err = h.engine.put(&r, "  ", b"x").await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput(_)));
}

#[tokio::test]
async fn lying_stream_is_discarded() {
    let h = harness(small_limits()).await;
    let r = room("0103");

    let mut reader: &[u8] = &[9u8; 50];
    let err = h.engine.put_stream(&r, "short.bin", &mut reader, 20).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput(_)));

    let mut reader: &[u8] = &[9u8; 10];
    let err = h.engine.put_stream(&r, "long.bin", &mut reader, 20).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput(_)));

    assert!(blob_files(&h.blob_root, &r).is_empty());
    assert_eq!(h.engine.snapshot(&r).await.unwrap().storage_used, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_never_overflow_the_room() {
    let h = harness(small_limits()).await;
    let r = room("0200");

    let (a, b) = {
        let (e1, e2) = (h.engine.clone(), h.engine.clone());
        let (r1, r2) = (r.clone(), r.clone());
        tokio::join!(
            tokio::spawn(async move { e1.put(&r1, "a.bin", &[1u8; 600]).await }),
            tokio::spawn(async move { e2.put(&r2, "b.bin", &[2u8; 600]).await }),
        )
    };
    let results = [a.unwrap(), b.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    assert!(results.iter().any(|r| matches!(r, Err(StoreError::Rejected(PolicyViolation::RoomFull)))));
    assert_eq!(h.engine.snapshot(&r).await.unwrap().storage_used, 600);
    assert_eq!(blob_files(&h.blob_root, &r).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_that_fit_both_succeed() {
    let h = harness(small_limits()).await;
    let r = room("0201");

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let (engine, r) = (h.engine.clone(), r.clone());
        handles.push(tokio::spawn(async move { engine.put(&r, "part.bin", &[i; 250]).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(h.engine.snapshot(&r).await.unwrap().storage_used, 1000);
}

#[tokio::test]
async fn expiry_hides_records_before_reaping() {
    let h = harness(Limits::default()).await;
    let r = room("0300");

    let file = h.engine.put(&r, "old.txt", b"old").await.unwrap();
    h.engine.post_message(&r, "old message").await.unwrap();

    h.clock.advance(TimeDelta::hours(24) - TimeDelta::seconds(1));
    let view = h.engine.snapshot(&r).await.unwrap();
    assert_eq!(view.files.len(), 1);
    assert_eq!(view.messages.len(), 1);
    assert_eq!(h.engine.get(&r, &file.id).await.unwrap().data, b"old");

    h.clock.advance(TimeDelta::seconds(2));
    let view = h.engine.snapshot(&r).await.unwrap();
    assert!(view.files.is_empty());
    assert!(view.messages.is_empty());
    assert_eq!(view.storage_used, 0);
    assert!(matches!(h.engine.get(&r, &file.id).await, Err(StoreError::NotFound)));

    // Not yet reclaimed on disk.
    assert_eq!(blob_files(&h.blob_root, &r).len(), 1);

    assert_eq!(h.engine.reap(&r).await, 2);
    assert!(blob_files(&h.blob_root, &r).is_empty());
    assert!(h.db.get_file(&r, &file.id).unwrap().is_none());

    assert_eq!(h.engine.reap(&r).await, 0);
}

#[tokio::test]
async fn expired_files_free_capacity() {
    let h = harness(small_limits()).await;
    let r = room("0301");

    h.engine.put(&r, "a.bin", &[0u8; 800]).await.unwrap();
    h.clock.advance(TimeDelta::hours(25));

    // The old file no longer counts, and the upload's own reap reclaims it.
    h.engine.put(&r, "b.bin", &[0u8; 800]).await.unwrap();
    assert_eq!(blob_files(&h.blob_root, &r).len(), 1);
    assert_eq!(h.engine.snapshot(&r).await.unwrap().storage_used, 800);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let h = harness(Limits::default()).await;
    let r = room("0400");

    let absent = "0123456789abcdef0123456789abcdef";
    assert!(!h.engine.delete(&r, absent).await.unwrap());

    let record = h.engine.put(&r, "gone.txt", b"bye").await.unwrap();
    assert!(h.engine.delete(&r, &record.id).await.unwrap());
    assert!(!h.engine.delete(&r, &record.id).await.unwrap());
    assert!(matches!(h.engine.get(&r, &record.id).await, Err(StoreError::NotFound)));
    assert!(blob_files(&h.blob_root, &r).is_empty());

    assert!(matches!(h.engine.delete(&r, "").await, Err(StoreError::InvalidInput(_))));
    assert!(matches!(h.engine.get(&r, "../x").await, Err(StoreError::InvalidInput(_))));
}

#[tokio::test]
async fn files_are_scoped_to_their_room() {
    let h = harness(Limits::default()).await;
    let record = h.engine.put(&room("0500"), "mine.txt", b"private").await.unwrap();
    assert!(matches!(h.engine.get(&room("0501"), &record.id).await, Err(StoreError::NotFound)));
    assert!(!h.engine.delete(&room("0501"), &record.id).await.unwrap());
    assert_eq!(h.engine.snapshot(&room("0501")).await.unwrap().files.len(), 0);
}

#[tokio::test]
async fn wrong_room_key_is_cipher_mismatch() {
    let h = harness(Limits::default()).await;
    let owner = room("1111");
    // One padding byte: the case padding checks alone let through.
    let payload = b"fifteen bytes!!";
    let record = h.engine.put(&owner, "secret.txt", payload).await.unwrap();
    let tag = h.db.get_file(&owner, &record.id).unwrap().unwrap().tag;
    let src = h.blob_root.join("rooms").join("1111").join(format!("{}.dat", record.id));

    // Transplant the blob and its metadata into other rooms.
    for n in 2000..2064u32 {
        let other = room(&n.to_string());
        let moved = FileRecord {
            id: format!("{:032x}", n),
            ..record.clone()
        };
        let dst_dir = h.blob_root.join("rooms").join(other.as_str());
        std::fs::create_dir_all(&dst_dir).unwrap();
        std::fs::copy(&src, dst_dir.join(format!("{}.dat", moved.id))).unwrap();
        h.db.insert_file(&other, &moved, &tag).unwrap();

        let result = h.engine.get(&other, &moved.id).await;
        assert!(matches!(result, Err(StoreError::CipherMismatch)), "room {other}");
    }
    assert_eq!(h.engine.get(&owner, &record.id).await.unwrap().data, payload);
}

#[tokio::test]
async fn reaper_purges_orphans() {
    let h = harness(Limits::default()).await;
    let r = room("0600");
    let kept = h.engine.put(&r, "kept.txt", b"keep me").await.unwrap();

    let dir = h.blob_root.join("rooms").join("0600");
    let stray_blob = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let stale_part = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    std::fs::write(dir.join(format!("{stray_blob}.dat")), [0u8; 32]).unwrap();
    std::fs::write(dir.join(format!("{stale_part}.part")), [0u8; 7]).unwrap();

    let ghost = FileRecord {
        id: "cccccccccccccccccccccccccccccccc".into(),
        name: "ghost.txt".into(),
        size: 4,
        upload_time: start(),
    };
    h.db.insert_file(&r, &ghost, &[0; 32]).unwrap();

    // Orphans are not expired records.
    assert_eq!(h.engine.reap(&r).await, 0);

    assert_eq!(blob_files(&h.blob_root, &r), vec![format!("{}.dat", kept.id)]);
    assert!(h.db.get_file(&r, &ghost.id).unwrap().is_none());
    assert_eq!(h.engine.get(&r, &kept.id).await.unwrap().data, b"keep me");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_delete_and_reap_count_each_file_once() {
    let h = harness(Limits::default()).await;
    let r = room("0650");

    for _ in 0..32 {
        let record = h.engine.put(&r, "race.txt", b"race").await.unwrap();
        h.clock.advance(TimeDelta::hours(25));

        let (reaper, deleter) = (h.engine.clone(), h.engine.clone());
        let (r1, r2, id) = (r.clone(), r.clone(), record.id.clone());
        let (reaped, deleted) = tokio::join!(
            tokio::spawn(async move { reaper.reap(&r1).await }),
            tokio::spawn(async move { deleter.delete(&r2, &id).await }),
        );
        let deleted = deleted.unwrap().unwrap();
        assert_eq!(reaped.unwrap() + usize::from(deleted), 1);
        assert!(h.db.get_file(&r, &record.id).unwrap().is_none());
    }
}

#[tokio::test]
async fn reap_all_sweeps_every_room() {
    let h = harness(Limits::default()).await;
    h.engine.put(&room("0700"), "a.txt", b"a").await.unwrap();
    h.engine.post_message(&room("0701"), "hello").await.unwrap();

    h.clock.advance(TimeDelta::hours(48));
    assert_eq!(h.engine.reaper().reap_all().await, 2);
    assert!(blob_files(&h.blob_root, &room("0700")).is_empty());
}

#[tokio::test]
async fn messages_are_validated_and_escaped() {
    let h = harness(Limits::default()).await;
    let r = room("0800");

    assert!(matches!(h.engine.post_message(&r, "").await, Err(StoreError::InvalidInput(_))));
    assert!(matches!(h.engine.post_message(&r, " \n\t").await, Err(StoreError::InvalidInput(_))));

    let too_long = "é".repeat(10_001);
    assert!(matches!(h.engine.post_message(&r, &too_long).await, Err(StoreError::InvalidInput(_))));
    let max = "é".repeat(10_000);
    h.engine.post_message(&r, &max).await.unwrap();

    let msg = h.engine.post_message(&r, "<script>alert('x')</script>").await.unwrap();
    assert_eq!(msg.text, "&lt;script&gt;alert(&#039;x&#039;)&lt;/script&gt;");

    let view = h.engine.snapshot(&r).await.unwrap();
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.messages[1], msg);
}

#[tokio::test]
async fn messages_sorted_by_time() {
    let h = harness(Limits::default()).await;
    let r = room("0801");

    let first = h.engine.post_message(&r, "first").await.unwrap();
    let second = h.engine.post_message(&r, "second").await.unwrap();
    h.clock.advance(TimeDelta::seconds(5));
    let third = h.engine.post_message(&r, "third").await.unwrap();

    let ids: Vec<_> = h.engine.snapshot(&r).await.unwrap().messages.into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![first.id, second.id, third.id]);
}
