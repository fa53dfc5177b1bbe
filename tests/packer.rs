//! Packer behavior: batch sealing, compound ids, dedup, moves, cancellation.

mod common;

use tokio_util::sync::CancellationToken;

use common::{email_bytes, envelope, small_config};
use emaildb::block::BlockKind;
use emaildb::db::EmailDb;
use emaildb::error::Error;
use emaildb::BlockIdAllocator;

/// Three 1500-byte emails under a 4096-byte threshold: the third append
/// seals the first batch, so ids come out as (b1,0), (b1,1), (b2,0).
#[tokio::test]
async fn pack_seals_on_threshold_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(4096)).await.unwrap();

    let mut cids = Vec::new();
    let mut bodies = Vec::new();
    for n in 0..3 {
        let bytes = email_bytes(n, 1500);
        bodies.push(bytes.clone());
        let out = db
            .append_email(bytes, envelope(n, "/inbox"), &cancel)
            .await
            .unwrap();
        assert!(!out.was_duplicate);
        cids.push(out.compound_id);
    }
    db.flush(&cancel).await.unwrap();

    let b1 = cids[0].block_id;
    let b2 = cids[2].block_id;
    assert_eq!(cids[1].block_id, b1);
    assert_ne!(b1, b2);
    assert_eq!((cids[0].local_id, cids[1].local_id, cids[2].local_id), (0, 1, 0));

    // Exact bytes back, including the one sealed into the second batch.
    assert_eq!(db.read_email(cids[1]).await.unwrap(), bodies[1]);
    assert_eq!(db.read_email(cids[2]).await.unwrap(), bodies[2]);

    // Exactly two sealed batch blocks on disk.
    let batches = db
        .locations()
        .keys()
        .filter(|&&id| BlockIdAllocator::id_matches_kind(id, BlockKind::EmailBatch))
        .count();
    assert_eq!(batches, 2);
}

#[tokio::test]
async fn duplicate_envelope_returns_existing_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    let bytes = email_bytes(1, 700);
    let first = db
        .append_email(bytes.clone(), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap();

    // Duplicate while still pending.
    let second = db
        .append_email(bytes.clone(), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap();
    assert!(second.was_duplicate);
    assert_eq!(second.compound_id, first.compound_id);

    db.flush(&cancel).await.unwrap();

    // Duplicate after sealing.
    let third = db
        .append_email(bytes, envelope(1, "/inbox"), &cancel)
        .await
        .unwrap();
    assert!(third.was_duplicate);
    assert_eq!(third.compound_id, first.compound_id);

    assert_eq!(
        db.by_message_id("msg-1@example.com").await.unwrap(),
        Some(first.compound_id)
    );
    let batches = db
        .locations()
        .keys()
        .filter(|&&id| BlockIdAllocator::id_matches_kind(id, BlockKind::EmailBatch))
        .count();
    assert_eq!(batches, 1);
}

#[tokio::test]
async fn reused_message_id_with_new_envelope_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    db.append_email(email_bytes(1, 400), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap();

    let mut conflicting = envelope(9, "/inbox");
    conflicting.message_id = "msg-1@example.com".into();
    let err = db
        .append_email(email_bytes(9, 400), conflicting, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateMessageId(id) if id == "msg-1@example.com"));
}

/// Moving an email rewrites envelope blocks and indexes only; the batch
/// bytes on disk are untouched.
#[tokio::test]
async fn move_is_index_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    let cid = db
        .append_email(email_bytes(1, 600), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap()
        .compound_id;
    db.flush(&cancel).await.unwrap();

    let batch_loc = *db.locations().get(&cid.block_id).unwrap();
    let before = {
        let raw = std::fs::read(&path).unwrap();
        raw[batch_loc.offset as usize..(batch_loc.offset + batch_loc.length) as usize].to_vec()
    };

    db.move_email(cid, "/archive", &cancel).await.unwrap();
    // Idempotent.
    db.move_email(cid, "/archive", &cancel).await.unwrap();

    let inbox = db.list_folder("/inbox").await.unwrap();
    assert!(inbox.iter().all(|e| e.message_id != "msg-1@example.com"));
    let archive = db.list_folder("/archive").await.unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].message_id, "msg-1@example.com");
    assert_eq!(archive[0].folder_path, "/archive");

    let after = {
        let raw = std::fs::read(&path).unwrap();
        raw[batch_loc.offset as usize..(batch_loc.offset + batch_loc.length) as usize].to_vec()
    };
    assert_eq!(before, after);

    // The email itself is unchanged and still addressed by the same id.
    assert_eq!(db.read_email(cid).await.unwrap(), email_bytes(1, 600));
}

#[tokio::test]
async fn cancelled_append_rolls_back_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = db
        .append_email(email_bytes(1, 100), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // Nothing published, nothing pending.
    let live = CancellationToken::new();
    db.flush(&live).await.unwrap();
    assert!(db.list_folder("/inbox").await.unwrap().is_empty());
}

#[tokio::test]
async fn compound_ids_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();

    let cid = {
        let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();
        let cid = db
            .append_email(email_bytes(4, 900), envelope(4, "/inbox"), &cancel)
            .await
            .unwrap()
            .compound_id;
        db.flush(&cancel).await.unwrap();
        db.close(&cancel).await.unwrap();
        cid
    };

    let db = EmailDb::open(&path, small_config(1 << 20)).await.unwrap();
    assert_eq!(db.read_email(cid).await.unwrap(), email_bytes(4, 900));
    assert_eq!(db.by_message_id("msg-4@example.com").await.unwrap(), Some(cid));
}
