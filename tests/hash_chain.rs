//! Hash-chain integrity: linkage across batches, tamper detection, and
//! existence proofs.

mod common;

use tokio_util::sync::CancellationToken;

use common::{email_bytes, envelope, small_config};
use emaildb::db::EmailDb;
use emaildb::error::Error;
use emaildb::{verify_proof, ChainVerdict};

#[tokio::test]
async fn chain_is_valid_over_many_batches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    // Small threshold: every email seals its own batch.
    let db = EmailDb::create(&path, small_config(600)).await.unwrap();

    for n in 0..5 {
        db.append_email(email_bytes(n, 500), envelope(n, "/inbox"), &cancel)
            .await
            .unwrap();
    }
    db.flush(&cancel).await.unwrap();

    assert_eq!(db.chain_len().await, 5);
    assert_eq!(db.verify().await.unwrap(), ChainVerdict::Valid);
}

/// Flip one byte inside the second batch's payload: reads of that batch
/// surface an integrity error and verification names the block.
#[tokio::test]
async fn tampered_batch_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();

    let cids = {
        let db = EmailDb::create(&path, small_config(4096)).await.unwrap();
        let mut cids = Vec::new();
        for n in 0..10 {
            let out = db
                .append_email(email_bytes(n, 1000), envelope(n, "/inbox"), &cancel)
                .await
                .unwrap();
            cids.push(out.compound_id);
        }
        db.flush(&cancel).await.unwrap();
        db.close(&cancel).await.unwrap();
        cids
    };

    // Batches sealed at ~3 emails each; pick the second one.
    let batch2 = cids
        .iter()
        .map(|c| c.block_id)
        .find(|&b| b != cids[0].block_id)
        .unwrap();
    let victim = *cids.iter().find(|c| c.block_id == batch2).unwrap();

    {
        let db = EmailDb::open(&path, small_config(4096)).await.unwrap();
        let loc = *db.locations().get(&batch2).unwrap();
        db.close(&cancel).await.unwrap();

        // Flip a byte well inside the payload region.
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let target = loc.offset + 41 + 40;
        f.seek(SeekFrom::Start(target)).unwrap();
        let mut byte = [0u8; 1];
        f.read_exact(&mut byte).unwrap();
        f.seek(SeekFrom::Start(target)).unwrap();
        f.write_all(&[byte[0] ^ 0x01]).unwrap();
    }

    let db = EmailDb::open(&path, small_config(4096)).await.unwrap();
    let err = db.read_email(victim).await.unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { region: "payload", .. }));

    match db.verify().await.unwrap() {
        ChainVerdict::InvalidAt { block_id, reason } => {
            assert_eq!(block_id, batch2);
            assert_eq!(reason, "block hash mismatch");
        }
        ChainVerdict::Valid => panic!("tampering went undetected"),
    }

    // Untouched batches still read fine.
    let other = cids.iter().find(|c| c.block_id != batch2).unwrap();
    assert!(db.read_email(*other).await.is_ok());
}

#[tokio::test]
async fn existence_proofs_verify_for_every_email() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(2500)).await.unwrap();

    let mut cids = Vec::new();
    for n in 0..6 {
        let out = db
            .append_email(email_bytes(n, 800), envelope(n, "/inbox"), &cancel)
            .await
            .unwrap();
        cids.push(out.compound_id);
    }
    db.flush(&cancel).await.unwrap();

    for cid in &cids {
        let bytes = db.read_email(*cid).await.unwrap();
        let proof = db.existence_proof(*cid).await.unwrap();
        assert!(verify_proof(&proof, &bytes));
        // The proof binds the exact bytes: any other content fails.
        assert!(!verify_proof(&proof, b"not the email"));
    }

    // A proof for one email never validates another's bytes.
    let p0 = db.existence_proof(cids[0]).await.unwrap();
    let b1 = db.read_email(cids[1]).await.unwrap();
    assert!(!verify_proof(&p0, &b1));
}

#[tokio::test]
async fn chain_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    {
        let db = EmailDb::create(&path, small_config(600)).await.unwrap();
        for n in 0..3 {
            db.append_email(email_bytes(n, 500), envelope(n, "/inbox"), &cancel)
                .await
                .unwrap();
        }
        db.flush(&cancel).await.unwrap();
        db.close(&cancel).await.unwrap();
    }

    let db = EmailDb::open(&path, small_config(600)).await.unwrap();
    assert_eq!(db.chain_len().await, 3);
    assert_eq!(db.verify().await.unwrap(), ChainVerdict::Valid);

    // New batches keep extending the same chain.
    db.append_email(email_bytes(7, 500), envelope(7, "/inbox"), &cancel)
        .await
        .unwrap();
    db.flush(&cancel).await.unwrap();
    assert_eq!(db.chain_len().await, 4);
    assert_eq!(db.verify().await.unwrap(), ChainVerdict::Valid);
}
