//! Encrypted batches end to end: vault lifecycle, per-block keys, and
//! deterministic nonces.

mod common;

use tokio_util::sync::CancellationToken;

use common::{email_bytes, envelope};
use emaildb::db::EmailDb;
use emaildb::error::Error;
use emaildb::{
    ChainVerdict, CompressionAlgorithm, EmailDbConfig, EncryptionAlgorithm,
};

fn encrypted_config(algorithm: EncryptionAlgorithm) -> EmailDbConfig {
    EmailDbConfig {
        block_size_bytes: 2048,
        compression: CompressionAlgorithm::Zstd,
        encryption: algorithm,
        ..EmailDbConfig::default()
    }
}

const MASTER: [u8; 32] = [0x5A; 32];

#[tokio::test]
async fn encrypted_round_trip_and_reopen() {
    for algorithm in [
        EncryptionAlgorithm::Aes256Gcm,
        EncryptionAlgorithm::ChaCha20Poly1305,
        EncryptionAlgorithm::Aes256CbcHmac,
    ] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.edb");
        let cancel = CancellationToken::new();

        let cids = {
            let db = EmailDb::create(&path, encrypted_config(algorithm)).await.unwrap();
            db.unlock_keys(MASTER).await.unwrap();
            let mut cids = Vec::new();
            for n in 0..4 {
                let out = db
                    .append_email(email_bytes(n, 900), envelope(n, "/inbox"), &cancel)
                    .await
                    .unwrap();
                cids.push(out.compound_id);
            }
            db.flush(&cancel).await.unwrap();
            // Readable while the vault is open.
            assert_eq!(db.read_email(cids[0]).await.unwrap(), email_bytes(0, 900));
            db.close(&cancel).await.unwrap();
            cids
        };

        // The raw file must not contain a known plaintext run.
        let raw = std::fs::read(&path).unwrap();
        let needle = b"Subject: test message number 0";
        assert!(
            !raw.windows(needle.len()).any(|w| w == needle),
            "plaintext leaked for {algorithm:?}"
        );

        let db = EmailDb::open(&path, encrypted_config(algorithm)).await.unwrap();
        // Locked vault: encrypted batches are unreadable.
        assert!(matches!(db.read_email(cids[0]).await, Err(Error::VaultLocked)));

        db.unlock_keys(MASTER).await.unwrap();
        for (n, cid) in cids.iter().enumerate() {
            assert_eq!(db.read_email(*cid).await.unwrap(), email_bytes(n, 900));
        }
        assert_eq!(db.verify().await.unwrap(), ChainVerdict::Valid);
    }
}

#[tokio::test]
async fn wrong_master_key_cannot_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    {
        let db = EmailDb::create(&path, encrypted_config(EncryptionAlgorithm::Aes256Gcm))
            .await
            .unwrap();
        db.unlock_keys(MASTER).await.unwrap();
        db.append_email(email_bytes(1, 500), envelope(1, "/inbox"), &cancel)
            .await
            .unwrap();
        db.flush(&cancel).await.unwrap();
        db.close(&cancel).await.unwrap();
    }

    let db = EmailDb::open(&path, encrypted_config(EncryptionAlgorithm::Aes256Gcm))
        .await
        .unwrap();
    let err = db.unlock_keys([0x00; 32]).await.unwrap_err();
    assert!(matches!(err, Error::Crypto(_)));
    assert!(!db.keys_unlocked());
}

#[tokio::test]
async fn locked_vault_refuses_encrypted_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, encrypted_config(EncryptionAlgorithm::Aes256Gcm))
        .await
        .unwrap();

    db.append_email(email_bytes(1, 500), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap();
    let err = db.flush(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::VaultLocked));
}
