//! Version detection, compatibility gating, and the migration driver.

mod common;

use tokio_util::sync::CancellationToken;

use common::{email_bytes, envelope, small_config};
use emaildb::db::EmailDb;
use emaildb::error::{Error, ErrorClass};
use emaildb::version::capability;
use emaildb::{migrate, ChainVerdict, FormatVersion, UpgradePlan};

/// Empty-open scenario: create, write the header, reopen, and everything the
/// header declares comes back verbatim.
#[tokio::test]
async fn header_round_trips_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let cancel = CancellationToken::new();

    let caps = capability::EMAIL_BATCHING
        | capability::ENVELOPE_BLOCKS
        | capability::HASH_CHAIN
        | capability::FULL_TEXT_SEARCH;
    {
        let db = EmailDb::create_with(
            &path,
            small_config(1 << 20),
            FormatVersion::new(2, 0, 0),
            caps,
        )
        .await
        .unwrap();
        db.close(&cancel).await.unwrap();
    }

    let db = EmailDb::open(&path, small_config(1 << 20)).await.unwrap();
    assert_eq!(db.detect_version(), FormatVersion::new(2, 0, 0));
    assert_eq!(db.capabilities(), caps);
    assert_eq!(db.locations().len(), 1);
}

#[tokio::test]
async fn newer_major_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let cancel = CancellationToken::new();
    {
        let db = EmailDb::create_with(
            &path,
            small_config(1 << 20),
            FormatVersion::new(3, 0, 0),
            capability::DEFAULT,
        )
        .await
        .unwrap();
        db.close(&cancel).await.unwrap();
    }

    let err = EmailDb::open(&path, small_config(1 << 20)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Version);
}

#[tokio::test]
async fn older_major_opens_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let cancel = CancellationToken::new();
    {
        let db = EmailDb::create_with(
            &path,
            small_config(1 << 20),
            FormatVersion::new(1, 4, 0),
            capability::DEFAULT,
        )
        .await
        .unwrap();
        db.close(&cancel).await.unwrap();
    }

    let db = EmailDb::open(&path, small_config(1 << 20)).await.unwrap();
    assert_eq!(db.detect_version(), FormatVersion::new(1, 4, 0));
    let err = db
        .append_email(email_bytes(1, 100), envelope(1, "/inbox"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Version);
}

/// Minor upgrade: a superseding header block, same block count, data intact.
#[tokio::test]
async fn in_place_upgrade_rewrites_header_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let cancel = CancellationToken::new();

    let cid = {
        let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();
        let cid = db
            .append_email(email_bytes(2, 500), envelope(2, "/inbox"), &cancel)
            .await
            .unwrap()
            .compound_id;
        db.flush(&cancel).await.unwrap();
        db.close(&cancel).await.unwrap();
        cid
    };

    let outcome = migrate(&path, FormatVersion::new(2, 1, 0), &cancel).await.unwrap();
    assert_eq!(outcome.plan, UpgradePlan::InPlace);
    assert_eq!(outcome.blocks_rewritten, 0);

    let db = EmailDb::open(&path, small_config(1 << 20)).await.unwrap();
    assert_eq!(db.detect_version(), FormatVersion::new(2, 1, 0));
    assert_eq!(db.read_email(cid).await.unwrap(), email_bytes(2, 500));
    assert_eq!(db.verify().await.unwrap(), ChainVerdict::Valid);
}

/// One major up: the block walk preserves ids and payloads.
#[tokio::test]
async fn major_migration_walks_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let cancel = CancellationToken::new();
    {
        let db = EmailDb::create_with(
            &path,
            small_config(1 << 20),
            FormatVersion::new(1, 2, 0),
            capability::DEFAULT,
        )
        .await
        .unwrap();
        db.close(&cancel).await.unwrap();
    }

    let outcome = migrate(&path, FormatVersion::new(2, 0, 0), &cancel).await.unwrap();
    assert_eq!(outcome.plan, UpgradePlan::Migration);

    let db = EmailDb::open(&path, small_config(1 << 20)).await.unwrap();
    assert_eq!(db.detect_version(), FormatVersion::new(2, 0, 0));
    // Writable again after the migration.
    db.append_email(email_bytes(3, 300), envelope(3, "/inbox"), &cancel)
        .await
        .unwrap();
    db.flush(&cancel).await.unwrap();
}

#[tokio::test]
async fn downgrade_and_major_skip_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let cancel = CancellationToken::new();
    {
        let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();
        db.close(&cancel).await.unwrap();
    }

    let err = migrate(&path, FormatVersion::new(1, 0, 0), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Downgrade { .. }));

    let err = migrate(&path, FormatVersion::new(4, 0, 0), &cancel).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Version);
}
