//! Index lookups, full-text search, advanced field search, and the
//! crash-recovery reconcile pass.

mod common;

use tokio_util::sync::CancellationToken;

use common::{email_bytes, envelope, small_config};
use emaildb::db::{sidecar_path, EmailDb, INDEX_SIDECAR_SUFFIX};
use emaildb::store::envelope::{content_hash, envelope_hash};
use emaildb::SearchQuery;

fn email_with_body(n: usize, subject: &str, body: &str) -> (Vec<u8>, emaildb::Envelope) {
    let mut env = envelope(n, "/inbox");
    env.subject = subject.to_string();
    let bytes = format!("Subject: {subject}\r\n\r\n{body}").into_bytes();
    (bytes, env)
}

#[tokio::test]
async fn every_lookup_finds_the_inserted_email() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    let bytes = email_bytes(3, 640);
    let env = envelope(3, "/inbox");
    let cid = db
        .append_email(bytes.clone(), env.clone(), &cancel)
        .await
        .unwrap()
        .compound_id;
    db.flush(&cancel).await.unwrap();

    assert_eq!(db.by_message_id(&env.message_id).await.unwrap(), Some(cid));

    let sealed = emaildb::store::envelope::seal_envelope(env, &bytes);
    assert_eq!(
        db.by_envelope_hash(&envelope_hash(&sealed)).await.unwrap(),
        Some(cid)
    );
    assert_eq!(
        db.by_content_hash(&content_hash(&bytes)).await.unwrap(),
        Some(cid)
    );
}

#[tokio::test]
async fn conjunctive_search_ranks_and_hydrates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    let corpus = [
        ("deployment checklist", "rollout steps for the deployment pipeline"),
        ("lunch menu", "sandwiches again"),
        ("deployment failed", "the deployment pipeline broke overnight"),
        ("pipeline docs", "documentation for the ingestion pipeline"),
    ];
    for (n, (subject, body)) in corpus.iter().enumerate() {
        let (bytes, env) = email_with_body(n, subject, body);
        db.append_email(bytes, env, &cancel).await.unwrap();
    }
    db.flush(&cancel).await.unwrap();

    // Both terms must match (conjunctive): emails 0 and 2 only.
    let hits = db.search("deployment pipeline", 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        let env = hit.envelope.as_ref().expect("hydrated envelope");
        assert!(env.subject.contains("deployment"));
    }

    // Top-K trimming.
    let one = db.search("pipeline", 1).await.unwrap();
    assert_eq!(one.len(), 1);

    // Stopwords and short tokens never match anything.
    assert!(db.search("the", 10).await.unwrap().is_empty());

    // A term absent from the corpus empties the conjunction.
    assert!(db.search("deployment zeppelin", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn advanced_search_intersects_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    for n in 0..4 {
        let (bytes, mut env) = email_with_body(n, &format!("report {n}"), "weekly numbers");
        env.folder_path = if n % 2 == 0 { "/inbox".into() } else { "/reports".into() };
        db.append_email(bytes, env, &cancel).await.unwrap();
    }
    db.flush(&cancel).await.unwrap();

    let q = SearchQuery {
        from: Some("sender2@example.com".into()),
        folder: Some("/inbox".into()),
        date_range: Some((1_700_000_000, 1_700_000_100)),
        ..Default::default()
    };
    let hits = db.advanced_search(&q, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(
        hits[0].envelope.as_ref().unwrap().from,
        "sender2@example.com"
    );

    // Folder filter alone.
    let q = SearchQuery { folder: Some("/reports".into()), ..Default::default() };
    assert_eq!(db.advanced_search(&q, 10).await.unwrap().len(), 2);

    // Date range alone: every indexed email is a candidate, filtered by date.
    let q = SearchQuery {
        date_range: Some((1_700_000_001, 1_700_000_002)),
        ..Default::default()
    };
    let hits = db.advanced_search(&q, 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        let date = hit.envelope.as_ref().unwrap().date;
        assert!((1_700_000_001..=1_700_000_002).contains(&date));
    }
    let q = SearchQuery {
        date_range: Some((1_700_000_000, 1_700_000_100)),
        ..Default::default()
    };
    assert_eq!(db.advanced_search(&q, 10).await.unwrap().len(), 4);

    // Disjoint intersection is empty.
    let q = SearchQuery {
        from: Some("sender2@example.com".into()),
        folder: Some("/reports".into()),
        ..Default::default()
    };
    assert!(db.advanced_search(&q, 10).await.unwrap().is_empty());
}

/// The email mentioning the query term most often ranks first.  Both emails
/// seal into one batch, so the recency boost is identical and only term
/// frequency separates the scores.
#[tokio::test]
async fn term_frequency_orders_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();
    let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();

    let (bytes, env) = email_with_body(
        0,
        "status update",
        "the migration ran, migration checks passed, migration and migration logs archived",
    );
    let heavy = db.append_email(bytes, env, &cancel).await.unwrap().compound_id;

    let (bytes, env) = email_with_body(1, "standup notes", "one migration note in passing");
    let light = db.append_email(bytes, env, &cancel).await.unwrap().compound_id;

    db.flush(&cancel).await.unwrap();

    let hits = db.search("migration", 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].compound_id, heavy);
    assert_eq!(hits[1].compound_id, light);
    assert!(hits[0].score > hits[1].score);
}

/// Destroy the index sidecar entirely; reconcile rebuilds all six indexes
/// from batch + envelope blocks.
#[tokio::test]
async fn reconcile_rebuilds_lost_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.edb");
    let cancel = CancellationToken::new();

    let (cid, message_id) = {
        let db = EmailDb::create(&path, small_config(1 << 20)).await.unwrap();
        let (bytes, env) = email_with_body(5, "quarterly forecast", "growth projections inside");
        let message_id = env.message_id.clone();
        let cid = db.append_email(bytes, env, &cancel).await.unwrap().compound_id;
        db.flush(&cancel).await.unwrap();
        db.close(&cancel).await.unwrap();
        (cid, message_id)
    };

    std::fs::remove_dir_all(sidecar_path(&path, INDEX_SIDECAR_SUFFIX)).unwrap();

    let db = EmailDb::open(&path, small_config(1 << 20)).await.unwrap();
    assert_eq!(db.by_message_id(&message_id).await.unwrap(), None);

    let restored = db.reconcile().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(db.by_message_id(&message_id).await.unwrap(), Some(cid));
    assert_eq!(db.search("quarterly forecast", 10).await.unwrap().len(), 1);
    assert_eq!(db.list_folder("/inbox").await.unwrap().len(), 1);

    // Idempotent.
    db.reconcile().await.unwrap();
    assert_eq!(db.by_message_id(&message_id).await.unwrap(), Some(cid));
}
