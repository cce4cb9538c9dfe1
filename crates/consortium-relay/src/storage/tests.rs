//! Storage layer tests for the Consortium relay.

use super::db::RelayDatabase;
use super::models::VersionedWrite;
use super::queries::unix_timestamp_ms;

async fn test_db() -> RelayDatabase {
    RelayDatabase::open_in_memory().await.unwrap()
}

async fn test_account(db: &RelayDatabase) -> String {
    db.upsert_account("aabbccdd").await.unwrap().id
}

// === Account tests ===

#[tokio::test]
async fn upsert_account_creates_once() {
    let db = test_db().await;

    let first = db.upsert_account("cafe01").await.unwrap();
    let second = db.upsert_account("cafe01").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.public_key, "cafe01");
    assert_eq!(first.seq, 0);
}

#[tokio::test]
async fn distinct_keys_get_distinct_accounts() {
    let db = test_db().await;

    let a = db.upsert_account("aa").await.unwrap();
    let b = db.upsert_account("bb").await.unwrap();

    assert_ne!(a.id, b.id);
}

// === Sequencer tests ===

#[tokio::test]
async fn account_seq_is_strictly_increasing() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let mut last = 0;
    for _ in 0..5 {
        let seq = db.allocate_account_seq(&account_id).await.unwrap();
        assert_eq!(seq, last + 1);
        last = seq;
    }
}

#[tokio::test]
async fn concurrent_account_seq_has_no_duplicates_or_gaps() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let db = db.clone();
        let account_id = account_id.clone();
        handles.push(tokio::spawn(async move {
            db.allocate_account_seq(&account_id).await.unwrap()
        }));
    }

    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await.unwrap());
    }
    seqs.sort_unstable();

    assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
}

#[tokio::test]
async fn session_seq_counts_independently_per_session() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let (s1, _) = db
        .create_session(&account_id, "t1", "m1", None, None)
        .await
        .unwrap();
    let (s2, _) = db
        .create_session(&account_id, "t2", "m2", None, None)
        .await
        .unwrap();

    assert_eq!(db.allocate_session_seq(&s1.id).await.unwrap(), 1);
    assert_eq!(db.allocate_session_seq(&s1.id).await.unwrap(), 2);
    assert_eq!(db.allocate_session_seq(&s2.id).await.unwrap(), 1);
}

#[tokio::test]
async fn allocating_for_unknown_account_fails() {
    let db = test_db().await;
    assert!(db.allocate_account_seq("missing").await.is_err());
}

// === Session tests ===

#[tokio::test]
async fn create_session_is_idempotent_on_tag() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let (first, created) = db
        .create_session(&account_id, "tag-1", "meta", None, None)
        .await
        .unwrap();
    assert!(created.is_some());
    assert_eq!(first.metadata_version, 1);
    assert_eq!(first.agent_state_version, 0);

    let (second, created) = db
        .create_session(&account_id, "tag-1", "other-meta", None, None)
        .await
        .unwrap();
    assert!(created.is_none());
    assert_eq!(second.id, first.id);
    assert_eq!(second.metadata, "meta");
}

#[tokio::test]
async fn create_session_with_agent_state_starts_at_version_one() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let (session, _) = db
        .create_session(&account_id, "t", "m", Some("state"), Some("dek"))
        .await
        .unwrap();

    assert_eq!(session.agent_state_version, 1);
    assert_eq!(session.agent_state.as_deref(), Some("state"));
    assert_eq!(session.data_encryption_key.as_deref(), Some("dek"));
}

#[tokio::test]
async fn same_tag_different_accounts_are_distinct_sessions() {
    let db = test_db().await;
    let a = db.upsert_account("aa").await.unwrap().id;
    let b = db.upsert_account("bb").await.unwrap().id;

    let (sa, _) = db.create_session(&a, "tag", "m", None, None).await.unwrap();
    let (sb, _) = db.create_session(&b, "tag", "m", None, None).await.unwrap();

    assert_ne!(sa.id, sb.id);
}

#[tokio::test]
async fn delete_session_cascades_to_messages() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m", None, None)
        .await
        .unwrap();

    db.insert_message(&account_id, &session.id, "c1", None)
        .await
        .unwrap();
    db.insert_message(&account_id, &session.id, "c2", None)
        .await
        .unwrap();

    assert!(db.delete_session(&account_id, &session.id).await.unwrap());
    assert!(db.get_session(&session.id).await.unwrap().is_none());
    assert!(db.list_messages(&session.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_foreign_session_is_refused() {
    let db = test_db().await;
    let owner = db.upsert_account("aa").await.unwrap().id;
    let other = db.upsert_account("bb").await.unwrap().id;
    let (session, _) = db
        .create_session(&owner, "t", "m", None, None)
        .await
        .unwrap();

    assert!(!db.delete_session(&other, &session.id).await.unwrap());
    assert!(db.get_session(&session.id).await.unwrap().is_some());
}

#[tokio::test]
async fn metadata_update_increments_version_by_one() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m0", None, None)
        .await
        .unwrap();

    let outcome = db
        .update_session_metadata(&account_id, &session.id, "m1", 1)
        .await
        .unwrap()
        .unwrap();

    match outcome {
        VersionedWrite::Applied((updated, update_seq)) => {
            assert_eq!(updated.metadata_version, 2);
            assert_eq!(updated.metadata, "m1");
            assert!(update_seq >= 1);
        }
        VersionedWrite::Conflict { .. } => panic!("expected applied write"),
    }
}

#[tokio::test]
async fn stale_metadata_update_reports_current_state() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m0", None, None)
        .await
        .unwrap();

    db.update_session_metadata(&account_id, &session.id, "m1", 1)
        .await
        .unwrap();

    let outcome = db
        .update_session_metadata(&account_id, &session.id, "m2", 1)
        .await
        .unwrap()
        .unwrap();

    match outcome {
        VersionedWrite::Conflict { version, value } => {
            assert_eq!(version, 2);
            assert_eq!(value.as_deref(), Some("m1"));
        }
        VersionedWrite::Applied(_) => panic!("expected conflict"),
    }
}

#[tokio::test]
async fn agent_state_update_follows_same_arbitration() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m", None, None)
        .await
        .unwrap();

    let outcome = db
        .update_session_agent_state(&account_id, &session.id, Some("s1"), 0)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, VersionedWrite::Applied((ref s, _)) if s.agent_state_version == 1));

    let outcome = db
        .update_session_agent_state(&account_id, &session.id, Some("s2"), 0)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        VersionedWrite::Conflict { version: 1, .. }
    ));
}

#[tokio::test]
async fn updating_foreign_session_is_invisible() {
    let db = test_db().await;
    let owner = db.upsert_account("aa").await.unwrap().id;
    let other = db.upsert_account("bb").await.unwrap().id;
    let (session, _) = db
        .create_session(&owner, "t", "m", None, None)
        .await
        .unwrap();

    let outcome = db
        .update_session_metadata(&other, &session.id, "stolen", 1)
        .await
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn session_activity_does_not_reorder_listing() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (older, _) = db
        .create_session(&account_id, "t1", "m", None, None)
        .await
        .unwrap();
    let (newer, _) = db
        .create_session(&account_id, "t2", "m", None, None)
        .await
        .unwrap();

    // Bump the newer session's updated_at strictly past both creates.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    db.update_session_metadata(&account_id, &newer.id, "m2", 1)
        .await
        .unwrap();

    db.set_session_activity(&older.id, true, unix_timestamp_ms())
        .await
        .unwrap();

    let listed = db.list_sessions(&account_id).await.unwrap();
    assert_eq!(listed[0].id, newer.id);
    assert!(listed.iter().any(|s| s.id == older.id && s.active));
}

// === Message tests ===

#[tokio::test]
async fn messages_are_stamped_with_increasing_seq() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m", None, None)
        .await
        .unwrap();

    let (m1, _) = db
        .insert_message(&account_id, &session.id, "c1", None)
        .await
        .unwrap()
        .unwrap();
    let (m2, _) = db
        .insert_message(&account_id, &session.id, "c2", None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(m1.seq, 1);
    assert_eq!(m2.seq, 2);
}

#[tokio::test]
async fn duplicate_local_id_is_dropped() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m", None, None)
        .await
        .unwrap();

    let first = db
        .insert_message(&account_id, &session.id, "c1", Some("L1"))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = db
        .insert_message(&account_id, &session.id, "c1-again", Some("L1"))
        .await
        .unwrap();
    assert!(second.is_none());

    assert_eq!(db.list_messages(&session.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn null_local_ids_never_collide() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    let (session, _) = db
        .create_session(&account_id, "t", "m", None, None)
        .await
        .unwrap();

    db.insert_message(&account_id, &session.id, "c1", None)
        .await
        .unwrap()
        .unwrap();
    db.insert_message(&account_id, &session.id, "c2", None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(db.list_messages(&session.id).await.unwrap().len(), 2);
}

// === Machine tests ===

#[tokio::test]
async fn create_machine_is_idempotent_on_id() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let (first, created) = db
        .create_machine(&account_id, "laptop", "meta", None, None)
        .await
        .unwrap();
    assert!(created.is_some());
    assert_eq!(first.metadata_version, 1);

    let (second, created) = db
        .create_machine(&account_id, "laptop", "other", None, None)
        .await
        .unwrap();
    assert!(created.is_none());
    assert_eq!(second.metadata, "meta");
}

#[tokio::test]
async fn machine_daemon_state_versioning() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    db.create_machine(&account_id, "laptop", "meta", None, None)
        .await
        .unwrap();

    let outcome = db
        .update_machine_daemon_state(&account_id, "laptop", Some("d1"), 0)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        VersionedWrite::Applied((ref m, _)) if m.daemon_state_version == 1
    ));

    let outcome = db
        .update_machine_daemon_state(&account_id, "laptop", Some("d2"), 5)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        VersionedWrite::Conflict { version: 1, .. }
    ));
}

#[tokio::test]
async fn machine_activity_touch() {
    let db = test_db().await;
    let account_id = test_account(&db).await;
    db.create_machine(&account_id, "laptop", "meta", None, None)
        .await
        .unwrap();

    let at = unix_timestamp_ms();
    db.set_machine_activity(&account_id, "laptop", true, at)
        .await
        .unwrap();

    let machine = db
        .get_machine(&account_id, "laptop")
        .await
        .unwrap()
        .unwrap();
    assert!(machine.active);
    assert_eq!(machine.last_active_at, at);
}

// === Pairing tests ===

#[tokio::test]
async fn pairing_request_lifecycle() {
    let db = test_db().await;
    let account_id = test_account(&db).await;

    let request = db.upsert_pairing_request("ephemeral-key").await.unwrap();
    assert!(!request.is_authorized());

    // Polling again returns the same pending row.
    let again = db.upsert_pairing_request("ephemeral-key").await.unwrap();
    assert_eq!(again.id, request.id);

    db.respond_to_pairing_request("ephemeral-key", "wrapped-secret", &account_id)
        .await
        .unwrap();

    let authorized = db
        .get_pairing_request("ephemeral-key")
        .await
        .unwrap()
        .unwrap();
    assert!(authorized.is_authorized());
    assert_eq!(authorized.response.as_deref(), Some("wrapped-secret"));
    assert_eq!(authorized.response_account_id.as_deref(), Some(&account_id[..]));
}

#[tokio::test]
async fn pairing_response_is_write_once() {
    let db = test_db().await;
    let first = db.upsert_account("aa").await.unwrap().id;
    let second = db.upsert_account("bb").await.unwrap().id;

    db.upsert_pairing_request("key").await.unwrap();
    db.respond_to_pairing_request("key", "r1", &first)
        .await
        .unwrap();
    db.respond_to_pairing_request("key", "r2", &second)
        .await
        .unwrap();

    let request = db.get_pairing_request("key").await.unwrap().unwrap();
    assert_eq!(request.response.as_deref(), Some("r1"));
    assert_eq!(request.response_account_id.as_deref(), Some(&first[..]));
}
