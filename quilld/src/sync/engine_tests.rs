use std::sync::Arc;
use std::time::Duration;

use quill_core::parse_timestamp_ms;
use sqlx::SqlitePool;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;

async fn make_store() -> RecordStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = RecordStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn make_engine(server: &MockServer, store: RecordStore) -> SyncEngine {
    let client = QuillClient::new(&server.uri(), "t").unwrap();
    SyncEngine::new(client, store, AuthState::default())
}

fn empty_pull() -> serde_json::Value {
    serde_json::json!({})
}

fn note_json(
    id: i64,
    client_id: Option<&str>,
    text: &str,
    modified_at: &str,
    space_id: i64,
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "client_id": client_id,
        "modified_at": modified_at,
        "text": text,
        "tags": [],
        "space_id": space_id,
    })
}

#[tokio::test]
async fn new_note_round_trip_assigns_identity_without_duplicates() {
    let server = MockServer::start().await;
    let store = make_store().await;
    let space = store.create_space("Journal").await.unwrap();
    let note = store
        .create_note(space.meta.local_id, "buy milk", &[], None)
        .await
        .unwrap();
    let note_cid = note.meta.client_id.clone().unwrap();

    Mock::given(method("POST"))
        .and(path("/spaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "applied": 1,
            "mappings": [
                {"resource": "note", "client_id": note_cid, "server_id": 42}
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;
    // the pull echoes our own push back before the mapping felt durable
    Mock::given(method("GET"))
        .and(path("/sync"))
        .and(query_param("since", "1970-01-01T00:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "spaces": [{"id": 7, "modified_at": "2024-01-01T00:00:04Z", "name": "Journal"}],
            "notes": [note_json(42, Some(&note_cid), "buy milk", "2024-01-01T00:00:05Z", 7)],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server, store.clone());
    let outcome = engine.run_sync_cycle().await;

    assert!(outcome.ran);
    assert_eq!(outcome.errors, 0);
    assert_eq!(outcome.pushed, 2); // provisioned space + pushed note
    assert_eq!(outcome.pulled, 2);

    let note = store.get_note(note.meta.local_id).await.unwrap().unwrap();
    assert_eq!(note.meta.server_id, Some(42));
    assert!(!note.meta.dirty);
    assert_eq!(note.text, "buy milk");
    assert_eq!(
        store.notes_by_space(space.meta.local_id).await.unwrap().len(),
        1
    );
    assert_eq!(
        store.checkpoint().await.unwrap(),
        parse_timestamp_ms("2024-01-01T00:00:05Z").unwrap() - 1
    );
}

#[tokio::test]
async fn clean_state_skips_the_push_entirely() {
    let server = MockServer::start().await;
    let store = make_store().await;

    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = make_engine(&server, store).run_sync_cycle().await;
    assert_eq!(outcome.pushed, 0);
    assert_eq!(outcome.pulled, 0);
    assert_eq!(outcome.errors, 0);
}

#[tokio::test]
async fn push_failure_does_not_block_the_pull() {
    let server = MockServer::start().await;
    let store = make_store().await;
    let space = store.create_space("Journal").await.unwrap();
    store
        .apply_mapping(Resource::Space, &space.meta.client_id.clone().unwrap(), 7)
        .await
        .unwrap();
    store.clear_dirty(Resource::Space, space.meta.local_id).await.unwrap();
    let note = store
        .create_note(space.meta.local_id, "local", &[], None)
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "notes": [note_json(77, None, "from server", "2024-01-01T00:00:05Z", 7)],
        })))
        .mount(&server)
        .await;

    let outcome = make_engine(&server, store.clone()).run_sync_cycle().await;

    assert_eq!(outcome.errors, 1);
    assert_eq!(outcome.pushed, 0);
    assert_eq!(outcome.pulled, 1);
    // the local edit is untouched and will retry next cycle
    let note = store.get_note(note.meta.local_id).await.unwrap().unwrap();
    assert!(note.meta.dirty);
}

#[tokio::test]
async fn auth_rejection_suspends_the_whole_engine() {
    let server = MockServer::start().await;
    let store = make_store().await;
    let space = store.create_space("Journal").await.unwrap();
    store
        .apply_mapping(Resource::Space, &space.meta.client_id.clone().unwrap(), 7)
        .await
        .unwrap();
    // the space stays dirty so the push phase has work to attempt

    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .expect(0)
        .mount(&server)
        .await;

    let engine = make_engine(&server, store);
    let outcome = engine.run_sync_cycle().await;
    assert_eq!(outcome.errors, 1);
    assert!(engine.auth().is_required());

    // further cycles are no-ops until the user logs back in
    let outcome = engine.run_sync_cycle().await;
    assert!(outcome.ran);
    assert_eq!(outcome.pushed + outcome.pulled + outcome.errors, 0);
}

#[tokio::test]
async fn identified_note_deletion_takes_the_fast_path() {
    let server = MockServer::start().await;
    let store = make_store().await;
    let space = store.create_space("Journal").await.unwrap();
    store
        .apply_mapping(Resource::Space, &space.meta.client_id.clone().unwrap(), 7)
        .await
        .unwrap();
    store.clear_dirty(Resource::Space, space.meta.local_id).await.unwrap();
    let note = store
        .create_note(space.meta.local_id, "going away", &[], None)
        .await
        .unwrap();
    store
        .apply_mapping(Resource::Note, &note.meta.client_id.clone().unwrap(), 42)
        .await
        .unwrap();
    store.clear_dirty(Resource::Note, note.meta.local_id).await.unwrap();
    store.tombstone(Resource::Note, note.meta.local_id).await.unwrap();

    Mock::given(method("DELETE"))
        .and(path("/notes/42"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .mount(&server)
        .await;

    let outcome = make_engine(&server, store.clone()).run_sync_cycle().await;

    assert_eq!(outcome.pushed, 1);
    let note = store.get_note(note.meta.local_id).await.unwrap().unwrap();
    assert!(!note.meta.dirty);
    assert!(note.meta.is_tombstone());
}

#[tokio::test]
async fn a_deleted_unpushed_space_is_never_provisioned_for_its_children() {
    let server = MockServer::start().await;
    let store = make_store().await;
    let space = store.create_space("Scratch").await.unwrap();
    let note = store
        .create_note(space.meta.local_id, "orphan", &[], None)
        .await
        .unwrap();
    store.tombstone(Resource::Space, space.meta.local_id).await.unwrap();

    Mock::given(method("POST"))
        .and(path("/spaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 7})))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = make_engine(&server, store.clone()).run_sync_cycle().await;

    assert_eq!(outcome.errors, 0);
    assert_eq!(outcome.pushed, 0);
    // the note waits; the space's dirty flag is spent locally
    let note = store.get_note(note.meta.local_id).await.unwrap().unwrap();
    assert!(note.meta.dirty);
    let space = store.get_space(space.meta.local_id).await.unwrap().unwrap();
    assert!(!space.meta.dirty);
    assert!(space.meta.is_tombstone());
}

#[tokio::test]
async fn dirty_activity_defers_until_its_note_is_identified() {
    let server = MockServer::start().await;
    let store = make_store().await;
    let space = store.create_space("Journal").await.unwrap();
    store
        .apply_mapping(Resource::Space, &space.meta.client_id.clone().unwrap(), 7)
        .await
        .unwrap();
    store.clear_dirty(Resource::Space, space.meta.local_id).await.unwrap();
    let note = store
        .create_note(space.meta.local_id, "ran 5k", &[], None)
        .await
        .unwrap();
    let note_cid = note.meta.client_id.clone().unwrap();
    let activity = store
        .create_activity(note.meta.local_id, None, 5.0)
        .await
        .unwrap();
    let activity_cid = activity.meta.client_id.clone().unwrap();

    // first push carries the note only; the second carries the activity
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "applied": 1,
            "mappings": [{"resource": "note", "client_id": note_cid, "server_id": 42}],
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "applied": 1,
            "mappings": [{"resource": "activity", "client_id": activity_cid, "server_id": 99}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_pull()))
        .mount(&server)
        .await;

    let engine = make_engine(&server, store.clone());

    let outcome = engine.run_sync_cycle().await;
    assert_eq!(outcome.pushed, 1);
    let activity = store.get_activity(activity.meta.local_id).await.unwrap().unwrap();
    assert!(activity.meta.dirty);
    assert!(activity.meta.server_id.is_none());

    let outcome = engine.run_sync_cycle().await;
    assert_eq!(outcome.pushed, 1);
    let activity = store.get_activity(activity.meta.local_id).await.unwrap().unwrap();
    assert!(!activity.meta.dirty);
    assert_eq!(activity.meta.server_id, Some(99));
}

#[tokio::test]
async fn burst_of_requests_coalesces_into_one_extra_cycle() {
    let server = MockServer::start().await;
    let store = make_store().await;

    Mock::given(method("GET"))
        .and(path("/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(empty_pull())
                .set_delay(Duration::from_millis(200)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let engine = Arc::new(make_engine(&server, store));
    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_sync_cycle().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.is_syncing());

    // five rapid signals while the cycle is in flight
    for _ in 0..5 {
        let outcome = engine.run_sync_cycle().await;
        assert!(!outcome.ran);
    }

    let outcome = first.await.unwrap();
    assert!(outcome.ran);
    assert!(!engine.is_syncing());
}
