//! End-to-end tests for the message lifecycle: accept, broadcast, flush,
//! identity reconciliation and historical reads, driven against the
//! file-backed store in a temp directory (no network involved).

use lib_common::connections::FileStore;
use lib_common::{Message, MessageFilter, MessageId, Store, TOMBSTONE_TEXT};
use servers::chat_logic::flusher;
use servers::chat_logic::model::ServerEvent;
use servers::chat_logic::state::{AppState, Policy};
use std::path::Path;
use std::time::Duration;

fn state_with_store(path: &Path, policy: Policy) -> AppState {
    let store = Store::File(FileStore::new(path, 1000).unwrap());
    AppState::new(store, policy)
}

fn default_state(path: &Path) -> AppState {
    state_with_store(path, Policy::default())
}

async fn accept(state: &AppState, sender: &str, text: &str) -> Message {
    state
        .accept_message(None, Some(text.to_string()), None, Some(sender.to_string()))
        .await
        .unwrap()
}

#[tokio::test]
async fn accepted_message_is_pending_until_flush_then_durable() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let msg = accept(&state, "alice", "hello world").await;
    let token = msg.id.as_provisional().unwrap().to_string();

    // Pending, not yet durable.
    {
        let st = state.lock().await;
        assert!(st.buffer.contains(&token));
        assert!(!st.cache.get(&msg.id).unwrap().id.is_durable());
    }

    flusher::flush_once(&state).await;

    // Durable, no longer pending; the old provisional reference still
    // resolves through the alias map.
    let st = state.lock().await;
    assert!(st.buffer.is_empty());
    let cached = st.cache.get(&MessageId::Provisional(token)).unwrap();
    assert!(cached.id.is_durable());
}

#[tokio::test]
async fn idempotency_token_reuse_does_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let first = state
        .accept_message(
            Some("retry-token".into()),
            Some("hi".into()),
            None,
            Some("alice".into()),
        )
        .await
        .unwrap();
    let second = state
        .accept_message(
            Some("retry-token".into()),
            Some("hi".into()),
            None,
            Some("alice".into()),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    let st = state.lock().await;
    assert_eq!(st.cache.len(), 1);
    assert_eq!(st.buffer.len(), 1);
}

#[tokio::test]
async fn empty_message_without_attachment_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let result = state
        .accept_message(None, Some("   ".into()), None, Some("alice".into()))
        .await;
    assert!(result.is_err());

    // With an attachment an empty body is fine.
    let ok = state
        .accept_message(None, None, Some(vec![1, 2, 3]), Some("alice".into()))
        .await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn over_length_text_is_truncated_not_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let policy = Policy {
        max_text_len: 10,
        ..Policy::default()
    };
    let state = state_with_store(&dir.path().join("m.json"), policy);

    let msg = accept(&state, "alice", "0123456789ABCDEF").await;
    assert_eq!(msg.text, "0123456789");
}

#[tokio::test]
async fn edit_is_author_gated_and_window_bound() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let msg = accept(&state, "alice", "original").await;

    // Wrong author.
    let err = state.edit_message(&msg.id, "mallory", "hacked").await;
    assert!(err.is_err());
    // Author succeeds inside the window.
    let edited = state.edit_message(&msg.id, "alice", "fixed").await.unwrap();
    assert_eq!(edited.text, "fixed");
    assert!(edited.edited_at.is_some());
    assert!(edited.edited_at.unwrap() > edited.created_at);

    // The edited body is what a subsequent history query sees.
    let results = state.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(results[0].text, "fixed");
}

#[tokio::test]
async fn edit_outside_window_is_rejected_and_body_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let policy = Policy {
        edit_window: Duration::from_millis(1),
        ..Policy::default()
    };
    let state = state_with_store(&dir.path().join("m.json"), policy);

    let msg = accept(&state, "alice", "original").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(state.edit_message(&msg.id, "alice", "late").await.is_err());
    let st = state.lock().await;
    assert_eq!(st.cache.get(&msg.id).unwrap().text, "original");
}

#[tokio::test]
async fn delete_before_flush_writes_the_tombstone_not_the_body() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let msg = accept(&state, "alice", "secret").await;
    state.delete_message(&msg.id, "alice").await.unwrap();

    flusher::flush_once(&state).await;

    let durable = state.store.select(&MessageFilter::default()).await.unwrap();
    assert_eq!(durable.len(), 1);
    assert!(durable[0].message.deleted);
    assert_eq!(durable[0].message.text, TOMBSTONE_TEXT);

    // Further edits are rejected.
    assert!(state.edit_message(&msg.id, "alice", "resurrect").await.is_err());
}

#[tokio::test]
async fn reaction_double_toggle_restores_the_previous_set() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let msg = accept(&state, "alice", "react to me").await;
    let after_one = state.react(&msg.id, "bob", "👍").await.unwrap();
    assert_eq!(after_one.get("👍").map(|s| s.len()), Some(1));
    let after_two = state.react(&msg.id, "bob", "👍").await.unwrap();
    assert!(after_two.is_empty());
}

#[tokio::test]
async fn duplicate_report_by_same_reporter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let msg = accept(&state, "alice", "report me").await;
    assert_eq!(state.report(&msg.id, "carol", "spam").await.unwrap(), 1);
    assert!(state.report(&msg.id, "carol", "spam again").await.is_err());
    assert_eq!(state.report(&msg.id, "dave", "offensive").await.unwrap(), 2);
}

#[tokio::test]
async fn deferred_reports_reach_the_store_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let msg = accept(&state, "alice", "report me").await;
    state.report(&msg.id, "carol", "spam").await.unwrap();

    flusher::flush_once(&state).await;

    let reports = state.store.list_reports().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].message_id.is_durable());
    assert_eq!(reports[0].reporter, "carol");
}

#[tokio::test]
async fn eviction_never_drops_unflushed_messages() {
    let dir = tempfile::tempdir().unwrap();
    let policy = Policy {
        cache_bound: 3,
        ..Policy::default()
    };
    let state = state_with_store(&dir.path().join("m.json"), policy);

    // Five messages over a bound of three, zero flushes: all must survive.
    for i in 0..5 {
        accept(&state, "alice", &format!("msg {i}")).await;
    }
    {
        let st = state.lock().await;
        assert_eq!(st.cache.len(), 5);
        assert_eq!(st.buffer.len(), 5);
    }
    let all = state.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(all.len(), 5);

    // Once flushed, the next accept shrinks the cache back to its bound.
    flusher::flush_once(&state).await;
    accept(&state, "alice", "one more").await;
    let st = state.lock().await;
    assert_eq!(st.cache.len(), 3);
}

#[tokio::test]
async fn failed_flush_retries_without_loss_or_duplication() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("not-yet-created");
    // The store cannot write until the directory exists.
    let state = state_with_store(&nested.join("m.json"), Policy::default());

    accept(&state, "alice", "first").await;
    accept(&state, "bob", "second").await;

    // Tick 1: the write fails, the snapshot is requeued in order.
    flusher::flush_once(&state).await;
    {
        let st = state.lock().await;
        assert_eq!(st.buffer.len(), 2);
    }

    // Tick 2: the store is reachable again.
    std::fs::create_dir(&nested).unwrap();
    flusher::flush_once(&state).await;

    let st = state.lock().await;
    assert!(st.buffer.is_empty());
    drop(st);

    let durable = state.store.select(&MessageFilter::default()).await.unwrap();
    assert_eq!(durable.len(), 2);
    assert_eq!(durable[0].message.text, "second"); // newest first
    assert_eq!(durable[1].message.text, "first");
}

#[tokio::test]
async fn failed_flush_serves_nothing_as_durable() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("not-yet-created");
    let state = state_with_store(&nested.join("m.json"), Policy::default());

    accept(&state, "alice", "first").await;
    accept(&state, "bob", "second").await;
    flusher::flush_once(&state).await;

    // The failed batch must not surface as durable rows.
    let durable = state.store.select(&MessageFilter::default()).await.unwrap();
    assert!(durable.is_empty());

    // A merged query sees each message exactly once, still provisional.
    let all = state.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|m| !m.id.is_durable()));

    // After recovery nothing is lost and nothing doubled.
    std::fs::create_dir(&nested).unwrap();
    flusher::flush_once(&state).await;
    let all = state.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn query_during_inflight_flush_is_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));
    let msg = accept(&state, "alice", "in flight").await;

    // First half of a flush cycle: drain the buffer and write the batch
    // with the lock released, but do not apply the durable keys yet.
    let batch = {
        let mut st = state.lock().await;
        st.buffer.drain_all();
        vec![st.cache.get(&msg.id).unwrap().clone()]
    };
    state.store.insert_batch(&batch).await.unwrap();

    // The durable row and the still-provisional cache entry are the same
    // message; the merge must collapse them onto the cache copy.
    let all = state.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].text, "in flight");
}

#[tokio::test]
async fn query_merges_durable_and_unflushed_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    accept(&state, "alice", "old durable").await;
    flusher::flush_once(&state).await;
    accept(&state, "bob", "fresh unflushed").await;

    let all = state.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].text, "fresh unflushed");
    assert_eq!(all[1].text, "old durable");
    assert!(all[1].id.is_durable());

    // Filters apply across both sources.
    let filtered = state
        .query_messages(&MessageFilter {
            sender: Some("bob".into()),
            ..MessageFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].sender, "bob");
}

#[tokio::test]
async fn broadcasts_fan_out_accept_and_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));
    let mut rx = state.subscribe();

    let msg = accept(&state, "alice", "observe me").await;
    match rx.recv().await.unwrap().as_ref() {
        ServerEvent::ReceiveMessage { message } => assert_eq!(message.text, "observe me"),
        other => panic!("expected receive_message, got {:?}", other),
    }

    state.edit_message(&msg.id, "alice", "observed").await.unwrap();
    match rx.recv().await.unwrap().as_ref() {
        ServerEvent::MessageEdited { message } => assert_eq!(message.text, "observed"),
        other => panic!("expected message_edited, got {:?}", other),
    }

    state.react(&msg.id, "bob", "🔥").await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap().as_ref(),
        ServerEvent::MessageReactions { .. }
    ));
}

#[tokio::test]
async fn timestamps_never_decrease_across_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let state = default_state(&dir.path().join("m.json"));

    let mut previous = accept(&state, "alice", "first").await.created_at;
    for i in 0..20 {
        let next = accept(&state, "alice", &format!("n{i}")).await.created_at;
        assert!(next > previous);
        previous = next;
    }
}
