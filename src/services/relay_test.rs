use super::*;
use crate::message::{ChatMessageType, UID_PLACEHOLDER};
use crate::state::test_helpers::{self, user_message};
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};

fn drain(rx: &mut broadcast::Receiver<ChatMessage>) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

async fn relay_for(state: &AppState, uid: &str, policy: CleanupPolicy) -> SessionRelay {
    let user = test_helpers::seed_session(state, uid).await;
    SessionRelay::for_session(state, user).with_policy(policy)
}

/// Feed `items` through a spawned relay, then close the channel.
async fn drive(relay: SessionRelay, items: Vec<Inbound>) -> RelayOutcome {
    let (tx, handle) = relay.spawn();
    for item in items {
        if tx.send(item).await.is_err() {
            break;
        }
    }
    drop(tx);
    timeout(Duration::from_millis(500), handle)
        .await
        .expect("relay task timed out")
        .expect("relay task panicked")
}

// =============================================================================
// CleanupPolicy / RelayState
// =============================================================================

#[test]
fn cleanup_policy_parses_case_insensitively() {
    assert_eq!("always".parse::<CleanupPolicy>().unwrap(), CleanupPolicy::Always);
    assert_eq!(" LEGACY ".parse::<CleanupPolicy>().unwrap(), CleanupPolicy::Legacy);
    assert!("sometimes".parse::<CleanupPolicy>().is_err());
}

#[test]
fn terminal_states() {
    assert!(!RelayState::Pending.is_terminal());
    assert!(!RelayState::Active.is_terminal());
    assert!(RelayState::Completed.is_terminal());
    assert!(RelayState::Failed.is_terminal());
}

#[test]
fn relay_error_codes() {
    let store = RelayError::from(StoreError::Database(sqlx::Error::PoolClosed));
    assert_eq!(store.error_code(), "E_DATABASE");
    assert!(store.retryable());

    let decode = RelayError::from(serde_json::from_str::<ChatMessage>("{").unwrap_err());
    assert_eq!(decode.error_code(), "E_DECODE");
    assert!(!decode.retryable());

    assert_eq!(RelayError::Transport("reset".into()).error_code(), "E_TRANSPORT");
}

// =============================================================================
// on_start
// =============================================================================

#[tokio::test]
async fn on_start_grants_configured_demand() {
    let (state, _store) = test_helpers::test_app_state();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    assert_eq!(relay.state(), RelayState::Pending);

    assert_eq!(relay.on_start(), 10_000);
    assert_eq!(relay.state(), RelayState::Active);
}

#[tokio::test]
async fn on_start_twice_keeps_state() {
    let (state, _store) = test_helpers::test_app_state();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always)
        .await
        .with_demand(4);
    assert_eq!(relay.on_start(), 4);
    relay.on_complete().await;
    assert_eq!(relay.on_start(), 4);
    assert_eq!(relay.state(), RelayState::Completed);
}

#[tokio::test]
async fn zero_demand_is_bumped_to_one() {
    let (state, _store) = test_helpers::test_app_state();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always)
        .await
        .with_demand(0);
    assert_eq!(relay.on_start(), 1);
}

#[tokio::test]
async fn oversized_demand_is_capped_and_spawns() {
    let (state, _store) = test_helpers::test_app_state();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always)
        .await
        .with_demand(usize::MAX);

    let (tx, handle) = relay.spawn();
    assert_eq!(tx.max_capacity(), Semaphore::MAX_PERMITS);
    drop(tx);
    let outcome = timeout(Duration::from_millis(500), handle)
        .await
        .expect("relay task timed out")
        .expect("relay task panicked");
    assert_eq!(outcome.state, RelayState::Completed);
}

#[test]
fn default_policy_is_legacy() {
    assert_eq!(CleanupPolicy::default(), CleanupPolicy::Legacy);
}

// =============================================================================
// on_message
// =============================================================================

#[tokio::test]
async fn counter_equals_messages_observed() {
    let (state, _store) = test_helpers::test_app_state();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    let user = relay.user().clone();

    let items = (0..25).map(|i| Ok(user_message("alice", &format!("m{i}")))).collect();
    let outcome = drive(relay, items).await;

    assert_eq!(user.message_count(), 25);
    assert_eq!(outcome.messages, 25);
}

#[tokio::test]
async fn every_message_is_persisted_with_same_content() {
    let (state, store) = test_helpers::test_app_state();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always).await;

    let m1 = user_message("alice", "hello");
    let m2 = user_message("alice", "world");
    drive(relay, vec![Ok(m1.clone()), Ok(m2.clone())]).await;

    let rows = store.all().await;
    assert_eq!(rows, vec![ChatMessageHist::from(&m1), ChatMessageHist::from(&m2)]);
    assert_eq!(rows[0].id, m1.id);
    assert_eq!(rows[0].message_type, "USER_MESSAGE");
    assert_eq!(rows[0].text, "hello");
    assert_eq!(rows[0].timestamp, m1.timestamp);
    assert_eq!(rows[0].sender_uid, "alice");
}

#[tokio::test]
async fn broadcast_preserves_inbound_order() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "alice", CleanupPolicy::Legacy).await;

    let sent: Vec<ChatMessage> = (0..10).map(|i| user_message("alice", &format!("#{i}"))).collect();
    drive(relay, sent.iter().cloned().map(Ok).collect()).await;

    let received = drain(&mut feed);
    assert_eq!(received.len(), 11);
    assert_eq!(&received[..10], &sent[..]);
    assert_eq!(received[10].message_type, ChatMessageType::UserLeft);
}

#[tokio::test]
async fn on_message_records_last_received() {
    let (state, _store) = test_helpers::test_app_state();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    relay.on_start();
    assert!(relay.last_received().is_none());

    let m1 = user_message("alice", "first");
    let m2 = user_message("alice", "second");
    relay.on_message(m1).await.unwrap();
    relay.on_message(m2.clone()).await.unwrap();

    assert_eq!(relay.last_received(), Some(&m2));
}

#[tokio::test]
async fn message_before_start_is_dropped() {
    let (state, store) = test_helpers::test_app_state();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always).await;

    relay.on_message(user_message("alice", "early")).await.unwrap();

    assert_eq!(relay.user().message_count(), 0);
    assert!(store.all().await.is_empty());
}

#[tokio::test]
async fn message_after_completion_is_dropped() {
    let (state, store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    relay.on_start();
    relay.on_complete().await;

    relay.on_message(user_message("alice", "late")).await.unwrap();

    assert_eq!(relay.user().message_count(), 0);
    assert!(store.all().await.is_empty());
    assert!(drain(&mut feed).is_empty());
}

#[tokio::test]
async fn store_failure_fails_session_without_broadcast() {
    let state = test_helpers::failing_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "dave", CleanupPolicy::Legacy).await;

    let outcome = drive(
        relay,
        vec![Ok(user_message("dave", "doomed")), Ok(user_message("dave", "never seen"))],
    )
    .await;

    assert_eq!(outcome.state, RelayState::Failed);
    // Counted before the write failed; the second message never arrives.
    assert_eq!(outcome.messages, 1);
    assert!(drain(&mut feed).is_empty());
    assert!(state.registry.contains("dave").await);
}

#[tokio::test]
async fn store_failure_under_always_announces_and_deregisters() {
    let state = test_helpers::failing_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "dave", CleanupPolicy::Always).await;

    let outcome = drive(relay, vec![Ok(user_message("dave", "doomed"))]).await;

    assert_eq!(outcome.state, RelayState::Failed);
    assert!(outcome.departure_sent);
    assert!(outcome.deregistered);
    let received = drain(&mut feed);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message_type, ChatMessageType::UserLeft);
    assert!(!state.registry.contains("dave").await);
}

// =============================================================================
// Termination scenarios under the legacy policy.
// =============================================================================

#[tokio::test]
async fn scenario_a_completion_after_messages() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "alice", CleanupPolicy::Legacy).await;

    let m1 = user_message("alice", "M1");
    let m2 = user_message("alice", "M2");
    let outcome = drive(relay, vec![Ok(m1.clone()), Ok(m2.clone())]).await;

    let received = drain(&mut feed);
    assert_eq!(received.len(), 3);
    assert_eq!(received[0], m1);
    assert_eq!(received[1], m2);

    let departure = &received[2];
    assert_eq!(departure.message_type, ChatMessageType::UserLeft);
    assert_eq!(departure.text, "alice 님이 퇴장했습니다.");
    assert_eq!(departure.sender.uid, "alice");
    assert_eq!(departure.sender.message_count(), 0);
    assert_ne!(departure.id, m1.id);
    assert_ne!(departure.id, m2.id);
    assert!(departure.timestamp >= m2.timestamp);

    assert_eq!(outcome.state, RelayState::Completed);
    assert!(outcome.departure_sent);
    assert!(outcome.deregistered);
    assert!(!state.registry.contains("alice").await);
}

#[tokio::test]
async fn scenario_b_silent_session_legacy_keeps_registry_entry() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "bob", CleanupPolicy::Legacy).await;

    let outcome = drive(relay, vec![]).await;

    assert_eq!(outcome.state, RelayState::Completed);
    assert!(drain(&mut feed).is_empty());
    assert!(!outcome.departure_sent);
    assert!(!outcome.deregistered);
    assert!(state.registry.contains("bob").await);
}

#[tokio::test]
async fn scenario_c_error_legacy_only_logs() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "carol", CleanupPolicy::Legacy).await;

    let m1 = user_message("carol", "M1");
    let outcome = drive(
        relay,
        vec![Ok(m1.clone()), Err(RelayError::Transport("connection reset".into()))],
    )
    .await;

    assert_eq!(outcome.state, RelayState::Failed);
    assert_eq!(drain(&mut feed), vec![m1]);
    assert!(!outcome.departure_sent);
    assert!(state.registry.contains("carol").await);
}

// =============================================================================
// Termination scenarios under the default policy.
// =============================================================================

#[tokio::test]
async fn always_policy_completion_matches_scenario_a() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always).await;

    drive(relay, vec![Ok(user_message("alice", "M1")), Ok(user_message("alice", "M2"))]).await;

    let received = drain(&mut feed);
    assert_eq!(received.len(), 3);
    assert_eq!(received[2].text, "alice 님이 퇴장했습니다.");
    assert!(!state.registry.contains("alice").await);
}

#[tokio::test]
async fn always_policy_silent_session_is_deregistered_without_notice() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "bob", CleanupPolicy::Always).await;

    let outcome = drive(relay, vec![]).await;

    assert!(drain(&mut feed).is_empty());
    assert!(!outcome.departure_sent);
    assert!(outcome.deregistered);
    assert!(!state.registry.contains("bob").await);
}

#[tokio::test]
async fn always_policy_error_announces_and_deregisters() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "carol", CleanupPolicy::Always).await;

    let m1 = user_message("carol", "M1");
    let outcome = drive(
        relay,
        vec![Ok(m1.clone()), Err(RelayError::Transport("connection reset".into()))],
    )
    .await;

    let received = drain(&mut feed);
    assert_eq!(received.len(), 2);
    assert_eq!(received[0], m1);
    assert_eq!(received[1].message_type, ChatMessageType::UserLeft);
    assert_eq!(received[1].text, "carol 님이 퇴장했습니다.");
    assert_eq!(outcome.state, RelayState::Failed);
    assert!(!state.registry.contains("carol").await);
}

#[tokio::test]
async fn items_after_error_are_not_processed() {
    let (state, store) = test_helpers::test_app_state();
    let relay = relay_for(&state, "erin", CleanupPolicy::Always).await;

    let outcome = drive(
        relay,
        vec![
            Err(RelayError::Transport("boom".into())),
            Ok(user_message("erin", "ignored")),
        ],
    )
    .await;

    assert_eq!(outcome.messages, 0);
    assert!(store.all().await.is_empty());
}

#[tokio::test]
async fn second_terminal_signal_is_ignored() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let mut relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    relay.on_start();
    relay.on_message(user_message("alice", "M1")).await.unwrap();

    relay.on_complete().await;
    relay.on_complete().await;
    relay.on_error(&RelayError::Transport("late".into())).await;

    assert_eq!(relay.state(), RelayState::Completed);
    let departures = drain(&mut feed)
        .into_iter()
        .filter(|m| m.message_type == ChatMessageType::UserLeft)
        .count();
    assert_eq!(departures, 1);
}

#[tokio::test]
async fn departure_template_is_configurable() {
    let (state, _store) = test_helpers::test_app_state();
    let mut feed = state.broadcast.subscribe();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always)
        .await
        .with_departure_template(format!("bye {UID_PLACEHOLDER}"));

    drive(relay, vec![Ok(user_message("alice", "hi"))]).await;

    let received = drain(&mut feed);
    assert_eq!(received.last().map(|m| m.text.as_str()), Some("bye alice"));
}

#[tokio::test]
async fn deregister_of_already_removed_session_is_harmless() {
    let (state, _store) = test_helpers::test_app_state();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    state.registry.remove("alice").await;

    let outcome = drive(relay, vec![Ok(user_message("alice", "hi"))]).await;

    assert_eq!(outcome.state, RelayState::Completed);
    assert!(outcome.deregistered);
    assert!(!state.registry.contains("alice").await);
}

#[tokio::test]
async fn run_without_start_activates_itself() {
    let (state, store) = test_helpers::test_app_state();
    let relay = relay_for(&state, "alice", CleanupPolicy::Always).await;
    let (tx, rx) = mpsc::channel(4);
    tx.send(Ok(user_message("alice", "direct"))).await.unwrap();
    drop(tx);

    let outcome = relay.run(rx).await;

    assert_eq!(outcome.state, RelayState::Completed);
    assert_eq!(store.all().await.len(), 1);
}
