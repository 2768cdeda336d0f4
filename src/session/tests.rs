use super::*;
use crate::client::memory::{MemoryBackend, Operation, Request};
use crate::client::{ClientEvent, MessageEvent, PresenceAction, PresenceEvent, StatusCategory};
use serde_json::json;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

fn session(backend: &MemoryBackend) -> Session {
    Session::new(
        Arc::new(backend.clone()),
        ClientOptions::default(),
        SessionSettings::default(),
    )
}

fn counting_message_handler() -> (Arc<dyn MessageHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |_: &MessageEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

fn ignore_presence() -> Arc<dyn PresenceHandler> {
    Arc::new(|_: &PresenceEvent| {})
}

fn message_event(channel: &str, text: &str) -> ClientEvent {
    ClientEvent::Message(MessageEvent {
        channel: channel.to_string(),
        publisher: Some("someone".to_string()),
        message: json!({ "text": text }),
        timetoken: 1,
    })
}

async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("lifecycle event timed out")
        .expect("lifecycle channel closed")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn test_handler_set_is_idempotent() {
    let set: HandlerSet<dyn MessageHandler> = HandlerSet::default();
    let (handler, _) = counting_message_handler();

    let first = set.insert(handler.clone());
    let second = set.insert(handler.clone());
    assert_eq!(first, second);
    assert_eq!(set.len(), 1);

    assert!(set.remove(first));
    assert!(set.is_empty());
    assert!(!set.remove(first));
}

#[test]
fn test_registry_dispatches_by_kind() {
    let registry = Registry::new();
    let (message, messages) = counting_message_handler();
    let presences = Arc::new(AtomicUsize::new(0));
    let seen = presences.clone();
    let presence: Arc<dyn PresenceHandler> = Arc::new(move |_: &PresenceEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    registry.add(presence, message);

    registry.dispatch(&message_event("room1", "hi"));
    registry.dispatch(&ClientEvent::Presence(PresenceEvent {
        channel: "room1".to_string(),
        action: PresenceAction::Join,
        uuid: Some("x".to_string()),
        occupancy: 1,
        state: None,
        timetoken: 1,
    }));
    registry.dispatch(&ClientEvent::Status(crate::client::StatusEvent::new(
        StatusCategory::Connected,
    )));

    assert_eq!(messages.load(Ordering::SeqCst), 1);
    assert_eq!(presences.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let backend = MemoryBackend::new();
    let session = session(&backend);

    let first = session.connect();
    let second = session.connect();
    assert!(first.ptr_eq(&second));

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap().uuid(), b.unwrap().uuid());
    assert_eq!(backend.clients_created(), 1);

    // a resolved attempt is still reused
    let third = session.connect().await.unwrap();
    assert_eq!(backend.clients_created(), 1);
    assert!(session.connections().is_connected());
    assert_eq!(
        session.connections().current().unwrap().uuid(),
        third.uuid()
    );
}

#[test]
fn test_stale_registration_leaves_new_handlers_alone() {
    let registry = Registry::new();
    let (shared, _) = counting_message_handler();
    let presence = ignore_presence();

    let first = registry.add(presence.clone(), shared.clone());
    let second = registry.add(presence.clone(), shared.clone());
    registry.remove(&first);
    assert!(registry.message_handlers().is_empty());
    drop(shared);
    drop(presence);

    let (replacement, _) = counting_message_handler();
    registry.add(ignore_presence(), replacement);
    registry.remove(&second);
    assert_eq!(registry.message_handlers().len(), 1);
    assert_eq!(registry.presence_handlers().len(), 1);
}

#[tokio::test]
async fn test_connect_keeps_single_listener() {
    let backend = MemoryBackend::new();
    let session = session(&backend);

    let connection = session.connect().await.unwrap();
    assert_eq!(backend.listener_count(connection.uuid()), 1);
    assert_eq!(connection.client().uuid(), connection.uuid());
}

#[tokio::test]
async fn test_handshake_failure_rejects_and_clears_attempt() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let mut lifecycle = session.lifecycle();
    backend.fail_next(Operation::Time, StatusCategory::Timeout);

    let first = session.connect();
    let second = session.connect();
    let (a, b) = tokio::join!(first, second);
    let err = a.unwrap_err();
    assert!(matches!(err, SessionError::Handshake(ref msg) if msg.contains("timeout")));
    assert_eq!(b.unwrap_err(), err);
    // the abandoned client is released
    assert_eq!(backend.live_clients(), 0);
    assert!(matches!(
        next_event(&mut lifecycle).await,
        LifecycleEvent::ConnectFailed { .. }
    ));

    // not latched: the next call starts a fresh attempt
    let connection = session.connect().await.unwrap();
    assert_eq!(backend.clients_created(), 2);
    assert!(!connection.uuid().is_empty());
}

#[tokio::test]
async fn test_network_down_while_connecting_rejects() {
    let backend = MemoryBackend::new();
    backend.set_latency(Duration::from_millis(200));
    let session = session(&backend);

    let attempt = session.connect();
    // the client exists once the attempt task has run
    eventually(|| backend.clients_created() == 1).await;
    backend.emit_status(StatusCategory::NetworkDown);

    assert_eq!(
        attempt.await.unwrap_err(),
        SessionError::NetworkDown(StatusCategory::NetworkDown)
    );
}

#[tokio::test(start_paused = true)]
async fn test_down_status_at_handshake_completion_is_never_lost() {
    for _ in 0..50 {
        let backend = MemoryBackend::new();
        backend.set_latency(Duration::from_millis(200));
        let session = session(&backend);

        let emitter = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            emitter.emit_status(StatusCategory::NetworkDown);
        });

        let outcome = session.connect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        match outcome {
            Err(err) => {
                assert_eq!(err, SessionError::NetworkDown(StatusCategory::NetworkDown));
                assert_eq!(backend.clients_created(), 1);
            }
            // seen by the dispatcher instead, which reconnects once
            Ok(_) => assert_eq!(backend.clients_created(), 2),
        }
    }
}

#[tokio::test]
async fn test_handshake_timeout() {
    let backend = MemoryBackend::new();
    backend.set_latency(Duration::from_millis(500));
    let session = Session::new(
        Arc::new(backend.clone()),
        ClientOptions::default(),
        SessionSettings {
            message_count: 100,
            handshake_timeout_secs: Some(0),
        },
    );

    assert_eq!(
        session.connect().await.unwrap_err(),
        SessionError::HandshakeTimeout(Duration::from_secs(0))
    );
}

#[tokio::test]
async fn test_client_creation_failure_is_reported() {
    let backend = MemoryBackend::new();
    let session = Session::new(
        Arc::new(backend.clone()),
        ClientOptions {
            subscribe_key: String::new(),
            ..ClientOptions::default()
        },
        SessionSettings::default(),
    );

    assert!(matches!(
        session.connect().await,
        Err(SessionError::Client(
            crate::utils::error::ClientError::InvalidOptions(_)
        ))
    ));
}

#[tokio::test]
async fn test_subscribe_sends_presence_enabled_request() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let message: Arc<dyn MessageHandler> = Arc::new(move |event: &MessageEvent| {
        sink.lock().unwrap().push(event.message.clone());
    });

    let mut subscription = session.subscribe("room1", ignore_presence(), message);
    assert_eq!(subscription.channel(), "room1");
    subscription.confirmed().await.unwrap();

    let subscribes: Vec<_> = backend
        .requests()
        .into_iter()
        .filter_map(|r| match r.request {
            Request::Subscribe(req) => Some(req),
            _ => None,
        })
        .collect();
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0].channels, vec!["room1".to_string()]);
    assert!(subscribes[0].with_presence);

    backend.publish_as("someone", "room1", json!({"text": "hello"}));
    eventually(|| !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0], json!({"text": "hello"}));
}

#[tokio::test]
async fn test_subscribe_registers_handlers_synchronously() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let (message, _) = counting_message_handler();

    let _subscription = session.subscribe("room1", ignore_presence(), message);

    assert_eq!(session.registry().message_handlers().len(), 1);
    assert_eq!(session.registry().presence_handlers().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_removes_handlers_before_delivery() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let (message, count) = counting_message_handler();
    let (witness, witnessed) = counting_message_handler();

    let subscription = session.subscribe("room1", ignore_presence(), message);
    let mut other = session.subscribe("room2", ignore_presence(), witness);
    other.confirmed().await.unwrap();

    let unsubscribed = subscription.unsubscribe();
    assert_eq!(session.registry().message_handlers().len(), 1);
    unsubscribed.await.unwrap();
    assert!(backend.subscribers("room1").is_empty());

    // handlers fan out across channels, so room2 traffic would reach it
    session
        .publish_message("room2", json!({"text": "after"}))
        .await
        .unwrap();
    eventually(|| witnessed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let unsubscribes = backend
        .requests()
        .into_iter()
        .filter(|r| matches!(r.request, Request::Unsubscribe(_)))
        .count();
    assert_eq!(unsubscribes, 1);
}

#[tokio::test]
async fn test_same_handler_twice_is_invoked_once() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let (message, count) = counting_message_handler();
    let presence = ignore_presence();

    let mut first = session.subscribe("room1", presence.clone(), message.clone());
    let mut second = session.subscribe("room2", presence, message);
    first.confirmed().await.unwrap();
    second.confirmed().await.unwrap();
    assert_eq!(session.registry().message_handlers().len(), 1);

    session
        .publish_message("room1", json!({"text": "once"}))
        .await
        .unwrap();
    eventually(|| count.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_events_fan_out_regardless_of_channel() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let (room1_handler, room1_count) = counting_message_handler();
    let (room2_handler, room2_count) = counting_message_handler();

    let mut a = session.subscribe("room1", ignore_presence(), room1_handler);
    let mut b = session.subscribe("room2", ignore_presence(), room2_handler);
    a.confirmed().await.unwrap();
    b.confirmed().await.unwrap();

    backend.publish_as("someone", "room2", json!("x"));
    eventually(|| room2_count.load(Ordering::SeqCst) == 1).await;
    assert_eq!(room1_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_presence_events_reach_presence_handlers() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let actions = Arc::new(Mutex::new(Vec::new()));
    let sink = actions.clone();
    let presence: Arc<dyn PresenceHandler> = Arc::new(move |event: &PresenceEvent| {
        sink.lock().unwrap().push((event.action, event.uuid.clone()));
    });
    let (message, _) = counting_message_handler();

    let mut subscription = session.subscribe("room1", presence, message);
    subscription.confirmed().await.unwrap();

    // a second participant joins through its own session
    let peer = self::session(&backend);
    let mut peer_sub = peer.subscribe("room1", ignore_presence(), counting_message_handler().0);
    peer_sub.confirmed().await.unwrap();
    let peer_uuid = peer.connect().await.unwrap().uuid().to_string();

    eventually(|| {
        actions
            .lock()
            .unwrap()
            .contains(&(PresenceAction::Join, Some(peer_uuid.clone())))
    })
    .await;
}

#[tokio::test]
async fn test_network_down_triggers_exactly_one_reconnect() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let mut lifecycle = session.lifecycle();

    let original = session.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut lifecycle).await,
        LifecycleEvent::Connected { .. }
    ));

    backend.emit_status(StatusCategory::NetworkDown);

    match next_event(&mut lifecycle).await {
        LifecycleEvent::ConnectionLost { uuid, category } => {
            assert_eq!(uuid, original.uuid());
            assert_eq!(category, StatusCategory::NetworkDown);
        }
        other => panic!("Expected ConnectionLost, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut lifecycle).await,
        LifecycleEvent::Connected { .. }
    ));
    let reconnected = match next_event(&mut lifecycle).await {
        LifecycleEvent::Reconnected { uuid } => uuid,
        other => panic!("Expected Reconnected, got {other:?}"),
    };

    assert_ne!(reconnected, original.uuid());
    assert_eq!(backend.clients_created(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.clients_created(), 2);

    let current = session.connect().await.unwrap();
    assert_eq!(current.uuid(), reconnected);
}

#[tokio::test]
async fn test_failed_reconnect_is_reported() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let mut lifecycle = session.lifecycle();
    session.connect().await.unwrap();
    next_event(&mut lifecycle).await;

    backend.fail_next(Operation::Time, StatusCategory::Timeout);
    backend.emit_status(StatusCategory::Disconnected);

    let mut saw_failure = false;
    for _ in 0..3 {
        if let LifecycleEvent::ReconnectFailed { error } = next_event(&mut lifecycle).await {
            assert!(matches!(error, SessionError::Handshake(_)));
            saw_failure = true;
            break;
        }
    }
    assert!(saw_failure);

    // the failed attempt is not latched
    session.connect().await.unwrap();
    assert_eq!(backend.clients_created(), 3);
}

#[tokio::test]
async fn test_disconnect_stops_client_without_reconnecting() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let connection = session.connect().await.unwrap();

    session.disconnect().await.unwrap();

    assert!(backend.requests().iter().any(|r| r.request == Request::Stop));
    assert_eq!(backend.listener_count(connection.uuid()), 0);
    assert!(!session.connections().is_connected());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.clients_created(), 1);

    // a later call connects again
    let fresh = session.connect().await.unwrap();
    assert_ne!(fresh.uuid(), connection.uuid());
}

#[tokio::test]
async fn test_publish_message_resolves_with_unit() {
    let backend = MemoryBackend::new();
    let session = session(&backend);

    let result: Result<(), SessionError> =
        session.publish_message("room1", json!({"text": "hi"})).await;
    assert!(result.is_ok());
    assert!(backend.requests().iter().any(|r| matches!(
        &r.request,
        Request::Publish(p) if p.channel == "room1" && p.message == json!({"text": "hi"})
    )));
}

#[tokio::test]
async fn test_publish_message_rejects_with_category() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    session.connect().await.unwrap();
    backend.fail_next(Operation::Publish, StatusCategory::AccessDenied);

    let err = session
        .publish_message("room1", json!("x"))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::Backend("access_denied".to_string()));
    assert_eq!(err.category(), Some("access_denied"));
}

#[tokio::test]
async fn test_history_requests_configured_page_size() {
    let backend = MemoryBackend::new();
    let session = Session::new(
        Arc::new(backend.clone()),
        ClientOptions::default(),
        SessionSettings {
            message_count: 3,
            handshake_timeout_secs: None,
        },
    );
    for n in 0..5 {
        session.publish_message("log", json!(n)).await.unwrap();
    }

    let response = session.history("log", None).await.unwrap();
    assert_eq!(response.messages.len(), 3);

    let connection = session.connect().await.unwrap();
    let direct = connection
        .client()
        .history(crate::client::HistoryRequest {
            channel: "log".to_string(),
            start: None,
            end: None,
            count: 3,
            reverse: false,
            include_timetoken: true,
        })
        .await
        .unwrap();
    assert_eq!(response, direct);

    let history_requests: Vec<_> = backend
        .requests()
        .into_iter()
        .filter_map(|r| match r.request {
            Request::History(req) => Some(req),
            _ => None,
        })
        .collect();
    assert_eq!(history_requests[0].count, 3);
    assert_eq!(history_requests[0].start, None);
}

#[tokio::test]
async fn test_history_rejects_with_category() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    session.connect().await.unwrap();
    backend.fail_next(Operation::History, StatusCategory::BadRequest);

    let err = session.history("log", Some(42)).await.unwrap_err();
    assert_eq!(err.category(), Some("bad_request"));
}

#[tokio::test]
async fn test_participants_lists_occupants() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    let mut subscription = session.subscribe(
        "room1",
        ignore_presence(),
        counting_message_handler().0,
    );
    subscription.confirmed().await.unwrap();
    let me = session.connect().await.unwrap().uuid().to_string();

    session
        .publish_typing_state("room1", &me, true)
        .await
        .unwrap();

    let occupants = session.participants("room1").await.unwrap();
    assert_eq!(occupants.len(), 1);
    assert_eq!(occupants[0].uuid, me);
    assert_eq!(occupants[0].state, Some(json!({"isTyping": true})));

    assert!(session.participants("nobody-here").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_participants_rejects_with_category() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    session.connect().await.unwrap();
    backend.fail_next(Operation::HereNow, StatusCategory::AccessDenied);

    let err = session.participants("room1").await.unwrap_err();
    assert_eq!(err, SessionError::Backend("access_denied".to_string()));
}

#[tokio::test]
async fn test_typing_state_targets_given_uuid() {
    let backend = MemoryBackend::new();
    let session = session(&backend);

    let response = session
        .publish_typing_state("room1", "user-42", false)
        .await
        .unwrap();
    assert_eq!(response.state, json!({"isTyping": false}));

    let request = backend
        .requests()
        .into_iter()
        .find_map(|r| match r.request {
            Request::SetState(req) => Some(req),
            _ => None,
        })
        .unwrap();
    assert_eq!(request.uuid.as_deref(), Some("user-42"));
    assert_eq!(request.channels, vec!["room1".to_string()]);
}

#[tokio::test]
async fn test_typing_state_errors_are_not_translated() {
    let backend = MemoryBackend::new();
    let session = session(&backend);
    session.connect().await.unwrap();
    backend.fail_next(Operation::SetState, StatusCategory::AccessDenied);

    let err = session
        .publish_typing_state("room1", "user-42", true)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SessionError::Client(crate::utils::error::ClientError::Status(
            StatusCategory::AccessDenied
        ))
    );
}
