//! Realtime client tests against an in-process fake Mercury server.

mod common;

use common::{event, test_timeouts, wait_for, FakeMercury, RotatingToken, Step};
use mercury_link::{
    ConnectionError, ConnectionState, DisconnectKind, DisconnectReason, EventHandlers,
    MercuryClient, MercuryError, MercuryOptions, MercuryTimeouts, OverflowPolicy,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn fast_backoff() -> MercuryOptions {
    MercuryOptions::default()
        .with_backoff_time_reset_ms(10)
        .with_backoff_time_max_ms(50)
}

fn client(server: &FakeMercury, credentials: Arc<RotatingToken>, handlers: EventHandlers) -> MercuryClient {
    MercuryClient::builder()
        .url(server.url())
        .credentials(credentials)
        .options(fast_backoff())
        .timeouts(test_timeouts())
        .event_handlers(handlers)
        .build()
        .expect("client builds")
}

fn recording_errors(errors: &Arc<Mutex<Vec<ConnectionError>>>) -> EventHandlers {
    let errors = errors.clone();
    EventHandlers::new().on_error(move |e| errors.lock().push(e))
}

fn recording_handlers(
    states: &Arc<Mutex<Vec<ConnectionState>>>,
    disconnects: &Arc<Mutex<Vec<DisconnectReason>>>,
) -> EventHandlers {
    let states = states.clone();
    let disconnects = disconnects.clone();
    EventHandlers::new()
        .on_state_change(move |state| states.lock().push(state))
        .on_disconnect(move |reason| disconnects.lock().push(reason))
}

#[tokio::test]
async fn test_connect_registers_and_disconnects() {
    let server = FakeMercury::start(vec![vec![Step::Register, Step::Serve]]).await;
    let states = Arc::new(Mutex::new(Vec::new()));
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let client = client(
        &server,
        Arc::new(RotatingToken::default()),
        recording_handlers(&states, &disconnects),
    );

    client.connect().await.expect("connect");
    assert!(client.is_connected());
    assert!(!client.is_connecting());
    assert_eq!(server.tokens(), vec!["token-0"]);

    client.disconnect().await;
    assert!(!client.is_connected());
    assert_eq!(
        *states.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
    let disconnects = disconnects.lock();
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].kind, DisconnectKind::Requested);
}

#[tokio::test]
async fn test_connect_when_connected_is_immediate() {
    let server = FakeMercury::start(vec![vec![Step::Register, Step::Serve]]).await;
    let client = client(&server, Arc::new(RotatingToken::default()), EventHandlers::new());

    let (a, b) = tokio::join!(client.connect(), client.connect());
    a.expect("first connect");
    b.expect("second connect");
    client.connect().await.expect("third connect");

    assert_eq!(server.connections(), 1);
    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_allows_reconnect() {
    let server = FakeMercury::start(vec![vec![Step::Register, Step::Serve]]).await;
    let client = client(&server, Arc::new(RotatingToken::default()), EventHandlers::new());

    client.disconnect().await;
    client.connect().await.expect("connect");
    client.disconnect().await;
    client.disconnect().await;
    assert!(!client.is_connected());

    client.connect().await.expect("connect again");
    assert!(client.is_connected());
    assert_eq!(server.connections(), 2);
    client.disconnect().await;
}

#[tokio::test]
async fn test_events_stay_ordered_across_reconnect() {
    let server = FakeMercury::start(vec![
        vec![
            Step::Register,
            Step::Send(event(1, "conversation.activity")),
            Step::Send(event(2, "conversation.activity")),
            Step::Drop,
        ],
        vec![
            Step::Register,
            Step::Send(event(2, "conversation.activity")),
            Step::Send(event(3, "conversation.activity")),
            Step::Serve,
        ],
    ])
    .await;
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let client = client(
        &server,
        Arc::new(RotatingToken::default()),
        recording_handlers(&Arc::new(Mutex::new(Vec::new())), &disconnects),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let by_type = Arc::new(Mutex::new(0));
    {
        let seen = seen.clone();
        client.on("event", move |envelope| {
            seen.lock().push(envelope.sequence_number.unwrap_or_default());
        });
        let by_type = by_type.clone();
        client.on("event:conversation.activity", move |_| *by_type.lock() += 1);
    }

    client.connect().await.expect("connect");
    assert!(wait_for(|| seen.lock().len() >= 3).await, "saw {:?}", seen.lock());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert_eq!(*by_type.lock(), 3);
    assert_eq!(server.connections(), 2);
    assert_eq!(disconnects.lock()[0].kind, DisconnectKind::Transient);
    client.disconnect().await;
}

#[tokio::test]
async fn test_auth_failure_refreshes_token() {
    let server = FakeMercury::start(vec![
        vec![Step::Close(4401, "unauthorized")],
        vec![Step::Register, Step::Serve],
    ])
    .await;
    let credentials = Arc::new(RotatingToken::default());
    let client = client(&server, credentials.clone(), EventHandlers::new());

    client.connect().await.expect("connect after refresh");

    assert_eq!(server.tokens(), vec!["token-0", "token-1"]);
    assert_eq!(credentials.refreshes(), 1);
    assert_eq!(client.reconnect_attempts(), 0);
    client.disconnect().await;
}

#[tokio::test]
async fn test_failed_refresh_counts_toward_retries() {
    let server = FakeMercury::start(vec![vec![Step::Close(4401, "unauthorized")]]).await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let errors = errors.clone();
        EventHandlers::new().on_error(move |e| errors.lock().push(e))
    };
    let client = MercuryClient::builder()
        .url(server.url())
        .credentials(Arc::new(RotatingToken::failing_refresh()))
        .options(fast_backoff().with_max_retries(Some(1)))
        .timeouts(test_timeouts())
        .event_handlers(handlers)
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, MercuryError::AuthenticationError(_)), "{:?}", err);
    assert_eq!(server.connections(), 2);

    let errors = errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].recoverable);
    assert!(!errors[1].recoverable);
    assert_eq!(errors[1].attempt, 2);
}

#[tokio::test]
async fn test_protocol_error_is_not_retried() {
    let server = FakeMercury::start(vec![vec![Step::Close(4403, "forbidden")]]).await;
    let client = client(&server, Arc::new(RotatingToken::default()), EventHandlers::new());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, MercuryError::ProtocolError(_)), "{:?}", err);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connections(), 1);
    assert!(!client.is_connected());
    assert!(!client.is_connecting());
}

#[tokio::test]
async fn test_replaced_connection_stops_reconnecting() {
    let server = FakeMercury::start(vec![vec![Step::Register, Step::Close(4000, "replaced")]]).await;
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let client = client(
        &server,
        Arc::new(RotatingToken::default()),
        recording_handlers(&Arc::new(Mutex::new(Vec::new())), &disconnects),
    );

    client.connect().await.expect("connect");
    assert!(wait_for(|| !disconnects.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(disconnects.lock()[0].kind, DisconnectKind::Replaced);
    assert!(!disconnects.lock()[0].will_reconnect());
    assert_eq!(server.connections(), 1);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_ping_pong_reports_latency() {
    let server = FakeMercury::start(vec![vec![Step::Register, Step::Serve]]).await;
    let latencies = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let latencies = latencies.clone();
        EventHandlers::new().on_ping_pong_latency(move |d| latencies.lock().push(d))
    };
    let client = client(&server, Arc::new(RotatingToken::default()), handlers);

    client.connect().await.expect("connect");
    assert!(wait_for(|| !latencies.lock().is_empty()).await);
    client.disconnect().await;
}

#[tokio::test]
async fn test_missing_pong_reconnects() {
    let server = FakeMercury::start(vec![
        vec![Step::Register, Step::Ignore],
        vec![Step::Register, Step::Serve],
    ])
    .await;
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let client = MercuryClient::builder()
        .url(server.url())
        .credentials(Arc::new(RotatingToken::default()))
        .options(fast_backoff())
        .timeouts(
            mercury_link::MercuryTimeouts::builder()
                .pong_timeout(Duration::from_millis(200))
                .force_close_delay(Duration::from_millis(200))
                .build(),
        )
        .event_handlers(recording_handlers(&Arc::new(Mutex::new(Vec::new())), &disconnects))
        .build()
        .unwrap();

    client.connect().await.expect("connect");
    assert!(wait_for(|| server.connections() == 2 && client.is_connected()).await);

    let first = disconnects.lock()[0].clone();
    assert_eq!(first.message, "Pong not received");
    assert_eq!(first.code, Some(1000));
    assert_eq!(first.kind, DisconnectKind::Transient);
    client.disconnect().await;
}

#[tokio::test]
async fn test_registration_status_exposes_cluster_urls() {
    let server = FakeMercury::start(vec![vec![
        Step::Send(serde_json::json!({
            "data": {
                "eventType": "mercury.registration_status",
                "localClusterServiceUrls": {"mercuryApiServiceClusterUrl": "https://mercury-api.local"}
            }
        })),
        Step::Serve,
    ]])
    .await;
    let client = client(&server, Arc::new(RotatingToken::default()), EventHandlers::new());

    client.connect().await.expect("connect");
    let urls = client.local_cluster_service_urls().expect("cluster urls");
    assert_eq!(urls["mercuryApiServiceClusterUrl"], "https://mercury-api.local");
    client.disconnect().await;
}

#[tokio::test]
async fn test_abandoned_connect_does_not_satisfy_later_connect() {
    let server = FakeMercury::start(vec![vec![Step::Register, Step::Serve]]).await;
    let client = client(&server, Arc::new(RotatingToken::default()), EventHandlers::new());

    let _ = tokio::time::timeout(Duration::from_micros(1), client.connect()).await;
    assert!(wait_for(|| client.is_connected()).await);
    client.disconnect().await;
    assert!(!client.is_connected());

    client.connect().await.expect("connect again");
    assert!(client.is_connected());
    assert_eq!(server.connections(), 2);
    client.disconnect().await;
}

#[tokio::test]
async fn test_overflow_during_registration_resynchronizes() {
    let server = FakeMercury::start(vec![
        vec![
            Step::Send(event(1, "conversation.activity")),
            Step::Send(event(2, "conversation.activity")),
            Step::Register,
            Step::Serve,
        ],
        vec![
            Step::Register,
            Step::Send(event(1, "conversation.activity")),
            Step::Send(event(2, "conversation.activity")),
            Step::Serve,
        ],
    ])
    .await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = MercuryClient::builder()
        .url(server.url())
        .credentials(Arc::new(RotatingToken::default()))
        .options(
            fast_backoff()
                .with_buffer_capacity(1)
                .with_overflow_policy(OverflowPolicy::Resynchronize),
        )
        .timeouts(test_timeouts())
        .event_handlers(recording_errors(&errors))
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        client.on("event", move |envelope| {
            seen.lock().push(envelope.sequence_number.unwrap_or_default());
        });
    }

    client.connect().await.expect("connect after resync");
    assert!(wait_for(|| seen.lock().len() >= 2).await, "saw {:?}", seen.lock());

    assert_eq!(*seen.lock(), vec![1, 2]);
    assert_eq!(server.connections(), 2);
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].recoverable);
    assert_eq!(errors[0].attempt, 1);
    drop(errors);
    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_during_backoff_cancels_pending_connect() {
    let server = FakeMercury::start(vec![vec![Step::Drop]]).await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(
        MercuryClient::builder()
            .url(server.url())
            .credentials(Arc::new(RotatingToken::default()))
            .options(
                MercuryOptions::default()
                    .with_backoff_time_reset_ms(300)
                    .with_backoff_time_max_ms(300),
            )
            .timeouts(test_timeouts())
            .event_handlers(recording_errors(&errors))
            .build()
            .unwrap(),
    );

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    assert!(wait_for(|| !errors.lock().is_empty()).await);
    client.disconnect().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, MercuryError::Cancelled(_)), "{:?}", err);
    assert!(!client.is_connecting());
    assert!(!client.is_connected());

    let attempts = server.connections();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.connections(), attempts);
}

#[tokio::test]
async fn test_registration_timeout_counts_as_failure() {
    let server = FakeMercury::start(vec![
        vec![Step::Ignore],
        vec![Step::Register, Step::Serve],
    ])
    .await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = MercuryClient::builder()
        .url(server.url())
        .credentials(Arc::new(RotatingToken::default()))
        .options(fast_backoff())
        .timeouts(
            MercuryTimeouts::builder()
                .registration_timeout(Duration::from_millis(200))
                .force_close_delay(Duration::from_millis(200))
                .build(),
        )
        .event_handlers(recording_errors(&errors))
        .build()
        .unwrap();

    client.connect().await.expect("connect on second attempt");

    assert_eq!(server.connections(), 2);
    assert_eq!(client.reconnect_attempts(), 0);
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].recoverable);
    assert_eq!(errors[0].attempt, 1);
    assert!(errors[0].message.contains("registration"), "{}", errors[0].message);
    drop(errors);
    client.disconnect().await;
}

#[tokio::test]
async fn test_initial_connection_cap_applies_before_first_registration() {
    let server = FakeMercury::start(vec![vec![Step::Drop]]).await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = MercuryClient::builder()
        .url(server.url())
        .credentials(Arc::new(RotatingToken::default()))
        .options(
            fast_backoff()
                .with_max_retries(Some(5))
                .with_initial_connection_max_retries(Some(1)),
        )
        .timeouts(test_timeouts())
        .event_handlers(recording_errors(&errors))
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(!err.is_fatal(), "{:?}", err);
    assert_eq!(server.connections(), 2);

    let errors = errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(!errors[1].recoverable);
    assert_eq!(errors[1].attempt, 2);
}

#[tokio::test]
async fn test_max_retries_applies_after_first_registration() {
    let server = FakeMercury::start(vec![
        vec![Step::Register, Step::Drop],
        vec![Step::Drop],
    ])
    .await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let client = MercuryClient::builder()
        .url(server.url())
        .credentials(Arc::new(RotatingToken::default()))
        .options(
            fast_backoff()
                .with_max_retries(Some(2))
                .with_initial_connection_max_retries(Some(0)),
        )
        .timeouts(test_timeouts())
        .event_handlers(recording_errors(&errors))
        .build()
        .unwrap();

    client.connect().await.expect("first connect");
    assert!(wait_for(|| errors.lock().iter().any(|e| !e.recoverable)).await);

    // One registered connection, then three failed reconnects.
    assert_eq!(server.connections(), 4);
    assert_eq!(errors.lock().len(), 3);
    assert!(!client.is_connected());
}
