use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use biostar_session::events::{BoxError, EventBus};
use biostar_session::requests::user::get_user;
use biostar_session::store::{lookup_session_client, session_client_store};
use biostar_session::{
    ClientConfig, ConnectionState, PushEvent, PushEventKind, SessionClient, SessionError,
};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_millis(50);

struct MockBioStar {
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    events_start_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    user_calls: AtomicUsize,
    socket_opens: AtomicUsize,
    socket_closes: AtomicUsize,
    reject_login: AtomicBool,
    omit_session_header: AtomicBool,
    expire_sessions: AtomicBool,
    failing_probes: AtomicUsize,
    failing_event_starts: AtomicUsize,
    auth_frames: Mutex<Vec<String>>,
    events: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

impl MockBioStar {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        Arc::new(Self {
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            events_start_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            user_calls: AtomicUsize::new(0),
            socket_opens: AtomicUsize::new(0),
            socket_closes: AtomicUsize::new(0),
            reject_login: AtomicBool::new(false),
            omit_session_header: AtomicBool::new(false),
            expire_sessions: AtomicBool::new(false),
            failing_probes: AtomicUsize::new(0),
            failing_event_starts: AtomicUsize::new(0),
            auth_frames: Mutex::new(Vec::new()),
            events,
            kick,
        })
    }

    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn push(&self, event: Value) {
        self.push_raw(&event.to_string());
    }

    fn push_raw(&self, frame: &str) {
        let _ = self.events.send(frame.to_string());
    }

    fn drop_sockets(&self) {
        let _ = self.kick.send(());
    }
}

async fn login_handler(State(mock): State<Arc<MockBioStar>>) -> Response {
    let n = mock.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if mock.reject_login.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"Response": {"code": "10", "message": "Login failed"}})),
        )
            .into_response();
    }
    if mock.omit_session_header.load(Ordering::SeqCst) {
        return Json(json!({"User": {"user_id": "1"}})).into_response();
    }

    (
        [("bs-session-id", format!("sess-{n}"))],
        Json(json!({"User": {"user_id": "1", "name": "Administrator"}})),
    )
        .into_response()
}

async fn logout_handler(State(mock): State<Arc<MockBioStar>>) -> StatusCode {
    mock.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

async fn events_start_handler(State(mock): State<Arc<MockBioStar>>) -> Json<Value> {
    mock.events_start_calls.fetch_add(1, Ordering::SeqCst);
    if take_one(&mock.failing_event_starts) {
        return Json(json!({"Response": {"code": "51", "message": "Event start failed"}}));
    }
    Json(json!({"Response": {"code": "0", "message": "Success"}}))
}

async fn users_handler(State(mock): State<Arc<MockBioStar>>) -> Response {
    mock.probe_calls.fetch_add(1, Ordering::SeqCst);
    if take_one(&mock.failing_probes) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({"UserCollection": {"total": "1", "rows": [{"user_id": "1"}]}})).into_response()
}

async fn user_handler(
    State(mock): State<Arc<MockBioStar>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    mock.user_calls.fetch_add(1, Ordering::SeqCst);
    if headers.get("bs-session-id").is_none() || mock.expire_sessions.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"Response": {"code": "11", "message": "Session expired"}})),
        )
            .into_response();
    }
    Json(json!({"User": {"user_id": id, "name": "Administrator"}})).into_response()
}

async fn ws_handler(State(mock): State<Arc<MockBioStar>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        mock.socket_opens.fetch_add(1, Ordering::SeqCst);
        run_ws_session(socket, &mock).await;
        mock.socket_closes.fetch_add(1, Ordering::SeqCst);
    })
    .into_response()
}

async fn run_ws_session(mut socket: WebSocket, mock: &MockBioStar) {
    let mut events = mock.events.subscribe();
    let mut kick = mock.kick.subscribe();

    match socket.recv().await {
        Some(Ok(Message::Text(frame))) => mock.auth_frames.lock().push(frame),
        _ => return,
    }
    let ack = json!({"Response": {"code": "0", "message": "Success"}}).to_string();
    if socket.send(Message::Text(ack)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            event = events.recv() => {
                let Ok(event) = event else { return };
                if socket.send(Message::Text(event)).await.is_err() {
                    return;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn spawn_server(mock: Arc<MockBioStar>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/events/start", post(events_start_handler))
        .route("/api/users", get(users_handler))
        .route("/api/users/:id", get(user_handler))
        .route("/wsapi", get(ws_handler))
        .with_state(mock);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server should run");
    });
    (addr, task)
}

fn local_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(addr.to_string(), "admin", SecretString::new("secret".to_string()))
        .with_local_mode(true)
        .with_keep_alive_interval(None)
        .with_reconnect_delay(RECONNECT_DELAY)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(WAIT_LIMIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn access_event(user_id: &str) -> Value {
    json!({"Event": {"event_type_id": {"code": "4867"}, "user_id": {"user_id": user_id}}})
}

fn recording_subscriber(seen: &Arc<Mutex<Vec<Value>>>) -> impl Fn(&PushEvent) + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |event: &PushEvent| seen.lock().push(event.raw().clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_login_leaves_client_disconnected() {
    let mock = MockBioStar::new();
    mock.reject_login.store(true, Ordering::SeqCst);
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;

    let client = SessionClient::new(local_config(addr)).expect("build client");
    let error = client.connect().await.expect_err("login is rejected");
    assert!(error.is_authentication(), "unexpected error: {error:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.connected());

    let _subscription = client.subscribe(|_| {});
    sleep(Duration::from_millis(100)).await;
    assert!(!client.listening());
    assert_eq!(MockBioStar::count(&mock.socket_opens), 0);

    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_need_a_session() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    let error = client
        .request(get_user("1"))
        .await
        .expect_err("no session yet");
    assert!(error.is_authentication());
    assert_eq!(MockBioStar::count(&mock.user_calls), 0);

    client.connect().await.expect("connect");
    assert!(client.connected());
    let user = client.request(get_user("1")).await.expect("get user");
    assert_eq!(user["user_id"], json!("1"));
    assert_eq!(MockBioStar::count(&mock.user_calls), 1);

    client.disconnect().await;
    assert!(!client.connected());
    assert_eq!(MockBioStar::count(&mock.logout_calls), 1);
    let error = client
        .request(get_user("1"))
        .await
        .expect_err("session released");
    assert!(error.is_authentication());
    assert_eq!(MockBioStar::count(&mock.user_calls), 1);

    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_subscriber_does_not_block_delivery() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");
    client.connect().await.expect("connect");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _failing = client.subscribe(|_| panic!("subscriber failure"));
    let _recording = client.subscribe(recording_subscriber(&seen));
    assert!(client.listening());

    wait_until("event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 1
    })
    .await;
    assert_eq!(*mock.auth_frames.lock(), vec!["bs-session-id=sess-1".to_string()]);

    mock.push(access_event("7"));
    mock.push(access_event("8"));
    wait_until("both events", || seen.lock().len() == 2).await;
    assert_eq!(*seen.lock(), vec![access_event("7"), access_event("8")]);

    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribing_one_duplicate_keeps_the_other() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");
    client.connect().await.expect("connect");

    let calls = Arc::new(AtomicUsize::new(0));
    let callback: biostar_session::session::client::EventCallback = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_: &PushEvent| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    let first = client.subscribe_shared(Arc::clone(&callback));
    let _second = client.subscribe_shared(callback);
    first.unsubscribe();
    assert_eq!(client.subscriber_count(), 1);
    assert!(client.listening());

    wait_until("event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 1
    })
    .await;
    mock.push(access_event("7"));
    wait_until("one delivery", || calls.load(Ordering::SeqCst) >= 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_is_open_only_with_subscribers_while_connected() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    client.connect().await.expect("connect");
    sleep(Duration::from_millis(100)).await;
    assert!(!client.listening());
    assert_eq!(MockBioStar::count(&mock.socket_opens), 0);

    let subscription = client.subscribe(|_| {});
    assert!(client.listening());
    wait_until("socket open", || MockBioStar::count(&mock.socket_opens) == 1).await;

    subscription.unsubscribe();
    assert!(!client.listening());
    wait_until("socket close", || MockBioStar::count(&mock.socket_closes) == 1).await;

    let _subscription = client.subscribe(|_| {});
    wait_until("socket reopen", || MockBioStar::count(&mock.socket_opens) == 2).await;

    client.disconnect().await;
    assert!(!client.listening());
    assert_eq!(client.subscriber_count(), 1);
    wait_until("socket close after disconnect", || {
        MockBioStar::count(&mock.socket_closes) == 2
    })
    .await;

    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_loss_reconnects_and_resumes_delivery() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let connected_calls = Arc::new(AtomicUsize::new(0));
    let client = {
        let connected_calls = Arc::clone(&connected_calls);
        SessionClient::builder(local_config(addr))
            .on_connected(move || {
                connected_calls.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .expect("build client")
    };

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _subscription = client.subscribe(recording_subscriber(&seen));
    client.connect().await.expect("connect");
    assert_eq!(connected_calls.load(Ordering::SeqCst), 1);
    wait_until("event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 1
    })
    .await;

    mock.drop_sockets();
    wait_until("second event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 2
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.connected());
    assert_eq!(MockBioStar::count(&mock.login_calls), 2);
    assert_eq!(connected_calls.load(Ordering::SeqCst), 2);
    wait_until("stale session logout", || {
        MockBioStar::count(&mock.logout_calls) == 1
    })
    .await;
    assert_eq!(
        *mock.auth_frames.lock(),
        vec!["bs-session-id=sess-1".to_string(), "bs-session-id=sess-2".to_string()]
    );

    mock.push(access_event("9"));
    wait_until("event after reconnect", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0], access_event("9"));

    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_keep_alive_probe_reconnects_once() {
    let mock = MockBioStar::new();
    mock.failing_probes.store(1, Ordering::SeqCst);
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let config = local_config(addr).with_keep_alive_interval(Some(Duration::from_millis(200)));
    let client = SessionClient::new(config).expect("build client");

    client.connect().await.expect("connect");
    wait_until("reconnect after failed probe", || {
        MockBioStar::count(&mock.login_calls) == 2 && client.state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(MockBioStar::count(&mock.probe_calls), 1);

    // The interval restarts on reconnect; no probe fires right away.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(MockBioStar::count(&mock.probe_calls), 1);

    wait_until("next probe", || MockBioStar::count(&mock.probe_calls) >= 2).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(MockBioStar::count(&mock.login_calls), 2);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_stops_a_running_reconnect() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    let _subscription = client.subscribe(|_| {});
    client.connect().await.expect("connect");
    wait_until("event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 1
    })
    .await;

    mock.reject_login.store(true, Ordering::SeqCst);
    mock.drop_sockets();
    wait_until("failing reconnect attempts", || {
        MockBioStar::count(&mock.login_calls) >= 3
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert!(!client.connected());

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    sleep(Duration::from_millis(100)).await;
    let attempts = MockBioStar::count(&mock.login_calls);
    sleep(RECONNECT_DELAY * 6).await;
    assert_eq!(MockBioStar::count(&mock.login_calls), attempts);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_bus_receives_forwarded_events() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bus = EventBus::new();
    bus.listen(PushEventKind::Access, move |event| {
        let tx = tx.clone();
        async move {
            tx.send(event).map_err(|err| Box::new(err) as BoxError)
        }
    });
    let forwarder = bus.forward_from(&client);

    client.connect().await.expect("connect");
    wait_until("event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 1
    })
    .await;

    mock.push(json!({"Door": {"door_id": {"id": "3"}}}));
    mock.push(access_event("11"));
    let received = timeout(WAIT_LIMIT, rx.recv())
        .await
        .expect("timed out waiting for bus event")
        .expect("bus channel open");
    assert_eq!(received.kind(), PushEventKind::Access);
    assert_eq!(received.raw(), &access_event("11"));

    forwarder.stop().await;
    assert_eq!(client.subscriber_count(), 0);
    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_reuses_clients_until_generation_changes() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let store = session_client_store();

    let first = lookup_session_client(&store, "site-a", local_config(addr))
        .await
        .expect("first lookup");
    let again = lookup_session_client(&store, "site-a", local_config(addr))
        .await
        .expect("cached lookup");
    assert!(first.connected() && again.connected());
    assert_eq!(MockBioStar::count(&mock.login_calls), 1);

    store.advance_generation();
    let fresh = lookup_session_client(&store, "site-a", local_config(addr))
        .await
        .expect("lookup after generation change");
    assert!(fresh.connected());
    assert_eq!(MockBioStar::count(&mock.login_calls), 2);

    wait_until("old client disposed", || {
        first.state() == ConnectionState::Disconnected
    })
    .await;
    wait_until("old session logged out", || {
        MockBioStar::count(&mock.logout_calls) == 1
    })
    .await;

    fresh.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_without_session_header_fails_connect() {
    let mock = MockBioStar::new();
    mock.omit_session_header.store(true, Ordering::SeqCst);
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    let error = client.connect().await.expect_err("no session header");
    assert!(
        matches!(error, SessionError::Protocol(ref message) if message.contains("bs-session-id")),
        "unexpected error: {error:?}"
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.connected());
    assert_eq!(MockBioStar::count(&mock.login_calls), 1);

    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_response_maps_to_authentication_error() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");
    client.connect().await.expect("connect");

    mock.expire_sessions.store(true, Ordering::SeqCst);
    let error = client
        .request(get_user("1"))
        .await
        .expect_err("session expired remotely");
    assert!(error.is_authentication(), "unexpected error: {error:?}");
    assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
    assert_eq!(MockBioStar::count(&mock.user_calls), 1);

    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_event_stream_start_reconnects_once() {
    let mock = MockBioStar::new();
    mock.failing_event_starts.store(1, Ordering::SeqCst);
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _subscription = client.subscribe(recording_subscriber(&seen));
    client.connect().await.expect("connect");

    wait_until("event stream restarted", || {
        MockBioStar::count(&mock.events_start_calls) == 2
    })
    .await;
    wait_until("failed socket closed", || {
        MockBioStar::count(&mock.socket_closes) >= 1
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(MockBioStar::count(&mock.login_calls), 2);
    assert_eq!(MockBioStar::count(&mock.socket_opens), 2);

    mock.push(access_event("5"));
    wait_until("event on new socket", || seen.lock().len() == 1).await;
    sleep(RECONNECT_DELAY * 4).await;
    assert_eq!(MockBioStar::count(&mock.login_calls), 2);
    assert_eq!(MockBioStar::count(&mock.events_start_calls), 2);

    client.disconnect().await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_is_skipped_without_reconnecting() {
    let mock = MockBioStar::new();
    let (addr, server_task) = spawn_server(Arc::clone(&mock)).await;
    let client = SessionClient::new(local_config(addr)).expect("build client");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _subscription = client.subscribe(recording_subscriber(&seen));
    client.connect().await.expect("connect");
    wait_until("event stream start", || {
        MockBioStar::count(&mock.events_start_calls) == 1
    })
    .await;

    mock.push_raw("not json");
    mock.push(access_event("12"));
    wait_until("event after malformed frame", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0], access_event("12"));

    sleep(RECONNECT_DELAY * 4).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(MockBioStar::count(&mock.login_calls), 1);
    assert_eq!(MockBioStar::count(&mock.logout_calls), 0);
    assert_eq!(MockBioStar::count(&mock.socket_opens), 1);

    client.disconnect().await;
    server_task.abort();
}
