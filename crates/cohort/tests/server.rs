//! Integration tests for one worker: error boundary, session middleware,
//! WebSocket and long-polling connections.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::extract::CookieJar;
use cohort::prelude::*;
use cohort::HtmlErrorRenderer;
use cohort_protocol::{ClientMessage, Envelope, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);
const COOKIE_NAME: &str = "cohort.sid";

// =========================================================================
// Application routes used by the tests
// =========================================================================

fn app_routes() -> Router {
    Router::new()
        .route("/whoami", get(whoami))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/boom", get(boom))
        .route("/markup", get(markup))
        .route("/panic", get(panicking))
        .route("/echo", post(echo))
}

async fn whoami(session: CurrentSession) -> String {
    match session.record() {
        Some(record) => record.payload["user"].as_str().unwrap_or("?").to_string(),
        None => "anonymous".to_string(),
    }
}

async fn login(
    Extension(sessions): Extension<Sessions<MemorySessionStore>>,
    jar: CookieJar,
) -> Result<(CookieJar, String), AppError> {
    let (id, cookie) = sessions.login(json!({ "user": "ada" })).await?;
    Ok((jar.add(cookie), id.as_str().to_string()))
}

async fn logout(
    Extension(sessions): Extension<Sessions<MemorySessionStore>>,
    Authenticated(record): Authenticated,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), AppError> {
    let removal = sessions.logout(&record.id).await?;
    Ok((jar.add(removal), StatusCode::NO_CONTENT))
}

async fn boom() -> Result<String, AppError> {
    Err(AppError::new("database exploded"))
}

async fn markup() -> Result<String, AppError> {
    Err(AppError::with_status(
        StatusCode::BAD_REQUEST,
        "<script>alert(1)</script>",
    ))
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(body)
}

async fn panicking() -> String {
    let fail = true;
    if fail {
        panic!("secret internals");
    }
    "unreachable".to_string()
}

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestWorker {
    addr: SocketAddr,
    router: Router,
    sessions: Sessions<MemorySessionStore>,
    broadcaster: Broadcaster<MemoryBus>,
    store: MemorySessionStore,
}

impl TestWorker {
    /// `Cookie` header value for a fresh session of `user`.
    async fn login(&self, user: &str) -> String {
        let (_, cookie) = self.sessions.login(json!({ "user": user })).await.unwrap();
        format!("{}={}", cookie.name(), cookie.value())
    }

    async fn request(&self, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn get(&self, uri: &str, cookie: Option<&str>) -> (StatusCode, HeaderMap, String) {
        self.request(with_cookie(Request::get(uri), cookie).body(Body::empty()).unwrap())
            .await
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        session: SessionSettings {
            cookie_name: COOKIE_NAME.into(),
            secret: "integration-secret".into(),
            ttl: Duration::from_secs(3600),
            ..SessionSettings::default()
        },
        poll_wait: Duration::from_secs(2),
        ..WorkerConfig::default()
    }
}

async fn start_worker(config: WorkerConfig) -> TestWorker {
    let store = MemorySessionStore::new(config.session.ttl);
    let broker = MemoryBroker::new();
    let worker = WorkerBuilder::new(config)
        .worker_id(WorkerId(4))
        .routes(app_routes())
        .error_renderer(HtmlErrorRenderer)
        .build(store.clone(), broker.client())
        .await
        .expect("worker should build");

    let test_worker = TestWorker {
        addr: worker.local_addr(),
        router: worker.router(),
        sessions: worker.sessions().clone(),
        broadcaster: worker.broadcaster().clone(),
        store,
    };
    tokio::spawn(worker.run());
    test_worker
}

fn with_cookie(
    builder: axum::http::request::Builder,
    cookie: Option<&str>,
) -> axum::http::request::Builder {
    match cookie {
        Some(cookie) => builder.header(header::COOKIE, cookie),
        None => builder,
    }
}

async fn connect(addr: SocketAddr, cookie: Option<&str>) -> Result<ClientWs, tungstenite::Error> {
    let mut request = format!("ws://{addr}/realtime").into_client_request().unwrap();
    if let Some(cookie) = cookie {
        request
            .headers_mut()
            .insert(tungstenite::http::header::COOKIE, cookie.parse().unwrap());
    }
    tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
}

async fn send(ws: &mut ClientWs, seq: u64, message: ClientMessage) {
    let bytes = serde_json::to_vec(&Envelope {
        seq,
        timestamp: 0,
        message,
    })
    .unwrap();
    ws.send(Message::Binary(bytes.into())).await.unwrap();
}

async fn recv(ws: &mut ClientWs) -> Envelope<ServerMessage> {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("ws error");
        if msg.is_text() || msg.is_binary() {
            return serde_json::from_slice(&msg.into_data()).expect("decode");
        }
    }
}

fn assert_rejected_with_401(result: Result<ClientWs, tungstenite::Error>) {
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        Err(other) => panic!("expected an HTTP 401 handshake error, got {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

// =========================================================================
// Error boundary
// =========================================================================

#[tokio::test]
async fn test_unknown_route_renders_not_found_page() {
    let worker = start_worker(config()).await;

    let (status, headers, body) = worker.get("/definitely/not/here", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("<h1>Not Found</h1>"));
    assert!(
        headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );
}

#[tokio::test]
async fn test_wrong_method_renders_not_found_page() {
    let worker = start_worker(config()).await;

    for uri in ["/realtime/transports", "/whoami"] {
        let (status, _, body) = worker
            .request(Request::post(uri).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "POST {uri}");
        assert!(body.contains("<h1>Not Found</h1>"), "POST {uri}: {body}");
    }
}

#[tokio::test]
async fn test_extractor_rejection_renders_error_page() {
    let worker = start_worker(config()).await;

    let (status, headers, body) = worker
        .request(
            Request::post("/echo")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("<h1>Bad Request</h1>"));
    assert!(!body.contains("Failed to parse"));
    assert!(
        headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );

    // Well-formed requests still reach the handler.
    let (status, _, body) = worker
        .request(
            Request::post("/echo")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"a":1}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"a":1}"#);
}

#[tokio::test]
async fn test_responses_carry_hardening_headers() {
    let worker = start_worker(config()).await;

    let (_, headers, _) = worker.get("/whoami", None).await;

    assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
    assert_eq!(headers["x-xss-protection"], "1; mode=block");
    assert!(headers.get("x-powered-by").is_none());
}

#[tokio::test]
async fn test_handler_error_without_status_is_500() {
    let worker = start_worker(config()).await;

    let (status, _, body) = worker.get("/boom", None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("database exploded"));
}

#[tokio::test]
async fn test_handler_error_message_is_escaped() {
    let worker = start_worker(config()).await;

    let (status, _, body) = worker.get("/markup", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
    assert!(!body.contains("<script>"));
}

#[tokio::test]
async fn test_handler_panic_is_500_without_detail() {
    let worker = start_worker(config()).await;

    let (status, _, body) = worker.get("/panic", None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Internal Server Error"));
    assert!(!body.contains("secret internals"));

    // The worker survives.
    let (status, _, _) = worker.get("/whoami", None).await;
    assert_eq!(status, StatusCode::OK);
}

// =========================================================================
// Sessions on HTTP
// =========================================================================

#[tokio::test]
async fn test_login_sets_cookie_that_authenticates() {
    let worker = start_worker(config()).await;

    let (status, headers, _) = worker
        .request(Request::post("/login").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);

    let set_cookie = headers[header::SET_COOKIE].to_str().unwrap().to_string();
    assert!(set_cookie.starts_with("cohort.sid="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("Max-Age=3600"));

    let cookie = set_cookie.split(';').next().unwrap();
    let (_, _, body) = worker.get("/whoami", Some(cookie)).await;
    assert_eq!(body, "ada");
}

#[tokio::test]
async fn test_login_secure_cookie_behind_plain_http_proxy_keeps_secure() {
    let mut config = config();
    config.session.secure = true;
    let worker = start_worker(config).await;

    let (status, headers, _) = worker
        .request(
            Request::post("/login")
                .header("x-forwarded-proto", "http")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    let set_cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.contains("Secure"), "{set_cookie}");
}

#[tokio::test]
async fn test_http_without_cookie_is_anonymous() {
    let worker = start_worker(config()).await;
    let (status, _, body) = worker.get("/whoami", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "anonymous");
}

#[tokio::test]
async fn test_http_with_forged_cookie_is_anonymous() {
    let worker = start_worker(config()).await;
    let (status, _, body) = worker
        .get("/whoami", Some("cohort.sid=s:0123456789abcdef.Zm9yZ2Vk"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "anonymous");
}

#[tokio::test]
async fn test_logout_clears_cookie_and_session() {
    let worker = start_worker(config()).await;
    let cookie = worker.login("grace").await;

    let (status, headers, _) = worker
        .request(
            with_cookie(Request::post("/logout"), Some(&cookie))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(headers[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

    let (_, _, body) = worker.get("/whoami", Some(&cookie)).await;
    assert_eq!(body, "anonymous");
}

#[tokio::test]
async fn test_store_outage_with_cookie_is_503() {
    let worker = start_worker(config()).await;
    let cookie = worker.login("ada").await;
    worker.store.set_unavailable(true);

    let (status, _, body) = worker.get("/whoami", Some(&cookie)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("Session store unavailable"));

    // Without a cookie the store is never asked.
    let (status, _, _) = worker.get("/whoami", None).await;
    assert_eq!(status, StatusCode::OK);

    worker.store.set_unavailable(false);
    let (_, _, body) = worker.get("/whoami", Some(&cookie)).await;
    assert_eq!(body, "ada");
}

// =========================================================================
// WebSocket
// =========================================================================

#[tokio::test]
async fn test_websocket_without_cookie_is_rejected() {
    let worker = start_worker(config()).await;
    assert_rejected_with_401(connect(worker.addr, None).await);
}

#[tokio::test]
async fn test_websocket_and_http_disagree_on_destroyed_session() {
    let worker = start_worker(config()).await;
    let (id, cookie) = worker.sessions.login(json!({ "user": "ada" })).await.unwrap();
    let cookie = format!("{}={}", cookie.name(), cookie.value());
    worker.sessions.logout(&id).await.unwrap();

    // Same identifier: anonymous over HTTP, refused as a connection.
    let (status, _, body) = worker.get("/whoami", Some(&cookie)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "anonymous");
    assert_rejected_with_401(connect(worker.addr, Some(&cookie)).await);
}

#[tokio::test]
async fn test_websocket_with_session_gets_welcome_and_room_events() {
    let worker = start_worker(config()).await;
    let cookie = worker.login("ada").await;

    let mut ws = connect(worker.addr, Some(&cookie)).await.expect("should connect");

    let welcome = recv(&mut ws).await;
    assert_eq!(welcome.seq, 0);
    assert!(matches!(
        welcome.message,
        ServerMessage::Welcome { worker_id: WorkerId(4), .. }
    ));

    send(&mut ws, 0, ClientMessage::Heartbeat { client_time: 99 }).await;
    let ack = recv(&mut ws).await;
    assert!(matches!(ack.message, ServerMessage::HeartbeatAck { client_time: 99, .. }));

    send(&mut ws, 1, ClientMessage::Join { room: "blue".into() }).await;
    assert_eq!(recv(&mut ws).await.message, ServerMessage::Joined { room: "blue".into() });

    worker
        .broadcaster
        .to_room("blue", "chat", json!({ "text": "hello" }))
        .await
        .unwrap();
    let event = recv(&mut ws).await;
    assert_eq!(
        event.message,
        ServerMessage::Event {
            event: "chat".into(),
            data: json!({ "text": "hello" }),
        }
    );
    assert_eq!(event.seq, 3);
}

#[tokio::test]
async fn test_websocket_session_delivery_reaches_every_tab() {
    let worker = start_worker(config()).await;
    let (ada_id, ada) = worker.sessions.login(json!({ "user": "ada" })).await.unwrap();
    let ada = format!("{}={}", ada.name(), ada.value());
    let grace = worker.login("grace").await;

    let mut tab1 = connect(worker.addr, Some(&ada)).await.unwrap();
    let mut tab2 = connect(worker.addr, Some(&ada)).await.unwrap();
    let mut other = connect(worker.addr, Some(&grace)).await.unwrap();
    for ws in [&mut tab1, &mut tab2, &mut other] {
        recv(ws).await;
    }

    worker
        .broadcaster
        .to_session(&ada_id, "notice", json!(1))
        .await
        .unwrap();

    for ws in [&mut tab1, &mut tab2] {
        assert!(matches!(recv(ws).await.message, ServerMessage::Event { .. }));
    }

    // Grace only sees what is sent to everyone.
    worker.broadcaster.to_all("tick", json!(2)).await.unwrap();
    let message = recv(&mut other).await.message;
    assert_eq!(
        message,
        ServerMessage::Event {
            event: "tick".into(),
            data: json!(2)
        }
    );
}

#[tokio::test]
async fn test_websocket_listen_only_client_outlives_idle_window() {
    let worker = start_worker(WorkerConfig {
        idle_timeout: Duration::from_secs(1),
        ..config()
    })
    .await;
    let cookie = worker.login("ada").await;
    let mut ws = connect(worker.addr, Some(&cookie)).await.unwrap();
    recv(&mut ws).await;

    // Three windows without a single client message; the client library
    // answers the worker's pings while it reads.
    for n in 0..6 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        worker.broadcaster.to_all("tick", json!(n)).await.unwrap();
        assert_eq!(
            recv(&mut ws).await.message,
            ServerMessage::Event {
                event: "tick".into(),
                data: json!(n)
            }
        );
    }

    send(&mut ws, 0, ClientMessage::Heartbeat { client_time: 5 }).await;
    assert!(matches!(
        recv(&mut ws).await.message,
        ServerMessage::HeartbeatAck { client_time: 5, .. }
    ));
}

#[tokio::test]
async fn test_websocket_client_that_never_answers_is_closed() {
    let worker = start_worker(WorkerConfig {
        idle_timeout: Duration::from_secs(1),
        ..config()
    })
    .await;
    let cookie = worker.login("ada").await;
    let mut ws = connect(worker.addr, Some(&cookie)).await.unwrap();
    recv(&mut ws).await;

    // Not reading means no Pong goes back.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "worker should have closed the connection");
}

// =========================================================================
// Long-polling
// =========================================================================

fn frame(seq: u64, message: ClientMessage) -> Body {
    Body::from(
        serde_json::to_vec(&Envelope {
            seq,
            timestamp: 0,
            message,
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn test_polling_open_poll_push_close() {
    let worker = start_worker(config()).await;
    let cookie = worker.login("ada").await;

    let (status, _, body) = worker
        .request(
            with_cookie(Request::post("/realtime/poll"), Some(&cookie))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let sid = serde_json::from_str::<Value>(&body).unwrap()["sid"]
        .as_str()
        .unwrap()
        .to_string();
    let path = format!("/realtime/poll/{sid}");

    let (status, _, body) = worker.get(&path, Some(&cookie)).await;
    assert_eq!(status, StatusCode::OK);
    let frames: Vec<Envelope<ServerMessage>> = serde_json::from_str(&body).unwrap();
    assert!(matches!(frames[0].message, ServerMessage::Welcome { .. }));

    let (status, _, _) = worker
        .request(
            with_cookie(Request::post(&path), Some(&cookie))
                .body(frame(0, ClientMessage::Join { room: "red".into() }))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, _, body) = worker.get(&path, Some(&cookie)).await;
    let frames: Vec<Envelope<ServerMessage>> = serde_json::from_str(&body).unwrap();
    assert_eq!(frames[0].message, ServerMessage::Joined { room: "red".into() });

    let (status, _, _) = worker
        .request(
            with_cookie(Request::delete(&path), Some(&cookie))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = worker.get(&path, Some(&cookie)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_polling_requires_a_session() {
    let worker = start_worker(config()).await;
    let (status, _, _) = worker
        .request(Request::post("/realtime/poll").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_polling_with_another_session_is_not_found() {
    let worker = start_worker(config()).await;
    let ada = worker.login("ada").await;
    let mallory = worker.login("mallory").await;

    let (_, _, body) = worker
        .request(
            with_cookie(Request::post("/realtime/poll"), Some(&ada))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let sid = serde_json::from_str::<Value>(&body).unwrap()["sid"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, _, _) = worker
        .get(&format!("/realtime/poll/{sid}"), Some(&mallory))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disabled_polling_is_not_found() {
    let worker = start_worker(WorkerConfig {
        transports: vec![cohort::transport::TransportKind::WebSocket],
        ..config()
    })
    .await;
    let cookie = worker.login("ada").await;

    let (status, _, _) = worker
        .request(
            with_cookie(Request::post("/realtime/poll"), Some(&cookie))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =========================================================================
// CORS
// =========================================================================

#[tokio::test]
async fn test_cors_allows_listed_origin_with_credentials() {
    let worker = start_worker(WorkerConfig {
        allowed_origins: vec![axum::http::HeaderValue::from_static("http://app.test")],
        ..config()
    })
    .await;

    let (_, headers, _) = worker
        .request(
            Request::get("/whoami")
                .header(header::ORIGIN, "http://app.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://app.test");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");

    let (_, headers, _) = worker
        .request(
            Request::get("/whoami")
                .header(header::ORIGIN, "http://evil.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
}

#[tokio::test]
async fn test_no_origins_means_no_cors_headers() {
    let worker = start_worker(config()).await;
    let (_, headers, _) = worker
        .request(
            Request::get("/whoami")
                .header(header::ORIGIN, "http://app.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
}
