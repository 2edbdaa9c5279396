//! End-to-end tests over real WebSockets: upgrade auth, private and group routing, reconnects,
//! and notification push.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use social_hub::auth::{Claims, JwtAuthenticator};
use social_hub::config::HubSettings;
use social_hub::handlers::build_router;
use social_hub::hub::Hub;
use social_hub::metrics::HubMetrics;
use social_hub::models::NewNotification;
use social_hub::storage::MemoryStorage;
use social_hub::{AppState, UserId};

const SECRET: &[u8] = b"integration-test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    hub: Hub,
    storage: Arc<MemoryStorage>,
}

async fn start_server() -> TestServer {
    let storage = Arc::new(MemoryStorage::new());
    let metrics = HubMetrics::new().unwrap();
    let hub = Hub::new(HubSettings::default(), storage.clone(), metrics.clone())
        .unwrap();
    let state = AppState {
        hub: hub.clone(),
        auth: Arc::new(JwtAuthenticator::new(SECRET)),
        metrics,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, hub, storage }
}

fn token_for(user_id: UserId) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

impl TestServer {
    /// Connect as `user_id` and wait until the hub has registered that exact socket.
    async fn connect(&self, user_id: UserId) -> Client {
        let previous = self.hub.registry().lookup(user_id).map(|c| c.conn_id());
        let url = format!("ws://{}/ws?token={}", self.addr, token_for(user_id));
        let (ws, _) = connect_async(url).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let current = self.hub.registry().lookup(user_id).map(|c| c.conn_id());
                if current.is_some() && current != previous {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection never registered");
        ws
    }
}

async fn send(ws: &mut Client, v: Value) {
    ws.send(Message::Text(v.to_string().into())).await.unwrap();
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(t)))) => return serde_json::from_str(t.as_str()).unwrap(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// True if no text frame arrives within a short window.
async fn stays_quiet(ws: &mut Client) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_millis(200), ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(_) => return false,
        }
    }
}

#[tokio::test]
async fn upgrade_without_credentials_is_rejected() {
    let server = start_server().await;

    for url in [
        format!("ws://{}/ws", server.addr),
        format!("ws://{}/ws?token=garbage", server.addr),
    ] {
        let result = connect_async(url).await;
        assert!(matches!(
            result,
            Err(tokio_tungstenite::tungstenite::Error::Http(ref resp)) if resp.status() == 401
        ));
    }
    assert!(server.hub.registry().is_empty());
}

#[tokio::test]
async fn session_cookie_authenticates() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let server = start_server().await;
    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "cookie",
        format!("theme=dark; session_token={}", token_for(9)).parse().unwrap(),
    );
    let (_ws, resp) = connect_async(request).await.unwrap();
    assert_eq!(resp.status(), 101);
}

#[tokio::test]
async fn private_message_end_to_end() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;

    send(
        &mut a,
        json!({"type": "private", "sender_id": 42, "receiver_id": 2, "content": "hello"}),
    )
    .await;

    let frame = next_json(&mut b).await;
    assert_eq!(frame["type"], "private");
    assert_eq!(frame["sender_id"], 1);
    assert_eq!(frame["receiver_id"], 2);
    assert_eq!(frame["content"], "hello");
    assert!(frame["timestamp"].is_string());
    assert!(stays_quiet(&mut a).await);

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.storage.messages().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let stored = server.storage.messages();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_id, 1);
}

#[tokio::test]
async fn group_message_end_to_end() {
    let server = start_server().await;
    for uid in [1, 2, 3] {
        server.storage.add_member(5, uid);
    }
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    let mut c = server.connect(3).await;

    send(&mut a, json!({"type": "join_group", "group_id": 5})).await;
    send(&mut b, json!({"type": "join_group", "group_id": 5})).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.hub.registry().members(5).len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    send(&mut a, json!({"type": "group", "group_id": 5, "content": "hi all"})).await;

    let frame = next_json(&mut b).await;
    assert_eq!(frame["type"], "group");
    assert_eq!(frame["group_id"], 5);
    assert_eq!(frame["sender_id"], 1);
    assert!(stays_quiet(&mut c).await);
    assert!(stays_quiet(&mut a).await);
}

#[tokio::test]
async fn private_messages_arrive_in_send_order() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;

    for i in 0..30 {
        send(
            &mut a,
            json!({"type": "private", "receiver_id": 2, "content": i.to_string()}),
        )
        .await;
    }

    for i in 0..30 {
        let frame = next_json(&mut b).await;
        assert_eq!(frame["content"], i.to_string());
    }
}

#[tokio::test]
async fn second_connection_replaces_the_first() {
    let server = start_server().await;
    let mut first = server.connect(1).await;
    let mut second = server.connect(1).await;
    let mut sender = server.connect(2).await;

    // The replaced socket is closed by the server.
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    send(
        &mut sender,
        json!({"type": "private", "receiver_id": 1, "content": "which one?"}),
    )
    .await;
    let frame = next_json(&mut second).await;
    assert_eq!(frame["content"], "which one?");
    assert_eq!(server.hub.registry().len(), 2);
}

#[tokio::test]
async fn disconnect_removes_user_from_registry() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    a.close(None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.hub.registry().lookup(1).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn notification_push_online_and_offline() {
    let server = start_server().await;
    let mut b = server.connect(2).await;

    let stored = server
        .hub
        .notify(NewNotification::new(2, "follow_request", json!({"from": 1})))
        .await
        .unwrap();
    let frame = next_json(&mut b).await;
    assert_eq!(frame["type"], "notification");
    assert_eq!(frame["action"], "new");
    assert_eq!(frame["unread_count"], 1);
    assert_eq!(frame["notification"]["id"], stored.id);

    // Offline target: stored, nothing pushed, no error.
    let offline = server
        .hub
        .notify(NewNotification::new(3, "follow_request", json!({"from": 1})))
        .await;
    assert!(offline.is_ok());
    assert_eq!(server.storage.notifications().len(), 2);
    assert!(stays_quiet(&mut b).await);
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let server = start_server().await;
    let _a = server.connect(1).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let body = http_get(&mut stream, "/metrics").await;
    assert!(body.contains("hub_connections 1"));

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let body = http_get(&mut stream, "/health").await;
    assert!(body.ends_with("ok"));
}

async fn http_get(stream: &mut TcpStream, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    response
}
